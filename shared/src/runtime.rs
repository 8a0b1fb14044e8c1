// ============================================================================
// Relay runtime
// ============================================================================
//
// Wires the components together and owns every long-running task:
//
//   inbound pump        session provider channel → relay.events
//   stream ingress      relay.inbound → append log
//   stream reader       append log → MessageStore
//   dead-letter ingest  relay.dead_letters → DeadLetterStore
//   dead-letter sweep   DeadLetterStore → original destination
//   limiter cleanup     evicts idle admission entries
//   outbound consumer   relay.outbound → SendCommandHandler (needs a provider)
//
// All tasks share one CancellationToken; shutdown cancels it and waits for
// each task to finish its current step.
//
// ============================================================================

use crate::broker::{Broker, ConsumerOptions, Producer, ReliableConsumer};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::commands::SendCommandHandler;
use crate::dead_letter::{DeadLetterIngestor, DeadLetterStore, RetryCoordinator};
use crate::persistence::MessageStore;
use crate::rate_limit::RateLimiterDedup;
use crate::sessions::{InboundPump, InboundSender, SessionProvider};
use crate::storage::KeyValueStore;
use crate::stream_bridge::{StreamBridge, StreamLog};
use relay_config::Config;
use relay_error::RelayResult;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bounded capacity of the provider → relay inbound channel
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Sender name stamped on everything the relay publishes
pub const RELAY_SENDER: &str = "relay";

/// Backends the runtime runs on
pub struct RelayBackends {
    pub broker: Arc<dyn Broker>,
    pub kv: Arc<dyn KeyValueStore>,
    pub stream_log: Arc<dyn StreamLog>,
    pub message_store: Arc<dyn MessageStore>,
    /// Without a provider there is nobody to send through, so the outbound
    /// consumer is not started
    pub sessions: Option<Arc<dyn SessionProvider>>,
}

pub struct RelayRuntime {
    token: CancellationToken,
    producer: Arc<Producer>,
    dead_letters: Arc<DeadLetterStore>,
    coordinator: Arc<RetryCoordinator>,
    limiter: Arc<RateLimiterDedup>,
    breakers: Arc<CircuitBreakerRegistry>,
    bridge: Arc<StreamBridge>,
    inbound: InboundSender,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RelayRuntime {
    /// Declare the topology and start every task
    pub async fn start(config: &Config, backends: RelayBackends) -> RelayResult<Self> {
        let token = CancellationToken::new();

        let producer = Arc::new(Producer::new(
            backends.broker,
            config.broker.clone(),
            &config.retry,
            RELAY_SENDER,
        ));
        producer.declare_topology().await?;
        tracing::info!(
            broker = %config.broker.url_for_logging(),
            inbound = %config.broker.inbound_queue,
            outbound = %config.broker.outbound_queue,
            dead_letters = %config.broker.dead_letter_queue,
            "Broker topology declared"
        );

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        // Inbound: provider → broker → log → store
        let (pump, inbound) = InboundPump::channel(Arc::clone(&producer), INBOUND_CHANNEL_CAPACITY);
        let pump_token = token.clone();
        tasks.push((
            "inbound-pump",
            tokio::spawn(async move {
                pump.run(pump_token).await;
            }),
        ));

        let bridge = StreamBridge::new(
            Arc::clone(&producer),
            backends.stream_log,
            backends.message_store,
            config.stream.clone(),
            token.clone(),
        );
        tasks.push(("stream-ingress", tokio::spawn(Arc::clone(&bridge).run_ingress())));
        tasks.push(("stream-reader", tokio::spawn(Arc::clone(&bridge).run_reader())));

        // Dead letters
        let dead_letters = Arc::new(DeadLetterStore::new(
            backends.kv,
            Arc::clone(&producer),
            config.dead_letter.clone(),
        ));
        let coordinator = RetryCoordinator::new(Arc::clone(&dead_letters));
        if config.dead_letter.enabled {
            let ingestor = DeadLetterIngestor::new(
                Arc::clone(&producer),
                Arc::clone(&dead_letters),
                config.retry.max_retries,
                token.clone(),
            );
            tasks.push(("dlq-ingest", tokio::spawn(ingestor.run())));
            tasks.push(("dlq-sweep", coordinator.spawn(token.clone())));
        } else {
            tracing::warn!("Dead-letter store disabled - failed messages stay on the broker's DLQ");
        }

        // Outbound
        let limiter = Arc::new(RateLimiterDedup::new(config.rate_limit.clone()));
        tasks.push(("rate-limit-cleanup", limiter.spawn_cleanup(token.clone())));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breakers.clone()));

        match backends.sessions {
            Some(sessions) => {
                let handler = SendCommandHandler::new(
                    sessions,
                    Arc::clone(&breakers),
                    Arc::clone(&limiter),
                    config.logging.clone(),
                );
                let consumer = ReliableConsumer::new(
                    Arc::clone(&producer),
                    Arc::new(handler),
                    ConsumerOptions {
                        queue: config.broker.outbound_queue.clone(),
                        consumer_tag: "relay-outbound".to_string(),
                        prefetch: config.broker.prefetch,
                        retry: config.retry.clone(),
                        dead_letter_enabled: config.dead_letter.enabled,
                    },
                    token.clone(),
                );
                tasks.push(("outbound-consumer", tokio::spawn(consumer.run())));
            }
            None => {
                tracing::info!("No session provider configured - outbound consumer disabled");
            }
        }

        tracing::info!(tasks = tasks.len(), "Relay runtime started");

        Ok(Self {
            token,
            producer,
            dead_letters,
            coordinator,
            limiter,
            breakers,
            bridge,
            inbound,
            tasks,
        })
    }

    pub fn producer(&self) -> &Arc<Producer> {
        &self.producer
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    pub fn coordinator(&self) -> &Arc<RetryCoordinator> {
        &self.coordinator
    }

    pub fn limiter(&self) -> &Arc<RateLimiterDedup> {
        &self.limiter
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn bridge(&self) -> &Arc<StreamBridge> {
        &self.bridge
    }

    /// Sender half for the session provider's inbound messages
    pub fn inbound_sender(&self) -> InboundSender {
        self.inbound.clone()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Stop every task and wait for them. Deliveries still unsettled go back
    /// to their queues.
    pub async fn shutdown(self) {
        tracing::info!("Relay runtime shutting down");
        self.token.cancel();
        drop(self.inbound);

        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "Task ended abnormally");
            }
        }
        tracing::info!("Relay runtime stopped");
    }
}
