use super::{
    Broker, BrokerError, BrokerResult, HeaderValue, Headers, MessageProperties, OutgoingMessage,
    Topology,
};
use chrono::Utc;
use relay_config::{BrokerConfig, RetryConfig};
use relay_metrics::{BROKER_RECONNECTS_TOTAL, MESSAGES_PUBLISHED_TOTAL, PUBLISH_FAILURES_TOTAL};
use relay_types::{DomainEvent, EventKind, Priority, QueueMessage, headers, iso_timestamp};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Per-publish metadata stamped into properties and headers
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Defaults to a fresh UUID
    pub message_id: Option<String>,
    pub message_type: Option<EventKind>,
    pub tenant_id: Option<String>,
    /// Defaults to the producer's own sender name
    pub sender: Option<String>,
    pub priority: Option<Priority>,
    /// Extra headers, applied last
    pub headers: Headers,
}

impl PublishOptions {
    pub fn with_header(mut self, name: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    /// Options mirroring an envelope's own metadata
    pub fn for_envelope(message: &QueueMessage) -> Self {
        Self {
            message_id: Some(message.id.clone()),
            message_type: message.metadata.message_type,
            tenant_id: message.metadata.tenant_id.clone(),
            sender: Some(message.metadata.sender.clone()),
            priority: Some(message.metadata.priority),
            headers: Headers::new(),
        }
    }
}

/// Broker message producer
///
/// - Declares the relay topology and keeps track of queues added later via
///   `send_to_queue`, so everything is re-declared after a reconnect
/// - Publishes persistent messages and waits for the broker's confirm
/// - Fails closed: a rejected publish is logged and reported as `Ok(false)`;
///   only a connection that cannot be re-established is an `Err`
pub struct Producer {
    broker: Arc<dyn Broker>,
    config: BrokerConfig,
    max_retries: u32,
    sender: String,
    topology: Mutex<Topology>,
    reconnect_lock: tokio::sync::Mutex<()>,
}

impl Producer {
    pub fn new(
        broker: Arc<dyn Broker>,
        config: BrokerConfig,
        retry: &RetryConfig,
        sender: impl Into<String>,
    ) -> Self {
        let topology = Topology::from_config(&config);
        Self {
            broker,
            config,
            max_retries: retry.max_retries,
            sender: sender.into(),
            topology: Mutex::new(topology),
            reconnect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn topology(&self) -> Topology {
        self.topology
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Declare the full topology (idempotent)
    pub async fn declare_topology(&self) -> BrokerResult<()> {
        let topology = self.topology();
        topology.declare_all(self.broker.as_ref()).await
    }

    /// Serialize `payload` as JSON and publish it
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        options: PublishOptions,
    ) -> BrokerResult<bool>
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_vec(payload) {
            Ok(body) => self.publish_bytes(exchange, routing_key, body, options).await,
            Err(e) => {
                tracing::error!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    error = %e,
                    "Failed to serialize payload - not published"
                );
                PUBLISH_FAILURES_TOTAL
                    .with_label_values(&["VALIDATION"])
                    .inc();
                Ok(false)
            }
        }
    }

    /// Publish a pre-serialized body
    pub async fn publish_bytes(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> BrokerResult<bool> {
        let message = self.stamp(body, options);
        let message_id = message.properties.message_id.clone().unwrap_or_default();

        match self.publish_with_recovery(exchange, routing_key, message).await {
            Ok(()) => {
                MESSAGES_PUBLISHED_TOTAL.with_label_values(&[exchange]).inc();
                tracing::debug!(
                    message_id = %message_id,
                    exchange = %exchange,
                    routing_key = %routing_key,
                    "Message published"
                );
                Ok(true)
            }
            Err(e) if e.is_connection_error() => {
                PUBLISH_FAILURES_TOTAL
                    .with_label_values(&[e.kind().as_str()])
                    .inc();
                Err(e)
            }
            Err(e) => {
                PUBLISH_FAILURES_TOTAL
                    .with_label_values(&[e.kind().as_str()])
                    .inc();
                tracing::warn!(
                    message_id = %message_id,
                    exchange = %exchange,
                    routing_key = %routing_key,
                    error = %e,
                    error_type = e.kind().as_str(),
                    "Publish rejected by broker"
                );
                Ok(false)
            }
        }
    }

    /// Publish a queue envelope, stamping headers from its metadata
    pub async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &QueueMessage,
    ) -> BrokerResult<bool> {
        let options = PublishOptions::for_envelope(message);
        self.publish(exchange, routing_key, message, options).await
    }

    /// Publish a domain event on the exchange matching its kind
    pub async fn publish_event(&self, event: DomainEvent, priority: Priority) -> BrokerResult<bool> {
        let (exchange, queue) = match event.kind {
            EventKind::MessageReceived => (&self.config.events_exchange, &self.config.inbound_queue),
            EventKind::SendCommand => (&self.config.commands_exchange, &self.config.outbound_queue),
        };
        let routing_key = event.routing_key.clone();
        let envelope = event.into_queue_message(&self.sender, priority, self.max_retries, queue);
        self.publish_envelope(exchange, &routing_key, &envelope).await
    }

    /// Publish straight to a queue via the default exchange, declaring the
    /// queue (with its dead-letter binding) first if it is new.
    pub async fn send_to_queue<T>(
        &self,
        queue: &str,
        payload: &T,
        options: PublishOptions,
    ) -> BrokerResult<bool>
    where
        T: Serialize + ?Sized,
    {
        if let Err(e) = self.ensure_queue(queue).await {
            if e.is_connection_error() {
                return Err(e);
            }
            tracing::warn!(queue = %queue, error = %e, "Queue declaration failed - not sending");
            return Ok(false);
        }
        self.publish("", queue, payload, options).await
    }

    async fn ensure_queue(&self, queue: &str) -> BrokerResult<()> {
        let spec = Topology::application_queue(&self.config, queue);
        let dead_letter_binding = super::Binding::new(
            &self.config.dead_letter_queue,
            &self.config.dead_letter_exchange,
            queue,
        );

        let (spec, dead_letter_binding) = (&spec, &dead_letter_binding);
        self.with_recovery(move || async move {
            self.broker.declare_queue(spec).await?;
            self.broker.bind_queue(dead_letter_binding).await
        })
        .await?;

        self.topology
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .add_application_queue(&self.config, queue, None);
        Ok(())
    }

    fn stamp(&self, body: Vec<u8>, options: PublishOptions) -> OutgoingMessage {
        let now = Utc::now();
        let mut headers = Headers::new();
        headers.insert(
            headers::SENDER.to_string(),
            HeaderValue::from(options.sender.unwrap_or_else(|| self.sender.clone())),
        );
        headers.insert(
            headers::PUBLISHED_AT.to_string(),
            HeaderValue::from(iso_timestamp(now)),
        );
        if let Some(kind) = options.message_type {
            headers.insert(headers::MESSAGE_TYPE.to_string(), HeaderValue::from(kind.as_str()));
        }
        if let Some(tenant) = options.tenant_id {
            headers.insert(headers::TENANT_ID.to_string(), HeaderValue::from(tenant));
        }
        headers.extend(options.headers);

        OutgoingMessage {
            body,
            properties: MessageProperties {
                message_id: Some(
                    options
                        .message_id
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                ),
                timestamp: Some(now.timestamp().max(0) as u64),
                content_type: Some("application/json".to_string()),
                priority: options.priority.map(|p| p.as_amqp()),
                persistent: true,
                headers,
            },
        }
    }

    async fn publish_with_recovery(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> BrokerResult<()> {
        let message = &message;
        self.with_recovery(move || self.broker.publish(exchange, routing_key, message.clone()))
            .await
    }

    /// Run `op`; on a missing connection reconnect (re-declaring topology)
    /// and run it once more.
    async fn with_recovery<F, Fut>(&self, op: F) -> BrokerResult<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = BrokerResult<()>>,
    {
        if !self.broker.is_connected() {
            self.recover().await?;
        }
        match op().await {
            Err(e) if e.is_connection_error() => {
                tracing::warn!(error = %e, "Broker connection lost - reconnecting");
                self.recover().await?;
                op().await
            }
            other => other,
        }
    }

    /// Reconnect with bounded exponential backoff, then re-declare topology.
    /// Concurrent callers wait for the one doing the work.
    pub async fn recover(&self) -> BrokerResult<()> {
        let _guard = self.reconnect_lock.lock().await;
        if self.broker.is_connected() {
            return Ok(());
        }

        let attempts = self.config.reconnect_max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.broker.reconnect().await {
                Ok(()) => {
                    BROKER_RECONNECTS_TOTAL.inc();
                    tracing::info!(attempt = attempt + 1, "Broker reconnected");
                    self.declare_topology().await?;
                    return Ok(());
                }
                Err(e) => {
                    let delay = reconnect_delay(&self.config, attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker reconnect failed"
                    );
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        tracing::error!(attempts, "Giving up on broker reconnect");
        Err(last_error.unwrap_or_else(|| {
            BrokerError::ConnectionClosed("reconnect attempts exhausted".to_string())
        }))
    }
}

/// `base × 2^attempt`, capped at the configured maximum
pub(crate) fn reconnect_delay(config: &BrokerConfig, attempt: u32) -> std::time::Duration {
    config
        .reconnect_base_delay
        .checked_mul(2u32.saturating_pow(attempt))
        .unwrap_or(config.reconnect_max_delay)
        .min(config.reconnect_max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use relay_error::ErrorKind;
    use std::time::Duration;

    fn producer(broker: &MemoryBroker) -> Producer {
        let config = BrokerConfig {
            reconnect_base_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(40),
            reconnect_max_attempts: 3,
            ..BrokerConfig::default()
        };
        Producer::new(
            Arc::new(broker.clone()),
            config,
            &RetryConfig::default(),
            "relay-test",
        )
    }

    #[tokio::test]
    async fn test_publish_stamps_id_timestamp_and_headers() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker);
        producer.declare_topology().await.unwrap();

        let options = PublishOptions {
            message_type: Some(EventKind::MessageReceived),
            tenant_id: Some("acme".to_string()),
            ..Default::default()
        };
        let ok = producer
            .publish("relay.events", "message.received", &serde_json::json!({"a": 1}), options)
            .await
            .unwrap();
        assert!(ok);

        let queued = broker.messages("relay.inbound");
        assert_eq!(queued.len(), 1);
        let props = &queued[0].message.properties;
        assert!(props.message_id.is_some());
        assert!(props.persistent);
        assert_eq!(props.header_str(headers::MESSAGE_TYPE), Some("message-received"));
        assert_eq!(props.header_str(headers::TENANT_ID), Some("acme"));
        assert_eq!(props.header_str(headers::SENDER), Some("relay-test"));
        assert!(props.header_str(headers::PUBLISHED_AT).unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn test_rejected_publish_fails_closed() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker);
        producer.declare_topology().await.unwrap();
        broker.fail_publishes_to("relay.events", ErrorKind::AccessRefused);

        let ok = producer
            .publish("relay.events", "message.received", "x", PublishOptions::default())
            .await
            .unwrap();
        assert!(!ok);

        // Undeclared exchange is a rejection, not an error
        let ok = producer
            .publish("missing", "k", "x", PublishOptions::default())
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_send_to_queue_declares_dead_letter_binding() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker);
        producer.declare_topology().await.unwrap();

        for _ in 0..2 {
            assert!(producer
                .send_to_queue("relay.adhoc", "hi", PublishOptions::default())
                .await
                .unwrap());
        }

        assert_eq!(broker.queue_depth("relay.adhoc"), 2);
        let spec = broker.queue_spec("relay.adhoc").unwrap();
        assert_eq!(spec.arguments.dead_letter_exchange.as_deref(), Some("relay.dlx"));
        assert!(producer.topology().contains_queue("relay.adhoc"));
        assert_eq!(
            broker
                .bindings()
                .iter()
                .filter(|b| b.routing_key == "relay.adhoc")
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_and_redeclares_after_drop() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker);
        producer.declare_topology().await.unwrap();
        let declared = broker.declaration_count();

        broker.disconnect();
        broker.refuse_reconnects(2);

        let ok = producer
            .publish("relay.events", "message.received", "x", PublishOptions::default())
            .await
            .unwrap();
        assert!(ok);
        assert!(broker.is_connected());
        assert!(broker.declaration_count() > declared);
        assert_eq!(broker.queue_depth("relay.inbound"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_bounded_attempts() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker);
        producer.declare_topology().await.unwrap();

        broker.disconnect();
        broker.refuse_reconnects(10);

        let err = producer
            .publish("relay.events", "message.received", "x", PublishOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        let config = BrokerConfig {
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_millis(250),
            ..BrokerConfig::default()
        };
        assert_eq!(reconnect_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(reconnect_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(reconnect_delay(&config, 5), Duration::from_millis(250));
    }
}
