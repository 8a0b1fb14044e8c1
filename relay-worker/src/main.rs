// ============================================================================
// Relay Worker
// ============================================================================
//
// Runs the relay against real backends:
// - RabbitMQ for the exchanges and queues
// - Redis for the dead-letter store and the append log
// - PostgreSQL for the message store (in-memory when DATABASE_URL is unset)
//
// The Redis append log gets its own client: a blocking XREADGROUP holds the
// connection it runs on, and the dead-letter store must not queue behind it.
//
// No session provider is wired in here, so the outbound consumer stays off
// and send commands wait on relay.outbound.
//
// ============================================================================

use anyhow::{Context, Result};
use relay_config::{Config, mask_credentials};
use relay_redis::RedisClient;
use relay_shared::broker::AmqpBroker;
use relay_shared::persistence::{MemoryMessageStore, MessageStore, PostgresMessageStore};
use relay_shared::runtime::{RelayBackends, RelayRuntime};
use relay_shared::storage::RedisKeyValueStore;
use relay_shared::stream_bridge::RedisStreamLog;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DATABASE_MAX_CONNECTIONS: u32 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.rust_log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Relay Worker Starting ===");
    info!("Broker: {}", config.broker.url_for_logging());
    info!("Inbound queue: {}", config.broker.inbound_queue);
    info!("Outbound queue: {}", config.broker.outbound_queue);
    info!("Redis: {}", mask_credentials(&config.redis_url));

    let broker = AmqpBroker::connect(&config.broker)
        .await
        .context("Failed to connect to broker")?;
    info!("Connected to broker");

    let kv_client = RedisClient::connect(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    let stream_client = RedisClient::connect(&config.redis_url)
        .await
        .context("Failed to create Redis stream connection")?;
    info!("Connected to Redis");

    let message_store: Arc<dyn MessageStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresMessageStore::connect(url, DATABASE_MAX_CONNECTIONS)
                .await
                .context("Failed to connect to database")?;
            info!("Connected to database");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set - messages are stored in memory only");
            Arc::new(MemoryMessageStore::new())
        }
    };

    let runtime = RelayRuntime::start(
        &config,
        RelayBackends {
            broker: Arc::new(broker),
            kv: Arc::new(RedisKeyValueStore::new(kv_client)),
            stream_log: Arc::new(RedisStreamLog::new(stream_client, config.stream.max_len)),
            message_store,
            sessions: None,
        },
    )
    .await
    .context("Failed to start relay")?;

    shutdown_signal().await;
    runtime.shutdown().await;

    match relay_metrics::gather_metrics() {
        Ok(snapshot) => debug!("Final metrics:\n{}", snapshot),
        Err(e) => warn!(error = %e, "Failed to gather metrics"),
    }
    info!("Relay worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, initiating graceful shutdown...");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("SIGINT received, initiating graceful shutdown...");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler - waiting for Ctrl-C only");
                tokio::signal::ctrl_c().await.ok();
                info!("SIGINT received, initiating graceful shutdown...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, initiating graceful shutdown...");
    }
}
