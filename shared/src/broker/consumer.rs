// ============================================================================
// Reliable Consumer
// ============================================================================
//
// Per delivery: Received → Acked | Retried | DeadLettered | Discarded
//
// - Handler success                  → ack
// - Retryable failure, budget left   → wait (backoff or hint), republish to the
//                                      same queue with retryCount + 1, then ack
// - Terminal failure or budget spent → publish to the DLX with failure
//                                      headers, then ack
// - DLX publish fails                → nack without requeue, log the payload
//                                      at error level (target "dlq")
//
// The original delivery is only acked once its replacement is safely on the
// broker, so at any moment exactly one copy is in flight. Retry waits run on
// their own task; the consumer keeps pulling other deliveries meanwhile,
// bounded by prefetch. Cancelling the consumer nacks pending retries with
// requeue so the broker redelivers them.
//
// ============================================================================

use super::producer::{Producer, PublishOptions};
use super::subscription::Subscription;
use super::{BrokerError, Delivery, HeaderValue, Headers, MessageProperties};
use crate::circuit_breaker::CircuitBreakerError;
use crate::scheduler::sleep_or_cancel;
use async_trait::async_trait;
use chrono::Utc;
use relay_config::RetryConfig;
use relay_error::{Disposition, ErrorKind, RelayError};
use relay_metrics::{CONSUMER_OUTCOMES_TOTAL, MESSAGES_DISCARDED_TOTAL};
use relay_types::{QueueMessage, headers, iso_timestamp};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Failure reported by a message handler
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DeliveryError {
    pub kind: ErrorKind,
    pub message: String,
    /// Overrides the backoff delay for the next attempt
    pub retry_after: Option<Duration>,
    /// Extra headers carried by the retried or dead-lettered copy
    pub retry_headers: Headers,
}

impl DeliveryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            retry_headers: Headers::new(),
        }
    }

    /// Error without a structured kind; classified by message pattern
    pub fn opaque(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorKind::classify_opaque(&message), message)
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn with_retry_header(mut self, name: &str, value: impl Into<HeaderValue>) -> Self {
        self.retry_headers.insert(name.to_string(), value.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<RelayError> for DeliveryError {
    fn from(err: RelayError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<BrokerError> for DeliveryError {
    fn from(err: BrokerError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl<E> From<CircuitBreakerError<E>> for DeliveryError
where
    E: Into<DeliveryError>,
{
    fn from(err: CircuitBreakerError<E>) -> Self {
        match err {
            CircuitBreakerError::Open { remaining, .. } => Self::new(
                ErrorKind::CircuitOpen,
                format!(
                    "circuit breaker open, retry in {}s",
                    remaining.as_millis().div_ceil(1000)
                ),
            )
            .with_retry_after(remaining),
            CircuitBreakerError::Timeout { service, timeout } => Self::new(
                ErrorKind::Timeout,
                format!("{} call timed out after {:?}", service, timeout),
            ),
            CircuitBreakerError::Inner(inner) => inner.into(),
        }
    }
}

/// Successful handler result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Done,
    /// Intentionally not processed (e.g. duplicate); acked all the same
    Skipped(String),
}

/// Where a delivery came from
#[derive(Debug, Clone, Copy)]
pub struct DeliveryInfo<'a> {
    pub queue: &'a str,
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub redelivered: bool,
    pub properties: &'a MessageProperties,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: &QueueMessage,
        info: DeliveryInfo<'_>,
    ) -> Result<HandlerOutcome, DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub queue: String,
    pub consumer_tag: String,
    pub prefetch: u16,
    pub retry: RetryConfig,
    /// Publish terminal failures to the DLX with context. When off, they are
    /// nacked and left to the queue's own dead-letter arguments.
    pub dead_letter_enabled: bool,
}

/// Final state of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Acked,
    Skipped,
    /// Handed to a retry task; settled later
    Retried,
    DeadLettered,
    Discarded,
}

impl Resolution {
    fn as_str(&self) -> &'static str {
        match self {
            Resolution::Acked => "acked",
            Resolution::Skipped => "skipped",
            Resolution::Retried => "retried",
            Resolution::DeadLettered => "dead_lettered",
            Resolution::Discarded => "discarded",
        }
    }
}

pub struct ReliableConsumer {
    producer: Arc<Producer>,
    handler: Arc<dyn MessageHandler>,
    options: ConsumerOptions,
    token: CancellationToken,
}

impl ReliableConsumer {
    pub fn new(
        producer: Arc<Producer>,
        handler: Arc<dyn MessageHandler>,
        options: ConsumerOptions,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            producer,
            handler,
            options,
            token,
        })
    }

    pub fn queue(&self) -> &str {
        &self.options.queue
    }

    /// Consume until cancelled, resubscribing after connection loss
    pub async fn run(self: Arc<Self>) {
        let subscription = Subscription::new(
            self.options.queue.clone(),
            self.options.consumer_tag.clone(),
            self.options.prefetch,
        );
        let consumer = Arc::clone(&self);
        subscription
            .run(&self.producer, &self.token, move |delivery| {
                let consumer = Arc::clone(&consumer);
                async move {
                    consumer.process(delivery).await;
                }
            })
            .await;
    }

    /// Resolve one delivery
    pub async fn process(self: Arc<Self>, delivery: Delivery) -> Resolution {
        let resolution = match serde_json::from_slice::<QueueMessage>(&delivery.body) {
            Err(e) => {
                let error =
                    DeliveryError::new(ErrorKind::Validation, format!("invalid envelope: {}", e));
                let max_retries = self.options.retry.max_retries;
                self.dead_letter(&delivery, 0, max_retries, &error).await
            }
            Ok(message) => {
                let info = DeliveryInfo {
                    queue: &self.options.queue,
                    exchange: &delivery.exchange,
                    routing_key: &delivery.routing_key,
                    redelivered: delivery.redelivered,
                    properties: &delivery.properties,
                };
                let result = self.handler.handle(&message, info).await;
                match result {
                    Ok(HandlerOutcome::Done) => {
                        self.settle_ack(&delivery, &message, Resolution::Acked).await
                    }
                    Ok(HandlerOutcome::Skipped(reason)) => {
                        tracing::info!(
                            message_id = %message.id,
                            queue = %self.options.queue,
                            reason = %reason,
                            "Message skipped"
                        );
                        self.settle_ack(&delivery, &message, Resolution::Skipped).await
                    }
                    Err(error) => Arc::clone(&self).on_failure(delivery, message, error).await,
                }
            }
        };

        CONSUMER_OUTCOMES_TOTAL
            .with_label_values(&[self.options.queue.as_str(), resolution.as_str()])
            .inc();
        resolution
    }

    async fn settle_ack(
        &self,
        delivery: &Delivery,
        message: &QueueMessage,
        resolution: Resolution,
    ) -> Resolution {
        if let Err(e) = delivery.ack().await {
            // The broker will redeliver; the handler must tolerate the repeat
            tracing::warn!(message_id = %message.id, error = %e, "Ack failed");
        } else {
            tracing::debug!(message_id = %message.id, queue = %self.options.queue, "Message acked");
        }
        resolution
    }

    async fn on_failure(
        self: Arc<Self>,
        delivery: Delivery,
        message: QueueMessage,
        error: DeliveryError,
    ) -> Resolution {
        let retry_count = message.metadata.retry_count;
        let max_retries = message.metadata.max_retries;

        if !error.is_retryable() || message.retries_exhausted() {
            if error.is_retryable() {
                tracing::warn!(
                    message_id = %message.id,
                    retry_count,
                    max_retries,
                    error = %error,
                    "Retries exhausted - dead-lettering"
                );
            } else {
                tracing::error!(
                    message_id = %message.id,
                    error = %error,
                    error_type = error.kind.as_str(),
                    "Terminal failure - dead-lettering"
                );
            }
            return self
                .dead_letter(&delivery, retry_count, max_retries, &error)
                .await;
        }

        if error.kind.disposition() == Disposition::Reconnect {
            if let Err(e) = self.producer.recover().await {
                tracing::warn!(error = %e, "Reconnect before retry failed");
            }
        }

        let delay = self.retry_delay(&error, retry_count);
        tracing::warn!(
            message_id = %message.id,
            queue = %self.options.queue,
            retry_count,
            max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            error_type = error.kind.as_str(),
            "Handler failed - scheduling retry"
        );

        let carried = error.retry_headers;
        let consumer = Arc::clone(&self);
        tokio::spawn(async move {
            consumer.republish_after(delay, delivery, message, carried).await;
        });
        Resolution::Retried
    }

    fn retry_delay(&self, error: &DeliveryError, retry_count: u32) -> Duration {
        if let Some(hint) = error.retry_after {
            return hint;
        }
        match error.kind {
            ErrorKind::ResourceLocked => self.options.retry.resource_locked_delay,
            _ => self.options.retry.backoff_delay(retry_count),
        }
    }

    async fn republish_after(
        &self,
        delay: Duration,
        delivery: Delivery,
        message: QueueMessage,
        carried: Headers,
    ) {
        if !sleep_or_cancel(delay, &self.token).await {
            // Shutting down: hand it back to the broker untouched
            if let Err(e) = delivery.nack(true).await {
                tracing::debug!(message_id = %message.id, error = %e, "Requeue on shutdown failed");
            }
            return;
        }

        let next = message.next_attempt();
        let mut options = PublishOptions::for_envelope(&next);
        options.headers.extend(carried);
        options = options.with_header(headers::RETRY_COUNT, next.metadata.retry_count);
        let (exchange, routing_key) = original_destination(&delivery);
        options = options
            .with_header(headers::ORIGINAL_EXCHANGE, exchange)
            .with_header(headers::ORIGINAL_ROUTING_KEY, routing_key);

        match self
            .producer
            .publish("", &self.options.queue, &next, options)
            .await
        {
            Ok(true) => {
                if let Err(e) = delivery.ack().await {
                    tracing::warn!(message_id = %message.id, error = %e, "Ack after retry publish failed");
                }
                tracing::debug!(
                    message_id = %next.id,
                    retry_count = next.metadata.retry_count,
                    "Message republished for retry"
                );
            }
            Ok(false) | Err(_) => {
                tracing::warn!(
                    message_id = %message.id,
                    "Retry publish failed - returning delivery to the queue"
                );
                if let Err(e) = delivery.nack(true).await {
                    tracing::warn!(message_id = %message.id, error = %e, "Requeue failed");
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        retry_count: u32,
        max_retries: u32,
        error: &DeliveryError,
    ) -> Resolution {
        let message_id = delivery.properties.message_id.clone().unwrap_or_default();

        if !self.options.dead_letter_enabled {
            if let Err(e) = delivery.nack(false).await {
                tracing::warn!(message_id = %message_id, error = %e, "Nack failed");
            }
            return Resolution::DeadLettered;
        }

        let (exchange, routing_key) = original_destination(delivery);
        let mut options = PublishOptions {
            message_id: delivery.properties.message_id.clone(),
            ..Default::default()
        }
        .with_header(headers::RETRY_COUNT, retry_count)
        .with_header(headers::MAX_RETRIES, max_retries)
        .with_header(headers::ERROR_MESSAGE, error.message.as_str())
        .with_header(headers::ERROR_TYPE, error.kind.as_str())
        .with_header(headers::FAILED_AT, iso_timestamp(Utc::now()))
        .with_header(headers::ORIGINAL_EXCHANGE, exchange)
        .with_header(headers::ORIGINAL_ROUTING_KEY, routing_key)
        .with_header(headers::ORIGINAL_QUEUE, self.options.queue.as_str());
        for name in [headers::TENANT_ID, headers::MESSAGE_TYPE, headers::SENDER] {
            if let Some(value) = delivery.properties.headers.get(name) {
                options.headers.insert(name.to_string(), value.clone());
            }
        }
        for (name, value) in &error.retry_headers {
            options.headers.entry(name.clone()).or_insert_with(|| value.clone());
        }

        let published = self
            .producer
            .publish_bytes(
                &self.producer.config().dead_letter_exchange,
                &self.options.queue,
                delivery.body.clone(),
                options,
            )
            .await;

        match published {
            Ok(true) => {
                if let Err(e) = delivery.ack().await {
                    tracing::warn!(message_id = %message_id, error = %e, "Ack after dead-letter failed");
                }
                tracing::info!(
                    message_id = %message_id,
                    queue = %self.options.queue,
                    retry_count,
                    error_type = error.kind.as_str(),
                    "Message dead-lettered"
                );
                Resolution::DeadLettered
            }
            Ok(false) | Err(_) => {
                if let Err(e) = delivery.nack(false).await {
                    tracing::warn!(message_id = %message_id, error = %e, "Nack failed");
                }
                MESSAGES_DISCARDED_TOTAL.inc();
                tracing::error!(
                    target: "dlq",
                    message_id = %message_id,
                    queue = %self.options.queue,
                    retry_count,
                    error = %error,
                    payload = %String::from_utf8_lossy(&delivery.body),
                    "Dead-letter publish failed - message DISCARDED"
                );
                Resolution::Discarded
            }
        }
    }
}

/// Exchange and routing key the message was first published to. Retries go
/// through the default exchange, so the original is carried in headers.
fn original_destination(delivery: &Delivery) -> (String, String) {
    let exchange = delivery
        .properties
        .header_str(headers::ORIGINAL_EXCHANGE)
        .map(str::to_string)
        .unwrap_or_else(|| delivery.exchange.clone());
    let routing_key = delivery
        .properties
        .header_str(headers::ORIGINAL_ROUTING_KEY)
        .map(str::to_string)
        .unwrap_or_else(|| delivery.routing_key.clone());
    (exchange, routing_key)
}
