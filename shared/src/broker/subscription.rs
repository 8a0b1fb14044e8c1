use super::producer::{Producer, reconnect_delay};
use super::Delivery;
use crate::scheduler::sleep_or_cancel;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// A long-lived subscription to one queue.
///
/// Resubscribes whenever the delivery stream ends (connection loss), going
/// through the producer's reconnect path so topology is re-declared first.
/// Stops only when the token is cancelled; deliveries not yet settled at that
/// point go back to the queue.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub queue: String,
    pub consumer_tag: String,
    pub prefetch: u16,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, consumer_tag: impl Into<String>, prefetch: u16) -> Self {
        Self {
            queue: queue.into(),
            consumer_tag: consumer_tag.into(),
            prefetch: prefetch.max(1),
        }
    }

    pub async fn run<F, Fut>(&self, producer: &Producer, token: &CancellationToken, mut on_delivery: F)
    where
        F: FnMut(Delivery) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut failures: u32 = 0;

        while !token.is_cancelled() {
            let consumed = producer
                .broker()
                .consume(&self.queue, &self.consumer_tag, self.prefetch)
                .await;

            let mut stream = match consumed {
                Ok(stream) => {
                    failures = 0;
                    stream
                }
                Err(e) => {
                    tracing::warn!(queue = %self.queue, error = %e, "Failed to start consumer");
                    if e.is_connection_error() {
                        if let Err(e) = producer.recover().await {
                            tracing::error!(queue = %self.queue, error = %e, "Broker unavailable");
                        }
                    }
                    let delay = reconnect_delay(producer.config(), failures);
                    failures = failures.saturating_add(1);
                    if !sleep_or_cancel(delay, token).await {
                        break;
                    }
                    continue;
                }
            };

            tracing::info!(
                queue = %self.queue,
                consumer_tag = %self.consumer_tag,
                prefetch = self.prefetch,
                "Consumer started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(delivery) => on_delivery(delivery).await,
                        None => {
                            tracing::warn!(queue = %self.queue, "Delivery stream ended - resubscribing");
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!(queue = %self.queue, "Consumer stopped");
    }
}
