use super::record::DeadLetterRecord;
use super::store::DeadLetterStore;
use crate::broker::{Delivery, Producer, Subscription};
use crate::scheduler::sleep_or_cancel;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Moves messages from the dead-letter queue into the dead-letter store.
///
/// A delivery is acked only once its record is parked. If parking fails the
/// delivery is requeued after `park_retry_delay`, which also keeps a broken
/// store from spinning the loop.
pub struct DeadLetterIngestor {
    producer: Arc<Producer>,
    store: Arc<DeadLetterStore>,
    default_max_retries: u32,
    park_retry_delay: Duration,
    token: CancellationToken,
}

impl DeadLetterIngestor {
    pub fn new(
        producer: Arc<Producer>,
        store: Arc<DeadLetterStore>,
        default_max_retries: u32,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            producer,
            store,
            default_max_retries,
            park_retry_delay: Duration::from_secs(1),
            token,
        })
    }

    pub async fn run(self: Arc<Self>) {
        let queue = self.producer.config().dead_letter_queue.clone();
        let subscription = Subscription::new(queue, "relay-dlq-ingest", 10);
        let ingestor = Arc::clone(&self);
        subscription
            .run(&self.producer, &self.token, move |delivery| {
                let ingestor = Arc::clone(&ingestor);
                async move {
                    ingestor.ingest(delivery).await;
                }
            })
            .await;
    }

    /// Park one dead letter; returns whether it was stored
    pub async fn ingest(&self, delivery: Delivery) -> bool {
        let record = DeadLetterRecord::from_delivery(&delivery, self.default_max_retries);

        match self.store.park(&record).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    tracing::warn!(message_id = %record.id, error = %e, "Ack of parked dead letter failed");
                }
                true
            }
            Err(e) => {
                tracing::error!(
                    message_id = %record.id,
                    error = %e,
                    "Failed to park dead letter - requeueing"
                );
                sleep_or_cancel(self.park_retry_delay, &self.token).await;
                if let Err(e) = delivery.nack(true).await {
                    tracing::warn!(message_id = %record.id, error = %e, "Requeue of dead letter failed");
                }
                false
            }
        }
    }
}
