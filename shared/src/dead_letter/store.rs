use super::record::{ArchiveAction, ArchiveEntry, DeadLetterRecord};
use crate::broker::Producer;
use crate::storage::KeyValueStore;
use chrono::{DateTime, NaiveDate, Utc};
use relay_config::DeadLetterConfig;
use relay_error::{RelayError, RelayResult};
use relay_metrics::DEAD_LETTERS_PARKED_TOTAL;
use std::sync::Arc;

/// Durable parking lot for undeliverable messages.
///
/// Layout (with the default `dlq:` prefix):
/// - `dlq:message:<id>`          JSON record, expires after 7 days
/// - `dlq:index`                 sorted set of ids by park time (ms)
/// - `dlq:archive:<YYYY-MM-DD>`  audit list of `ArchiveEntry`, 30 days
pub struct DeadLetterStore {
    kv: Arc<dyn KeyValueStore>,
    producer: Arc<Producer>,
    config: DeadLetterConfig,
}

impl DeadLetterStore {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        producer: Arc<Producer>,
        config: DeadLetterConfig,
    ) -> Self {
        Self {
            kv,
            producer,
            config,
        }
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    fn message_key(&self, id: &str) -> String {
        format!("{}message:{}", self.config.key_prefix, id)
    }

    fn index_key(&self) -> String {
        format!("{}index", self.config.key_prefix)
    }

    fn archive_key(&self, day: NaiveDate) -> String {
        format!("{}archive:{}", self.config.key_prefix, day.format("%Y-%m-%d"))
    }

    /// Store a record and note it in today's archive list. Parking an id that
    /// is already parked replaces the record.
    pub async fn park(&self, record: &DeadLetterRecord) -> RelayResult<()> {
        self.write(record).await?;
        self.append_archive(ArchiveAction::Parked, record).await?;

        DEAD_LETTERS_PARKED_TOTAL.inc();
        tracing::info!(
            message_id = %record.id,
            original_queue = %record.original_queue,
            retry_count = record.retry_count,
            max_retries = record.max_retries,
            error = %record.error,
            "Dead letter parked"
        );
        Ok(())
    }

    pub async fn get(&self, id: &str) -> RelayResult<Option<DeadLetterRecord>> {
        let Some(json) = self.kv.get(&self.message_key(id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "Unreadable dead-letter record");
                Err(e.into())
            }
        }
    }

    /// Up to `limit` parked records, oldest first. Index entries whose record
    /// has expired are pruned on the way.
    pub async fn list(&self, limit: usize) -> RelayResult<Vec<DeadLetterRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let index = self.index_key();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let ids = self.kv.zrange(&index, 0, stop).await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {
                    tracing::debug!(message_id = %id, "Dead-letter record expired - pruning index");
                    self.kv.zrem(&index, &id).await?;
                }
                // Skip corrupt records rather than stalling the whole sweep
                Err(RelayError::Json(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    pub async fn count(&self) -> RelayResult<usize> {
        self.kv.zcard(&self.index_key()).await
    }

    /// Republish a parked record to its original destination.
    ///
    /// Refuses terminal records. The bumped retry count is persisted before
    /// publishing, so a crash mid-retry never hands out extra attempts. On a
    /// successful publish the record leaves the store; if the message fails
    /// again it comes back through the dead-letter queue.
    pub async fn retry(&self, id: &str) -> RelayResult<bool> {
        let Some(mut record) = self.get(id).await? else {
            tracing::warn!(message_id = %id, "Retry requested for unknown dead letter");
            return Ok(false);
        };

        if record.is_terminal() {
            tracing::warn!(
                message_id = %id,
                retry_count = record.retry_count,
                max_retries = record.max_retries,
                "Dead letter has no retries left"
            );
            return Ok(false);
        }

        record.retry_count += 1;
        record.last_error_timestamp = Utc::now();
        self.write(&record).await?;

        let (body, options) = record.republish_body();
        let (exchange, routing_key) = record.destination();
        let published = self
            .producer
            .publish_bytes(exchange, routing_key, body, options)
            .await?;

        if !published {
            tracing::warn!(message_id = %id, exchange = %exchange, "Dead-letter retry publish rejected");
            return Ok(false);
        }

        self.append_archive(ArchiveAction::Retried, &record).await?;
        self.remove(id).await?;
        tracing::info!(
            message_id = %id,
            exchange = %exchange,
            routing_key = %routing_key,
            retry_count = record.retry_count,
            "Dead letter republished"
        );
        Ok(true)
    }

    /// Move a record to cold storage. Returns `false` if it was not parked.
    pub async fn archive(&self, id: &str) -> RelayResult<bool> {
        self.retire(id, ArchiveAction::Archived).await
    }

    /// Drop a record, leaving an audit entry. Returns `false` if it was not
    /// parked.
    pub async fn delete(&self, id: &str) -> RelayResult<bool> {
        self.retire(id, ArchiveAction::Purged).await
    }

    /// Audit entries for one day
    pub async fn archived(&self, day: NaiveDate) -> RelayResult<Vec<ArchiveEntry>> {
        let entries = self.kv.lrange(&self.archive_key(day), 0, -1).await?;
        Ok(entries
            .iter()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect())
    }

    async fn retire(&self, id: &str, action: ArchiveAction) -> RelayResult<bool> {
        let Some(record) = self.get(id).await? else {
            // Still drop a dangling index entry
            self.kv.zrem(&self.index_key(), id).await?;
            return Ok(false);
        };
        self.append_archive(action, &record).await?;
        self.remove(id).await?;
        tracing::info!(message_id = %id, action = ?action, "Dead letter retired");
        Ok(true)
    }

    async fn write(&self, record: &DeadLetterRecord) -> RelayResult<()> {
        let json = serde_json::to_string(record)?;
        self.kv
            .set_ex(&self.message_key(&record.id), &json, self.config.record_ttl)
            .await?;
        self.kv
            .zadd(&self.index_key(), &record.id, record.timestamp.timestamp_millis())
            .await
    }

    async fn remove(&self, id: &str) -> RelayResult<()> {
        self.kv.del(&self.message_key(id)).await?;
        self.kv.zrem(&self.index_key(), id).await
    }

    async fn append_archive(&self, action: ArchiveAction, record: &DeadLetterRecord) -> RelayResult<()> {
        let at: DateTime<Utc> = Utc::now();
        let entry = ArchiveEntry {
            action,
            at,
            record: record.clone(),
        };
        let json = serde_json::to_string(&entry)?;
        self.kv
            .rpush_with_expiry(&self.archive_key(at.date_naive()), &json, self.config.archive_ttl)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::storage::MemoryKeyValueStore;
    use relay_config::{BrokerConfig, RetryConfig};
    use relay_types::QueueMessage;

    async fn fixture() -> (MemoryBroker, MemoryKeyValueStore, DeadLetterStore) {
        let broker = MemoryBroker::new();
        let producer = Arc::new(Producer::new(
            Arc::new(broker.clone()),
            BrokerConfig::default(),
            &RetryConfig::default(),
            "relay-test",
        ));
        producer.declare_topology().await.unwrap();
        let kv = MemoryKeyValueStore::new();
        let store = DeadLetterStore::new(Arc::new(kv.clone()), producer, DeadLetterConfig::default());
        (broker, kv, store)
    }

    fn record(retry_count: u32, max_retries: u32) -> DeadLetterRecord {
        let envelope = QueueMessage::new(serde_json::json!({"n": 1}), "api", max_retries, "relay.inbound");
        let now = Utc::now();
        DeadLetterRecord {
            id: envelope.id.clone(),
            original_routing_key: "message.received".into(),
            original_exchange: "relay.events".into(),
            original_queue: "relay.inbound".into(),
            payload: serde_json::to_value(&envelope).unwrap(),
            error: "socket hang up".into(),
            error_type: Some("CONNECTION_RESET".into()),
            retry_count,
            max_retries,
            timestamp: now,
            last_error_timestamp: now,
            tenant_id: Some("acme".into()),
            admitted: false,
        }
    }

    #[tokio::test]
    async fn test_park_writes_record_index_and_audit() {
        let (_broker, kv, store) = fixture().await;
        let rec = record(0, 3);

        store.park(&rec).await.unwrap();

        assert_eq!(store.get(&rec.id).await.unwrap(), Some(rec.clone()));
        assert_eq!(store.count().await.unwrap(), 1);
        let ttl = kv.ttl(&format!("dlq:message:{}", rec.id)).unwrap();
        assert!(ttl > DeadLetterConfig::default().record_ttl / 2);

        let audit = store.archived(Utc::now().date_naive()).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, ArchiveAction::Parked);
    }

    #[tokio::test]
    async fn test_retry_republishes_to_original_destination() {
        let (broker, _kv, store) = fixture().await;
        let rec = record(1, 3);
        store.park(&rec).await.unwrap();

        assert!(store.retry(&rec.id).await.unwrap());

        let queued = broker.messages("relay.inbound");
        assert_eq!(queued.len(), 1);
        let envelope: QueueMessage = serde_json::from_slice(&queued[0].message.body).unwrap();
        assert_eq!(envelope.id, rec.id);
        assert_eq!(envelope.metadata.retry_count, 2);
        assert_eq!(store.get(&rec.id).await.unwrap(), None);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_refuses_terminal_record() {
        let (broker, _kv, store) = fixture().await;
        let rec = record(3, 3);
        store.park(&rec).await.unwrap();

        assert!(!store.retry(&rec.id).await.unwrap());
        assert_eq!(broker.queue_depth("relay.inbound"), 0);
        assert_eq!(store.get(&rec.id).await.unwrap().unwrap().retry_count, 3);
    }

    #[tokio::test]
    async fn test_rejected_retry_keeps_bumped_count() {
        let (broker, _kv, store) = fixture().await;
        let rec = record(0, 3);
        store.park(&rec).await.unwrap();
        broker.fail_publishes_to("relay.events", relay_error::ErrorKind::AccessRefused);

        assert!(!store.retry(&rec.id).await.unwrap());
        assert_eq!(store.get(&rec.id).await.unwrap().unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_archive_and_delete_leave_audit_entries() {
        let (_broker, _kv, store) = fixture().await;
        let first = record(3, 3);
        let second = record(0, 3);
        store.park(&first).await.unwrap();
        store.park(&second).await.unwrap();

        assert!(store.archive(&first.id).await.unwrap());
        assert!(store.delete(&second.id).await.unwrap());
        assert!(!store.archive("missing").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);

        let actions: Vec<ArchiveAction> = store
            .archived(Utc::now().date_naive())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                ArchiveAction::Parked,
                ArchiveAction::Parked,
                ArchiveAction::Archived,
                ArchiveAction::Purged
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_prunes_expired_records() {
        let (_broker, _kv, store) = fixture().await;
        let rec = record(0, 3);
        store.park(&rec).await.unwrap();

        tokio::time::advance(DeadLetterConfig::default().record_ttl + std::time::Duration::from_secs(1)).await;

        assert!(store.list(10).await.unwrap().is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
