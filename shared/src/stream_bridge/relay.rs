use super::log::{ReadCursor, StreamEntry, StreamLog, StreamLogError};
use crate::broker::{Delivery, Producer, Subscription};
use crate::persistence::{MessageRecord, MessageStore};
use crate::scheduler::sleep_or_cancel;
use relay_config::StreamConfig;
use relay_error::{RelayError, RelayResult};
use relay_metrics::{STREAM_APPEND_FAILURES_TOTAL, STREAM_APPENDS_TOTAL, STREAM_ENTRIES_STORED_TOTAL};
use relay_types::{QueueMessage, headers};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Entry field names
pub const FIELD_ID: &str = "id";
pub const FIELD_ROUTING_KEY: &str = "routingKey";
pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_TENANT_ID: &str = "tenantId";

/// What happened to one log entry on its way to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Stored,
    /// Unparseable; acked so it cannot wedge the group
    Dropped,
    /// Save or ack failed; the entry stays pending
    Failed,
}

/// Moves inbound events broker → append log → message store.
///
/// Each hop settles its source only after the next hop has the data: the
/// broker delivery is acked after the append, the log entry after the save.
/// A reader that stops between save and ack replays the entry on restart and
/// the store's idempotent save absorbs the repeat.
pub struct StreamBridge {
    producer: Arc<Producer>,
    log: Arc<dyn StreamLog>,
    store: Arc<dyn MessageStore>,
    config: StreamConfig,
    queue: String,
    stream: String,
    group_ready: AtomicBool,
    token: CancellationToken,
}

impl StreamBridge {
    pub fn new(
        producer: Arc<Producer>,
        log: Arc<dyn StreamLog>,
        store: Arc<dyn MessageStore>,
        config: StreamConfig,
        token: CancellationToken,
    ) -> Arc<Self> {
        let queue = producer.config().inbound_queue.clone();
        let stream = config.stream_key(&queue);
        Arc::new(Self {
            producer,
            log,
            store,
            config,
            queue,
            stream,
            group_ready: AtomicBool::new(false),
            token,
        })
    }

    pub fn stream_key(&self) -> &str {
        &self.stream
    }

    async fn ensure_group(&self) -> Result<(), StreamLogError> {
        if self.group_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.log.ensure_group(&self.stream, &self.config.group).await? {
            tracing::info!(stream = %self.stream, group = %self.config.group, "Created consumer group");
        }
        self.group_ready.store(true, Ordering::Release);
        Ok(())
    }

    // ========================================================================
    // Broker → log
    // ========================================================================

    /// Consume the inbound queue into the log until cancelled
    pub async fn run_ingress(self: Arc<Self>) {
        let subscription = Subscription::new(
            self.queue.clone(),
            "relay-stream-bridge",
            self.producer.config().prefetch,
        );
        let bridge = Arc::clone(&self);
        subscription
            .run(&self.producer, &self.token, move |delivery| {
                let bridge = Arc::clone(&bridge);
                async move {
                    bridge.append_delivery(delivery).await;
                }
            })
            .await;
    }

    /// Append one delivery; ack it if the append went through, otherwise
    /// reject it without requeue so the queue's dead-letter binding takes it.
    pub async fn append_delivery(&self, delivery: Delivery) -> bool {
        let envelope: Option<QueueMessage> = serde_json::from_slice(&delivery.body).ok();
        let id = delivery
            .properties
            .message_id
            .clone()
            .or_else(|| envelope.as_ref().map(|m| m.id.clone()))
            .unwrap_or_default();
        let tenant_id = delivery
            .properties
            .header_str(headers::TENANT_ID)
            .map(str::to_string)
            .or_else(|| envelope.as_ref().and_then(|m| m.metadata.tenant_id.clone()))
            .unwrap_or_default();
        let payload = String::from_utf8_lossy(&delivery.body);

        let appended = match self.ensure_group().await {
            Ok(()) => {
                self.log
                    .append(
                        &self.stream,
                        &[
                            (FIELD_ID, id.as_str()),
                            (FIELD_ROUTING_KEY, delivery.routing_key.as_str()),
                            (FIELD_PAYLOAD, payload.as_ref()),
                            (FIELD_TENANT_ID, tenant_id.as_str()),
                        ],
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        match appended {
            Ok(entry_id) => {
                STREAM_APPENDS_TOTAL.inc();
                tracing::debug!(message_id = %id, entry_id = %entry_id, stream = %self.stream, "Appended to stream");
                if let Err(e) = delivery.ack().await {
                    tracing::warn!(message_id = %id, error = %e, "Ack after append failed - broker will redeliver");
                }
                true
            }
            Err(e) => {
                STREAM_APPEND_FAILURES_TOTAL.inc();
                tracing::error!(
                    message_id = %id,
                    stream = %self.stream,
                    error = %e,
                    "Stream append failed - rejecting delivery"
                );
                if let Err(e) = delivery.nack(false).await {
                    tracing::warn!(message_id = %id, error = %e, "Reject after failed append failed");
                }
                false
            }
        }
    }

    // ========================================================================
    // Log → store
    // ========================================================================

    /// Read the log into the store until cancelled.
    ///
    /// Starts with this consumer's pending entries (left over from a previous
    /// run) before taking new ones. Never gives up on errors: a missing group
    /// is recreated, anything else waits `error_backoff` and tries again.
    pub async fn run_reader(self: Arc<Self>) {
        tracing::info!(
            stream = %self.stream,
            group = %self.config.group,
            consumer = %self.config.consumer_name,
            "Stream reader started"
        );

        let mut cursor = ReadCursor::Pending;
        while !self.token.is_cancelled() {
            if let Err(e) = self.ensure_group().await {
                tracing::error!(stream = %self.stream, error = %e, "Failed to create consumer group");
                if !sleep_or_cancel(self.config.error_backoff, &self.token).await {
                    break;
                }
                continue;
            }

            let read = tokio::select! {
                _ = self.token.cancelled() => break,
                read = self.log.read_group(
                    &self.stream,
                    &self.config.group,
                    &self.config.consumer_name,
                    cursor,
                    self.config.batch_count,
                    self.config.block,
                ) => read,
            };

            match read {
                Ok(entries) if entries.is_empty() => {
                    if cursor == ReadCursor::Pending {
                        tracing::debug!(stream = %self.stream, "Pending entries drained");
                        cursor = ReadCursor::New;
                    }
                }
                Ok(entries) => {
                    if !self.store_batch(entries).await {
                        cursor = ReadCursor::Pending;
                        if !sleep_or_cancel(self.config.error_backoff, &self.token).await {
                            break;
                        }
                    }
                }
                Err(StreamLogError::NoGroup(message)) => {
                    tracing::warn!(
                        stream = %self.stream,
                        group = %self.config.group,
                        error = %message,
                        "Consumer group missing - recreating"
                    );
                    self.group_ready.store(false, Ordering::Release);
                    cursor = ReadCursor::Pending;
                }
                Err(e) => {
                    tracing::error!(stream = %self.stream, error = %e, "Stream read failed");
                    cursor = ReadCursor::Pending;
                    if !sleep_or_cancel(self.config.error_backoff, &self.token).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(stream = %self.stream, "Stream reader stopped");
    }

    /// Store a batch in order; stops at the first failure, which leaves that
    /// entry and the rest pending. Returns whether the whole batch went through.
    async fn store_batch(&self, entries: Vec<StreamEntry>) -> bool {
        for entry in entries {
            if self.store_entry(&entry).await == EntryOutcome::Failed {
                return false;
            }
        }
        true
    }

    async fn store_entry(&self, entry: &StreamEntry) -> EntryOutcome {
        let outcome = match record_from_entry(entry) {
            Ok(record) => {
                let message_id = record.id.clone();
                match self.store.save(record).await {
                    Ok(_) => {
                        STREAM_ENTRIES_STORED_TOTAL.inc();
                        EntryOutcome::Stored
                    }
                    Err(e) => {
                        tracing::error!(
                            entry_id = %entry.id,
                            message_id = %message_id,
                            error = %e,
                            "Failed to store message - will replay"
                        );
                        return EntryOutcome::Failed;
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    entry_id = %entry.id,
                    error = %e,
                    payload = entry.fields.get(FIELD_PAYLOAD).map(String::as_str).unwrap_or(""),
                    "Unparseable stream entry - dropping"
                );
                EntryOutcome::Dropped
            }
        };

        match self.log.ack(&self.stream, &self.config.group, &entry.id).await {
            Ok(()) => outcome,
            Err(e) => {
                tracing::warn!(entry_id = %entry.id, error = %e, "Stream ack failed - entry will replay");
                if matches!(e, StreamLogError::NoGroup(_)) {
                    self.group_ready.store(false, Ordering::Release);
                }
                EntryOutcome::Failed
            }
        }
    }
}

/// Rebuild the stored message from a log entry's envelope
pub fn record_from_entry(entry: &StreamEntry) -> RelayResult<MessageRecord> {
    let payload = entry
        .fields
        .get(FIELD_PAYLOAD)
        .ok_or_else(|| RelayError::validation(format!("entry {} has no payload", entry.id)))?;
    let envelope: QueueMessage = serde_json::from_str(payload)?;
    let event = envelope.domain_event().ok_or_else(|| {
        RelayError::validation(format!("message {} does not carry a domain event", envelope.id))
    })?;
    MessageRecord::from_event(&event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::InboundMessage;
    use relay_types::{DomainEvent, Priority};
    use std::collections::HashMap;

    fn entry(payload: &str) -> StreamEntry {
        StreamEntry {
            id: "1-0".into(),
            fields: HashMap::from([(FIELD_PAYLOAD.to_string(), payload.to_string())]),
        }
    }

    #[test]
    fn test_record_from_entry() {
        let inbound = InboundMessage {
            tenant_id: "acme".into(),
            session_id: "s1".into(),
            from: "15550001".into(),
            message_type: "text".into(),
            content: serde_json::json!({"text": "hello"}),
            timestamp: None,
        };
        let event = DomainEvent::message_received("acme", serde_json::to_value(&inbound).unwrap());
        let id = event.id.clone();
        let envelope = event.into_queue_message("relay", Priority::Medium, 3, "relay.inbound");

        let record = record_from_entry(&entry(&serde_json::to_string(&envelope).unwrap())).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.session_id, "s1");
        assert_eq!(record.user_id, "15550001");
        assert_eq!(record.routing_key, "message.received");
    }

    #[test]
    fn test_record_from_entry_rejects_garbage() {
        assert!(record_from_entry(&entry("not json")).is_err());
        let bare = QueueMessage::new(serde_json::json!({"x": 1}), "api", 3, "relay.inbound");
        assert!(record_from_entry(&entry(&serde_json::to_string(&bare).unwrap())).is_err());
        let missing = StreamEntry {
            id: "1-0".into(),
            fields: HashMap::new(),
        };
        assert!(record_from_entry(&missing).is_err());
    }
}
