use async_trait::async_trait;
use relay_error::{ErrorKind, RelayError};
use relay_redis::{RedisClient, RedisError, StreamReadOptions, is_no_group};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

pub use relay_redis::StreamEntry;

#[derive(Debug, thiserror::Error)]
pub enum StreamLogError {
    /// The consumer group (or its stream) is gone; recreate it and carry on
    #[error("Consumer group missing: {0}")]
    NoGroup(String),

    #[error("Stream log error ({kind}): {message}")]
    Backend { kind: ErrorKind, message: String },
}

impl StreamLogError {
    pub fn backend(kind: ErrorKind, message: impl Into<String>) -> Self {
        StreamLogError::Backend {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamLogError::NoGroup(_) => ErrorKind::NotFound,
            StreamLogError::Backend { kind, .. } => *kind,
        }
    }
}

impl From<RedisError> for StreamLogError {
    fn from(err: RedisError) -> Self {
        if is_no_group(&err) {
            StreamLogError::NoGroup(err.to_string())
        } else {
            StreamLogError::Backend {
                kind: ErrorKind::from(&err),
                message: err.to_string(),
            }
        }
    }
}

impl From<StreamLogError> for RelayError {
    fn from(err: StreamLogError) -> Self {
        RelayError::broker(err.kind(), err.to_string())
    }
}

/// Where a group read starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries already delivered to this consumer and not yet acked
    Pending,
    /// Entries never delivered to any consumer of the group
    New,
}

impl ReadCursor {
    pub fn as_id(&self) -> &'static str {
        match self {
            ReadCursor::Pending => "0",
            ReadCursor::New => ">",
        }
    }
}

/// Append-only log with consumer groups
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Create the stream and group if missing. Returns `false` when the group
    /// already existed.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<bool, StreamLogError>;

    /// Append an entry; returns its id
    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String, StreamLogError>;

    /// Claim up to `count` entries for `consumer`. A `New` read waits up to
    /// `block` for entries to arrive; a `Pending` read never waits.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamLogError>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamLogError>;
}

// ============================================================================
// Redis Streams
// ============================================================================

/// Redis Streams backed log.
///
/// Blocking XREADGROUP holds the connection, so give the reader a client of
/// its own rather than a clone of a shared one.
#[derive(Clone)]
pub struct RedisStreamLog {
    client: RedisClient,
    max_len: usize,
}

impl RedisStreamLog {
    pub fn new(client: RedisClient, max_len: usize) -> Self {
        Self { client, max_len }
    }
}

#[async_trait]
impl StreamLog for RedisStreamLog {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<bool, StreamLogError> {
        let mut client = self.client.clone();
        Ok(client.xgroup_create_mkstream(stream, group, "0").await?)
    }

    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String, StreamLogError> {
        let mut client = self.client.clone();
        Ok(client.xadd_maxlen(stream, self.max_len, fields).await?)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamLogError> {
        let options = StreamReadOptions {
            block: match cursor {
                ReadCursor::New => Some(block.as_millis() as u64),
                ReadCursor::Pending => None,
            },
            count: Some(count as u64),
        };
        let mut client = self.client.clone();
        Ok(client
            .xreadgroup(stream, group, consumer, cursor.as_id(), options)
            .await?)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamLogError> {
        let mut client = self.client.clone();
        client.xack(stream, group, &[id]).await?;
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
struct GroupState {
    /// Entries `[0, delivered)` have been handed to some consumer
    delivered: usize,
    /// Unacked entry id → owning consumer
    pending: BTreeMap<u64, String>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(u64, StreamEntry)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct LogState {
    streams: HashMap<String, StreamState>,
    next_seq: u64,
    fail_appends: Option<String>,
    fail_reads: Option<String>,
}

/// In-process consumer-group log with the XREADGROUP semantics the bridge
/// depends on, plus fault injection for tests.
#[derive(Clone, Default)]
pub struct MemoryStreamLog {
    state: Arc<Mutex<LogState>>,
    appended: Arc<Notify>,
}

impl MemoryStreamLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every append fail with `message` until cleared with `None`
    pub fn fail_appends(&self, message: Option<&str>) {
        self.state().fail_appends = message.map(str::to_string);
    }

    /// Make every read fail with `message` until cleared with `None`
    pub fn fail_reads(&self, message: Option<&str>) {
        self.state().fail_reads = message.map(str::to_string);
    }

    /// Delete a consumer group, as an operator running XGROUP DESTROY would
    pub fn drop_group(&self, stream: &str, group: &str) -> bool {
        self.state()
            .streams
            .get_mut(stream)
            .is_some_and(|s| s.groups.remove(group).is_some())
    }

    pub fn len(&self, stream: &str) -> usize {
        self.state().streams.get(stream).map_or(0, |s| s.entries.len())
    }

    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.state()
            .streams
            .get(stream)
            .map(|s| s.entries.iter().map(|(_, e)| e.clone()).collect())
            .unwrap_or_default()
    }

    /// Delivered but unacked entries across the group
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.state()
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    fn no_group(stream: &str, group: &str) -> StreamLogError {
        StreamLogError::NoGroup(format!("no such key '{}' or consumer group '{}'", stream, group))
    }

    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamLogError> {
        let mut state = self.state();
        if let Some(message) = state.fail_reads.clone() {
            return Err(StreamLogError::backend(ErrorKind::classify_opaque(&message), message));
        }
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_group(stream, group))?;
        let g = s
            .groups
            .get_mut(group)
            .ok_or_else(|| Self::no_group(stream, group))?;

        match cursor {
            ReadCursor::Pending => {
                let owned: Vec<u64> = g
                    .pending
                    .iter()
                    .filter(|(_, owner)| owner.as_str() == consumer)
                    .map(|(seq, _)| *seq)
                    .take(count)
                    .collect();
                Ok(s.entries
                    .iter()
                    .filter(|(seq, _)| owned.contains(seq))
                    .map(|(_, e)| e.clone())
                    .collect())
            }
            ReadCursor::New => {
                let end = (g.delivered + count).min(s.entries.len());
                let batch: Vec<(u64, StreamEntry)> = s.entries[g.delivered..end].to_vec();
                g.delivered = end;
                for (seq, _) in &batch {
                    g.pending.insert(*seq, consumer.to_string());
                }
                Ok(batch.into_iter().map(|(_, e)| e).collect())
            }
        }
    }
}

fn parse_seq(id: &str) -> Option<u64> {
    id.split_once('-').and_then(|(seq, _)| seq.parse().ok())
}

#[async_trait]
impl StreamLog for MemoryStreamLog {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<bool, StreamLogError> {
        let mut state = self.state();
        let s = state.streams.entry(stream.to_string()).or_default();
        if s.groups.contains_key(group) {
            return Ok(false);
        }
        s.groups.insert(group.to_string(), GroupState::default());
        Ok(true)
    }

    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String, StreamLogError> {
        let id = {
            let mut state = self.state();
            if let Some(message) = state.fail_appends.clone() {
                return Err(StreamLogError::backend(ErrorKind::classify_opaque(&message), message));
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            let id = format!("{}-0", seq);
            let entry = StreamEntry {
                id: id.clone(),
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            };
            state
                .streams
                .entry(stream.to_string())
                .or_default()
                .entries
                .push((seq, entry));
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamLogError> {
        let count = count.max(1);
        if cursor == ReadCursor::Pending {
            return self.claim(stream, group, consumer, cursor, count);
        }

        // Register for wakeups before looking, so an append in between is not missed
        let appended = self.appended.notified();
        let entries = self.claim(stream, group, consumer, cursor, count)?;
        if !entries.is_empty() || block.is_zero() {
            return Ok(entries);
        }
        let _ = tokio::time::timeout(block, appended).await;
        self.claim(stream, group, consumer, cursor, count)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamLogError> {
        let mut state = self.state();
        let g = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| Self::no_group(stream, group))?;
        if let Some(seq) = parse_seq(id) {
            g.pending.remove(&seq);
        }
        Ok(())
    }
}
