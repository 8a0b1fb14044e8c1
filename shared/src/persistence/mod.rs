// ============================================================================
// Message store
// ============================================================================
//
// Durable, queryable record of delivered messages. The stream bridge writes
// here after reading from the append log; `save` is idempotent on the event
// id, which is what turns at-least-once log replay into a single stored row.
//
// ============================================================================

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryMessageStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresMessageStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_error::{RelayError, RelayResult};
use relay_types::{DomainEvent, EventKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::sessions::InboundMessage;

/// One stored message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Event id; unique
    pub id: String,
    pub tenant_id: String,
    pub session_id: String,
    /// The remote party the message came from
    pub user_id: String,
    /// "text", "image", ...
    pub message_type: String,
    pub content: serde_json::Value,
    pub routing_key: String,
    pub sent_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Build from an inbound-message event
    pub fn from_event(event: &DomainEvent) -> RelayResult<Self> {
        if event.kind != EventKind::MessageReceived {
            return Err(RelayError::validation(format!(
                "cannot store event of kind {}",
                event.kind.as_str()
            )));
        }
        let message: InboundMessage = serde_json::from_value(event.payload.clone())?;
        Ok(Self {
            id: event.id.clone(),
            tenant_id: event.tenant_id.clone(),
            session_id: message.session_id,
            user_id: message.from,
            message_type: message.message_type,
            content: message.content,
            routing_key: event.routing_key.clone(),
            sent_at: message.timestamp.unwrap_or(event.origin_timestamp),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatistics {
    pub total: u64,
    pub sessions: u64,
    pub users: u64,
    pub by_type: BTreeMap<String, u64>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a record unless one with the same id exists. Returns the stored
    /// record, which is the earlier one on a repeat.
    async fn save(&self, record: MessageRecord) -> RelayResult<MessageRecord>;

    /// Newest first
    async fn by_session(&self, session_id: &str, limit: usize) -> RelayResult<Vec<MessageRecord>>;

    async fn by_user(&self, user_id: &str, limit: usize) -> RelayResult<Vec<MessageRecord>>;

    async fn by_type(&self, message_type: &str, limit: usize) -> RelayResult<Vec<MessageRecord>>;

    async fn recent(&self, limit: usize) -> RelayResult<Vec<MessageRecord>>;

    async fn statistics(&self) -> RelayResult<MessageStatistics>;
}
