// ============================================================================
// Session provider seam
// ============================================================================
//
// The session provider owns the connections to the external chat network.
// The relay only needs three things from it:
// - which sessions are active (to route a tenant's send to one session)
// - a way to send through a session
// - a feed of inbound messages, delivered over a bounded channel so the
//   provider feels backpressure instead of piling up callbacks
//
// ============================================================================

use crate::broker::Producer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_error::RelayResult;
use relay_types::{DomainEvent, Priority};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub tenant_id: String,
}

/// Provider's receipt for a sent message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub id: String,
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn list_active_sessions(&self) -> RelayResult<Vec<SessionInfo>>;

    async fn send(&self, session_id: &str, recipient: &str, content: &str) -> RelayResult<SendReceipt>;
}

/// Inbound chat message as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub tenant_id: String,
    pub session_id: String,
    /// Remote party
    pub from: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

fn default_message_type() -> String {
    "text".to_string()
}

/// Sending half handed to the provider
pub type InboundSender = mpsc::Sender<InboundMessage>;

/// Drains the provider's inbound channel into the broker as
/// `message-received` events.
pub struct InboundPump {
    producer: Arc<Producer>,
    rx: mpsc::Receiver<InboundMessage>,
}

impl InboundPump {
    /// Pump plus the sender to give to the session provider
    pub fn channel(producer: Arc<Producer>, capacity: usize) -> (Self, InboundSender) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { producer, rx }, tx)
    }

    /// Run until cancelled or every sender is dropped. Returns how many
    /// events were published.
    pub async fn run(mut self, token: CancellationToken) -> usize {
        let mut published = 0;
        loop {
            let message = tokio::select! {
                _ = token.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            match self.publish(message).await {
                Ok(true) => published += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, "Inbound event not published"),
            }
        }
        tracing::info!(published, "Inbound pump stopped");
        published
    }

    async fn publish(&self, message: InboundMessage) -> RelayResult<bool> {
        let tenant_id = message.tenant_id.clone();
        let payload = serde_json::to_value(&message)?;
        let event = DomainEvent::message_received(tenant_id, payload);
        let event_id = event.id.clone();

        let published = self.producer.publish_event(event, Priority::Medium).await?;
        if published {
            tracing::debug!(event_id = %event_id, session_id = %message.session_id, "Inbound event published");
        } else {
            tracing::warn!(event_id = %event_id, session_id = %message.session_id, "Inbound event rejected by broker");
        }
        Ok(published)
    }
}
