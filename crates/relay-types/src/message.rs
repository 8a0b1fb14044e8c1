use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// EventKind
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Inbound chat message reported by the session provider
    MessageReceived,
    /// Outbound send requested by the API or an automation
    SendCommand,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessageReceived => "message-received",
            EventKind::SendCommand => "send-command",
        }
    }

    /// Routing key prefix used on the events/commands exchanges
    pub fn routing_prefix(&self) -> &'static str {
        match self {
            EventKind::MessageReceived => "message",
            EventKind::SendCommand => "command.send",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message-received" => Ok(EventKind::MessageReceived),
            "send-command" => Ok(EventKind::SendCommand),
            _ => Err(format!("Unknown event kind: {}", s)),
        }
    }
}

// ============================================================================
// DomainEvent - immutable once published
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub id: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub routing_key: String,
    pub origin_timestamp: DateTime<Utc>,
    pub tenant_id: String,
}

impl DomainEvent {
    pub fn new(
        kind: EventKind,
        routing_key: impl Into<String>,
        tenant_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            routing_key: routing_key.into(),
            origin_timestamp: Utc::now(),
            tenant_id: tenant_id.into(),
        }
    }

    /// Inbound message event, routed as `message.received`
    pub fn message_received(tenant_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(
            EventKind::MessageReceived,
            "message.received",
            tenant_id,
            payload,
        )
    }

    /// Outbound send command, routed as `command.send.<tenant>`
    pub fn send_command(tenant_id: impl Into<String>, command: &SendCommand) -> Self {
        let tenant_id = tenant_id.into();
        let routing_key = format!("{}.{}", EventKind::SendCommand.routing_prefix(), tenant_id);
        let payload = serde_json::to_value(command).unwrap_or(serde_json::Value::Null);
        Self::new(EventKind::SendCommand, routing_key, tenant_id, payload)
    }

    /// Wrap this event in a queue envelope. The envelope keeps the event id
    /// so that downstream deduplication is keyed on the original event.
    pub fn into_queue_message(
        self,
        sender: impl Into<String>,
        priority: Priority,
        max_retries: u32,
        original_queue: impl Into<String>,
    ) -> QueueMessage {
        let content = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        QueueMessage {
            id: self.id,
            content,
            timestamp: iso_timestamp(Utc::now()),
            metadata: MessageMetadata {
                sender: sender.into(),
                priority,
                retry_count: 0,
                max_retries,
                original_queue: original_queue.into(),
                tenant_id: Some(self.tenant_id),
                message_type: Some(self.kind),
            },
        }
    }
}

// ============================================================================
// QueueMessage envelope
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// AMQP priority property (0-9)
    pub fn as_amqp(&self) -> u8 {
        match self {
            Priority::High => 9,
            Priority::Medium => 5,
            Priority::Low => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub sender: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    pub original_queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<EventKind>,
}

/// Envelope written to the broker.
///
/// Only `metadata.retry_count` changes after creation, and only when the
/// consumer republishes the message for another attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub id: String,
    #[serde(alias = "payload")]
    pub content: serde_json::Value,
    pub timestamp: String,
    pub metadata: MessageMetadata,
}

impl QueueMessage {
    pub fn new(
        content: serde_json::Value,
        sender: impl Into<String>,
        max_retries: u32,
        original_queue: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content,
            timestamp: iso_timestamp(Utc::now()),
            metadata: MessageMetadata {
                sender: sender.into(),
                priority: Priority::default(),
                retry_count: 0,
                max_retries,
                original_queue: original_queue.into(),
                tenant_id: None,
                message_type: None,
            },
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.metadata.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_message_type(mut self, kind: EventKind) -> Self {
        self.metadata.message_type = Some(kind);
        self
    }

    /// Copy for the next attempt: same id and content, retry count + 1.
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.metadata.retry_count = self.metadata.retry_count.saturating_add(1);
        next
    }

    pub fn retries_exhausted(&self) -> bool {
        self.metadata.retry_count >= self.metadata.max_retries
    }

    /// Domain event carried in `content`, when the envelope wraps one
    pub fn domain_event(&self) -> Option<DomainEvent> {
        serde_json::from_value(self.content.clone()).ok()
    }
}

// ============================================================================
// SendCommand - payload of EventKind::SendCommand
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCommand {
    pub tenant_id: String,
    pub recipient: String,
    pub content: String,
}

/// RFC 3339 timestamp with millisecond precision, e.g. `2026-01-02T03:04:05.678Z`
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
