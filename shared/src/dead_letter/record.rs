use crate::broker::{Delivery, HeaderValue, Headers, PublishOptions};
use chrono::{DateTime, Utc};
use relay_error::ErrorKind;
use relay_types::{QueueMessage, headers};
use serde::{Deserialize, Serialize};

/// A delivery that could not be processed, parked for later inspection or
/// retry.
///
/// `retry_count <= max_retries` always holds; once they are equal the record
/// is terminal and can only be archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub id: String,
    pub original_routing_key: String,
    pub original_exchange: String,
    pub original_queue: String,
    /// Original body: the JSON envelope, or a string if it was not JSON
    pub payload: serde_json::Value,
    pub error: String,
    /// `x-error-type` value, absent for broker-originated dead letters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timestamp: DateTime<Utc>,
    pub last_error_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// The message already passed admission control before it failed
    #[serde(default)]
    pub admitted: bool,
}

impl DeadLetterRecord {
    /// Rebuild a record from a dead-lettered delivery.
    ///
    /// Messages dead-lettered by the consumer carry the `x-*` failure headers.
    /// Messages the broker dead-lettered on its own (a nack without requeue)
    /// only carry RabbitMQ's `x-first-death-*` headers; they count as never
    /// retried unless the envelope or a retry header says otherwise.
    pub fn from_delivery(delivery: &Delivery, default_max_retries: u32) -> Self {
        let props = &delivery.properties;
        let header = |name: &str| props.header_str(name).map(str::to_string);
        let now = Utc::now();

        let payload = serde_json::from_slice(&delivery.body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&delivery.body).into_owned())
        });
        let envelope: Option<QueueMessage> = serde_json::from_value(payload.clone()).ok();

        let (error, error_type, retry_count) = match header(headers::ERROR_MESSAGE) {
            Some(message) => (
                message,
                header(headers::ERROR_TYPE),
                header_u32(props.headers.get(headers::RETRY_COUNT)).unwrap_or(0),
            ),
            None => {
                let reason = header(headers::FIRST_DEATH_REASON)
                    .unwrap_or_else(|| "unknown".to_string());
                // A dead letter that already went round keeps its count
                let retry_count = header_u32(props.headers.get(headers::RETRY_COUNT))
                    .or_else(|| envelope.as_ref().map(|m| m.metadata.retry_count))
                    .unwrap_or(0);
                (format!("dead-lettered by broker: {}", reason), None, retry_count)
            }
        };

        let max_retries = header_u32(props.headers.get(headers::MAX_RETRIES))
            .or_else(|| envelope.as_ref().map(|m| m.metadata.max_retries))
            .unwrap_or(default_max_retries);

        let original_queue = header(headers::ORIGINAL_QUEUE)
            .or_else(|| header(headers::FIRST_DEATH_QUEUE))
            .or_else(|| envelope.as_ref().map(|m| m.metadata.original_queue.clone()))
            .unwrap_or_default();
        let original_exchange = header(headers::ORIGINAL_EXCHANGE)
            .or_else(|| header(headers::FIRST_DEATH_EXCHANGE))
            .unwrap_or_default();
        let original_routing_key = header(headers::ORIGINAL_ROUTING_KEY).unwrap_or_default();

        let timestamp = header(headers::FAILED_AT)
            .and_then(|at| DateTime::parse_from_rfc3339(&at).ok())
            .map(|at| at.with_timezone(&Utc))
            .unwrap_or(now);

        let id = props
            .message_id
            .clone()
            .or_else(|| envelope.as_ref().map(|m| m.id.clone()))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let tenant_id = header(headers::TENANT_ID)
            .or_else(|| envelope.as_ref().and_then(|m| m.metadata.tenant_id.clone()));

        Self {
            id,
            original_routing_key,
            original_exchange,
            original_queue,
            payload,
            error,
            error_type,
            retry_count: retry_count.min(max_retries),
            max_retries,
            timestamp,
            last_error_timestamp: timestamp,
            tenant_id,
            admitted: props.header_i64(headers::ADMITTED) == Some(1),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Failure kind: the recorded type when present, otherwise classified
    /// from the error text
    pub fn error_kind(&self) -> ErrorKind {
        self.error_type
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or_else(|| ErrorKind::classify_opaque(&self.error))
    }

    /// Exchange and routing key to republish to. Without a known exchange the
    /// message goes straight back to its queue.
    pub fn destination(&self) -> (&str, &str) {
        if self.original_exchange.is_empty() || self.original_routing_key.is_empty() {
            ("", &self.original_queue)
        } else {
            (&self.original_exchange, &self.original_routing_key)
        }
    }

    /// Body and publish options for a retry. Envelopes get their retry count
    /// synced to the record's.
    pub fn republish_body(&self) -> (Vec<u8>, PublishOptions) {
        let mut options = PublishOptions {
            message_id: Some(self.id.clone()),
            tenant_id: self.tenant_id.clone(),
            ..Default::default()
        }
        .with_header(headers::RETRY_COUNT, self.retry_count)
        .with_header(headers::ORIGINAL_EXCHANGE, self.original_exchange.as_str())
        .with_header(headers::ORIGINAL_ROUTING_KEY, self.original_routing_key.as_str());
        if self.admitted {
            options = options.with_header(headers::ADMITTED, 1u32);
        }

        let body = match serde_json::from_value::<QueueMessage>(self.payload.clone()) {
            Ok(mut envelope) => {
                envelope.metadata.retry_count = self.retry_count;
                options.message_type = envelope.metadata.message_type;
                options.priority = Some(envelope.metadata.priority);
                serde_json::to_vec(&envelope).unwrap_or_default()
            }
            Err(_) => match &self.payload {
                serde_json::Value::String(raw) => raw.clone().into_bytes(),
                other => other.to_string().into_bytes(),
            },
        };
        (body, options)
    }
}

fn header_u32(value: Option<&HeaderValue>) -> Option<u32> {
    value
        .and_then(HeaderValue::as_i64)
        .and_then(|v| u32::try_from(v).ok())
}

/// What happened to a record, as written to the daily archive list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveAction {
    Parked,
    Retried,
    Archived,
    Purged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    pub action: ArchiveAction,
    pub at: DateTime<Utc>,
    pub record: DeadLetterRecord,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Acker, AckHandle, BrokerResult, MessageProperties};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoopAck;

    #[async_trait]
    impl AckHandle for NoopAck {
        async fn ack(&self) -> BrokerResult<()> {
            Ok(())
        }
        async fn nack(&self, _requeue: bool) -> BrokerResult<()> {
            Ok(())
        }
    }

    fn delivery(body: &[u8], map: Headers, message_id: Option<&str>) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: "relay.dlx".to_string(),
            routing_key: "relay.outbound".to_string(),
            redelivered: false,
            body: body.to_vec(),
            properties: MessageProperties {
                message_id: message_id.map(str::to_string),
                headers: map,
                ..Default::default()
            },
            acker: Acker::new(Arc::new(NoopAck)),
        }
    }

    #[test]
    fn test_record_from_consumer_dead_letter() {
        let envelope = QueueMessage::new(serde_json::json!({"x": 1}), "api", 3, "relay.outbound")
            .with_tenant("acme");
        let body = serde_json::to_vec(&envelope).unwrap();

        let mut map = Headers::new();
        map.insert(headers::ERROR_MESSAGE.into(), "no active session".into());
        map.insert(headers::ERROR_TYPE.into(), "ROUTING".into());
        map.insert(headers::RETRY_COUNT.into(), 1u32.into());
        map.insert(headers::MAX_RETRIES.into(), 3u32.into());
        map.insert(headers::ORIGINAL_EXCHANGE.into(), "relay.commands".into());
        map.insert(headers::ORIGINAL_ROUTING_KEY.into(), "command.send.acme".into());
        map.insert(headers::ORIGINAL_QUEUE.into(), "relay.outbound".into());
        map.insert(headers::FAILED_AT.into(), "2026-03-01T10:00:00.000Z".into());

        let record = DeadLetterRecord::from_delivery(&delivery(&body, map, Some(&envelope.id)), 5);

        assert_eq!(record.id, envelope.id);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.max_retries, 3);
        assert_eq!(record.error_kind(), ErrorKind::Routing);
        assert_eq!(record.destination(), ("relay.commands", "command.send.acme"));
        assert_eq!(record.tenant_id.as_deref(), Some("acme"));
        assert_eq!(record.timestamp.to_rfc3339(), "2026-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_record_from_broker_dead_letter() {
        let mut map = Headers::new();
        map.insert(headers::FIRST_DEATH_REASON.into(), "rejected".into());
        map.insert(headers::FIRST_DEATH_QUEUE.into(), "relay.inbound".into());
        map.insert(headers::FIRST_DEATH_EXCHANGE.into(), "relay.events".into());

        let record = DeadLetterRecord::from_delivery(&delivery(b"not json", map, None), 3);

        assert_eq!(record.retry_count, 0);
        assert_eq!(record.max_retries, 3);
        assert_eq!(record.error, "dead-lettered by broker: rejected");
        assert_eq!(record.original_queue, "relay.inbound");
        assert_eq!(record.original_exchange, "relay.events");
        assert_eq!(record.payload, serde_json::Value::String("not json".into()));
        assert_eq!(record.destination(), ("", "relay.inbound"));
        assert!(!record.id.is_empty());
    }

    #[test]
    fn test_broker_dead_letter_keeps_envelope_retry_count() {
        let envelope = QueueMessage::new(serde_json::json!({"x": 1}), "api", 3, "relay.inbound")
            .next_attempt()
            .next_attempt();
        let body = serde_json::to_vec(&envelope).unwrap();
        let mut map = Headers::new();
        map.insert(headers::FIRST_DEATH_REASON.into(), "expired".into());

        let record = DeadLetterRecord::from_delivery(&delivery(&body, map, None), 3);
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.id, envelope.id);
        assert_eq!(record.error, "dead-lettered by broker: expired");
        assert_eq!(record.original_queue, "relay.inbound");
    }

    #[test]
    fn test_republish_syncs_envelope_retry_count() {
        let envelope = QueueMessage::new(serde_json::json!({"x": 1}), "api", 3, "relay.outbound");
        let now = Utc::now();
        let record = DeadLetterRecord {
            id: envelope.id.clone(),
            original_routing_key: String::new(),
            original_exchange: String::new(),
            original_queue: "relay.outbound".into(),
            payload: serde_json::to_value(&envelope).unwrap(),
            error: "timeout".into(),
            error_type: None,
            retry_count: 2,
            max_retries: 3,
            timestamp: now,
            last_error_timestamp: now,
            tenant_id: None,
            admitted: false,
        };

        let (body, options) = record.republish_body();
        let republished: QueueMessage = serde_json::from_slice(&body).unwrap();
        assert_eq!(republished.metadata.retry_count, 2);
        assert_eq!(options.message_id.as_deref(), Some(envelope.id.as_str()));
        assert_eq!(record.error_kind(), ErrorKind::Timeout);
        assert!(!options.headers.contains_key(headers::ADMITTED));
    }

    #[test]
    fn test_admission_survives_the_dead_letter_round_trip() {
        let envelope = QueueMessage::new(serde_json::json!({"x": 1}), "api", 3, "relay.outbound");
        let body = serde_json::to_vec(&envelope).unwrap();
        let mut map = Headers::new();
        map.insert(headers::ERROR_MESSAGE.into(), "socket hang up".into());
        map.insert(headers::RETRY_COUNT.into(), 1u32.into());
        map.insert(headers::ADMITTED.into(), 1u32.into());

        let record = DeadLetterRecord::from_delivery(&delivery(&body, map, None), 3);
        assert!(record.admitted);

        let (_, options) = record.republish_body();
        assert_eq!(options.headers.get(headers::ADMITTED), Some(&HeaderValue::Int(1)));
    }
}
