// ============================================================================
// Broker abstraction
// ============================================================================
//
// The relay talks to its message broker through the `Broker` trait:
// - AmqpBroker   - RabbitMQ via lapin (production)
// - MemoryBroker - in-process model with the same routing, prefetch,
//                  ack/nack and dead-lettering semantics (tests, local runs)
//
// Deliveries are handed to consumers over a bounded mpsc channel; each
// delivery carries an `Acker` that settles it with the broker.
//
// ============================================================================

pub mod amqp;
pub mod consumer;
pub mod memory;
pub mod producer;
pub mod subscription;
pub mod topology;

pub use amqp::AmqpBroker;
pub use consumer::{
    ConsumerOptions, DeliveryError, DeliveryInfo, HandlerOutcome, MessageHandler, ReliableConsumer,
    Resolution,
};
pub use memory::MemoryBroker;
pub use producer::{Producer, PublishOptions};
pub use subscription::Subscription;
pub use topology::Topology;

use async_trait::async_trait;
use relay_error::{ErrorKind, RelayError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No usable connection; the caller should reconnect
    #[error("Broker connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Broker operation failed ({kind}): {message}")]
    Operation { kind: ErrorKind, message: String },

    /// Publisher confirm came back negative
    #[error("Publish not confirmed by broker: {0}")]
    NotConfirmed(String),

    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
}

impl BrokerError {
    pub fn operation(kind: ErrorKind, message: impl Into<String>) -> Self {
        BrokerError::Operation {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::ConnectionClosed(_) => ErrorKind::ConnectionReset,
            BrokerError::Operation { kind, .. } => *kind,
            BrokerError::NotConfirmed(_) => ErrorKind::Unknown,
            BrokerError::UnknownDeliveryTag(_) => ErrorKind::PreconditionFailed,
        }
    }

    /// The connection itself is gone, as opposed to a rejected operation
    pub fn is_connection_error(&self) -> bool {
        matches!(self, BrokerError::ConnectionClosed(_))
            || matches!(
                self.kind(),
                ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
            )
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        let kind = ErrorKind::from(&err);
        match err {
            lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
                BrokerError::ConnectionClosed(err.to_string())
            }
            _ => BrokerError::Operation {
                kind,
                message: err.to_string(),
            },
        }
    }
}

impl From<BrokerError> for RelayError {
    fn from(err: BrokerError) -> Self {
        RelayError::broker(err.kind(), err.to_string())
    }
}

// ============================================================================
// Topology descriptors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
            durable: true,
        }
    }
}

/// Queue arguments the relay cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub arguments: QueueArguments,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            arguments: QueueArguments::default(),
        }
    }

    /// Rejected deliveries are routed to `exchange` with `routing_key`
    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.arguments.dead_letter_exchange = Some(exchange.into());
        self.arguments.dead_letter_routing_key = Some(routing_key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl Binding {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            HeaderValue::Int(_) => None,
        }
    }

    /// Integer value; numeric strings are accepted too
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::Str(s) => s.parse().ok(),
        }
    }
}

impl std::fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderValue::Str(s) => f.write_str(s),
            HeaderValue::Int(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Str(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Str(s)
    }
}

impl From<i64> for HeaderValue {
    fn from(i: i64) -> Self {
        HeaderValue::Int(i)
    }
}

impl From<u32> for HeaderValue {
    fn from(i: u32) -> Self {
        HeaderValue::Int(i64::from(i))
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    /// Unix seconds, as AMQP carries it
    pub timestamp: Option<u64>,
    pub content_type: Option<String>,
    pub priority: Option<u8>,
    pub persistent: bool,
    pub headers: Headers,
}

impl MessageProperties {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(HeaderValue::as_str)
    }

    pub fn header_i64(&self, name: &str) -> Option<i64> {
        self.headers.get(name).and_then(HeaderValue::as_i64)
    }
}

/// A message on its way to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Settles one delivery with the broker
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;
    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

#[derive(Clone)]
pub struct Acker(Arc<dyn AckHandle>);

impl Acker {
    pub fn new(handle: Arc<dyn AckHandle>) -> Self {
        Self(handle)
    }

    pub async fn ack(&self) -> BrokerResult<()> {
        self.0.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.0.nack(requeue).await
    }
}

impl std::fmt::Debug for Acker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Acker")
    }
}

/// A message handed to a consumer; unsettled until acked or nacked
#[derive(Debug)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub acker: Acker,
}

impl Delivery {
    pub async fn ack(&self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.acker.nack(requeue).await
    }
}

/// Deliveries for one consumer. Dropping the stream cancels the consumer and
/// returns its unacked deliveries to the queue.
pub struct DeliveryStream {
    rx: mpsc::Receiver<Delivery>,
    _cancel: Option<DropGuard>,
}

impl DeliveryStream {
    pub fn new(rx: mpsc::Receiver<Delivery>, cancel: Option<DropGuard>) -> Self {
        Self {
            rx,
            _cancel: cancel,
        }
    }

    /// Next delivery; `None` once the consumer was cancelled or the
    /// connection dropped
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

// ============================================================================
// Broker trait
// ============================================================================

#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare an exchange; repeat declarations with equal settings are no-ops
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()>;

    /// Declare a queue; redeclaring with different arguments is a
    /// `PreconditionFailed` error
    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()>;

    async fn bind_queue(&self, binding: &Binding) -> BrokerResult<()>;

    /// Publish and wait for the broker to take responsibility for the message
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> BrokerResult<()>;

    /// Start consuming; at most `prefetch` deliveries are unacked at a time
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> BrokerResult<DeliveryStream>;

    /// False once the connection or the shared publish channel has closed.
    /// NOT_FOUND and PRECONDITION_FAILED close the channel but not the
    /// connection.
    fn is_connected(&self) -> bool;

    /// Re-establish the connection, or just the channel when the connection
    /// survived (topology is the caller's business)
    async fn reconnect(&self) -> BrokerResult<()>;
}

/// Topic pattern match: `*` is exactly one word, `#` is zero or more
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some((&"*", rest)), Some((_, key_rest))) => matches(rest, key_rest),
            (Some((word, rest)), Some((key_word, key_rest))) => {
                word == key_word && matches(rest, key_rest)
            }
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}
