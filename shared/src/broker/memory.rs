// ============================================================================
// In-memory broker
// ============================================================================
//
// Models the parts of AMQP 0-9-1 the relay depends on:
// - topic / direct / fanout exchanges plus the default ("") exchange
// - durable queue arguments, with PRECONDITION_FAILED on mismatch
// - per-consumer prefetch, round-robin dispatch, ack / nack / requeue
// - dead-lettering of rejected deliveries through x-dead-letter-* arguments,
//   stamped with RabbitMQ's x-first-death-* headers
// - channel loss: NOT_FOUND and PRECONDITION_FAILED close the shared
//   declare/publish channel, so later declares and publishes fail until
//   `reconnect`. Consumers and acks keep working.
// - connection loss: every operation fails until `reconnect`
//
// Everything lives behind one std Mutex and no lock is held across an await.
//
// ============================================================================

use super::{
    AckHandle, Acker, Binding, Broker, BrokerError, BrokerResult, Delivery, DeliveryStream,
    ExchangeKind, ExchangeSpec, HeaderValue, OutgoingMessage, QueueSpec, topic_matches,
};
use async_trait::async_trait;
use relay_error::ErrorKind;
use relay_types::headers;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// A message sitting in (or published through) the in-memory broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutgoingMessage,
    pub redelivered: bool,
}

struct MemoryConsumer {
    id: u64,
    tx: mpsc::Sender<Delivery>,
    prefetch: usize,
    unacked: BTreeMap<u64, StoredMessage>,
}

struct MemoryQueue {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<MemoryConsumer>,
    next_consumer: usize,
}

#[derive(Default)]
struct MemoryState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    next_tag: u64,
    next_consumer_id: u64,
    declarations: u64,
    failing_exchanges: HashMap<String, ErrorKind>,
    refused_reconnects: u32,
    published: Vec<StoredMessage>,
    /// Why the shared channel was closed, if it was
    channel_closed: Option<String>,
}

impl MemoryState {
    fn ensure_channel(&self) -> BrokerResult<()> {
        match &self.channel_closed {
            Some(reason) => Err(BrokerError::operation(
                ErrorKind::ConnectionReset,
                format!("channel closed: {}", reason),
            )),
            None => Ok(()),
        }
    }

    /// A soft error closes the channel the failing call ran on
    fn close_channel(&mut self, err: BrokerError) -> BrokerError {
        tracing::warn!(error = %err, "In-memory broker channel closed");
        self.channel_closed = Some(err.to_string());
        err
    }
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    connected: AtomicBool,
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState::default()),
                connected: AtomicBool::new(true),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Drop the connection: consumers are cancelled, their unacked deliveries
    /// go back to the head of their queues, and every call fails until
    /// [`reconnect`](Broker::reconnect). Declared topology survives.
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        let mut state = self.inner.lock();
        for queue in state.queues.values_mut() {
            for consumer in std::mem::take(&mut queue.consumers) {
                requeue_unacked(queue, consumer.unacked);
            }
        }
        tracing::warn!("In-memory broker connection dropped");
    }

    /// The next `attempts` reconnects fail with CONNECTION_REFUSED
    pub fn refuse_reconnects(&self, attempts: u32) {
        self.inner.lock().refused_reconnects = attempts;
    }

    /// Publishes to `exchange` fail with `kind` until cleared
    pub fn fail_publishes_to(&self, exchange: &str, kind: ErrorKind) {
        self.inner
            .lock()
            .failing_exchanges
            .insert(exchange.to_string(), kind);
    }

    pub fn clear_publish_failures(&self) {
        self.inner.lock().failing_exchanges.clear();
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Ready (undelivered) messages in a queue, head first
    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.unacked.len()).sum())
            .unwrap_or(0)
    }

    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.inner.lock().queues.get(queue).map(|q| q.spec.clone())
    }

    pub fn exchange_spec(&self, exchange: &str) -> Option<ExchangeSpec> {
        self.inner.lock().exchanges.get(exchange).cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.inner.lock().bindings.clone()
    }

    /// Number of declare/bind calls accepted so far
    pub fn declaration_count(&self) -> u64 {
        self.inner.lock().declarations
    }

    /// Every message accepted by `publish`, oldest first
    pub fn published(&self) -> Vec<StoredMessage> {
        self.inner.lock().published.clone()
    }
}

impl MemoryInner {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_connected(&self) -> BrokerResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed(
                "in-memory broker disconnected".to_string(),
            ))
        }
    }

    /// Route a message from `exchange` into every matching queue
    fn route(self: &Arc<Self>, state: &mut MemoryState, message: StoredMessage) -> BrokerResult<()> {
        let targets: Vec<String> = if message.exchange.is_empty() {
            if state.queues.contains_key(&message.routing_key) {
                vec![message.routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            let exchange = state.exchanges.get(&message.exchange).ok_or_else(|| {
                BrokerError::operation(
                    ErrorKind::NotFound,
                    format!("NOT_FOUND - no exchange '{}'", message.exchange),
                )
            })?;

            let mut targets = Vec::new();
            for binding in state.bindings.iter().filter(|b| b.exchange == exchange.name) {
                let hit = match exchange.kind {
                    ExchangeKind::Topic => topic_matches(&binding.routing_key, &message.routing_key),
                    ExchangeKind::Direct => binding.routing_key == message.routing_key,
                    ExchangeKind::Fanout => true,
                };
                if hit && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            tracing::debug!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "Unroutable message dropped"
            );
        }

        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.ready.push_back(message.clone());
            }
            self.dispatch(state, &target);
        }
        Ok(())
    }

    /// Hand ready messages to consumers with spare prefetch
    fn dispatch(self: &Arc<Self>, state: &mut MemoryState, queue_name: &str) {
        loop {
            let tag = state.next_tag + 1;
            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let Some(slot) = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&i| queue.consumers[i].unacked.len() < queue.consumers[i].prefetch)
            else {
                return;
            };
            queue.next_consumer = (slot + 1) % count;

            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            let consumer = &mut queue.consumers[slot];
            let delivery = Delivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                body: message.message.body.clone(),
                properties: message.message.properties.clone(),
                acker: Acker::new(Arc::new(MemoryAck {
                    broker: Arc::downgrade(self),
                    queue: queue_name.to_string(),
                    consumer_id: consumer.id,
                    tag,
                })),
            };

            match consumer.tx.try_send(delivery) {
                Ok(()) => {
                    consumer.unacked.insert(tag, message);
                    state.next_tag = tag;
                }
                Err(TrySendError::Closed(_)) | Err(TrySendError::Full(_)) => {
                    // Consumer went away without cancelling
                    queue.ready.push_front(message);
                    let gone = queue.consumers.remove(slot);
                    requeue_unacked(queue, gone.unacked);
                    queue.next_consumer = 0;
                }
            }
        }
    }

    fn settle(self: &Arc<Self>, queue_name: &str, consumer_id: u64, tag: u64, outcome: Settle) -> BrokerResult<()> {
        self.ensure_connected()?;
        let mut state = self.lock();

        let message = state
            .queues
            .get_mut(queue_name)
            .and_then(|q| q.consumers.iter_mut().find(|c| c.id == consumer_id))
            .and_then(|c| c.unacked.remove(&tag))
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;

        match outcome {
            Settle::Ack => {}
            Settle::Requeue => {
                if let Some(queue) = state.queues.get_mut(queue_name) {
                    queue.ready.push_front(StoredMessage {
                        redelivered: true,
                        ..message
                    });
                }
            }
            Settle::Reject => {
                let arguments = state
                    .queues
                    .get(queue_name)
                    .map(|q| q.spec.arguments.clone())
                    .unwrap_or_default();
                if let Some(dlx) = arguments.dead_letter_exchange {
                    let routing_key = arguments
                        .dead_letter_routing_key
                        .unwrap_or_else(|| message.routing_key.clone());
                    let mut dead = message;
                    let first_death = [
                        (headers::FIRST_DEATH_REASON, "rejected"),
                        (headers::FIRST_DEATH_QUEUE, queue_name),
                        (headers::FIRST_DEATH_EXCHANGE, dead.exchange.as_str()),
                    ]
                    .map(|(name, value)| (name.to_string(), HeaderValue::from(value)));
                    for (name, value) in first_death {
                        dead.message.properties.headers.entry(name).or_insert(value);
                    }
                    dead.exchange = dlx;
                    dead.routing_key = routing_key;
                    dead.redelivered = false;
                    if let Err(e) = self.route(&mut state, dead) {
                        tracing::warn!(queue = %queue_name, error = %e, "Dead-letter routing failed, message dropped");
                    }
                }
            }
        }

        self.dispatch(&mut state, queue_name);
        Ok(())
    }

    fn cancel_consumer(self: &Arc<Self>, queue_name: &str, consumer_id: u64) {
        let mut state = self.lock();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        if let Some(pos) = queue.consumers.iter().position(|c| c.id == consumer_id) {
            let consumer = queue.consumers.remove(pos);
            queue.next_consumer = 0;
            requeue_unacked(queue, consumer.unacked);
            self.dispatch(&mut state, queue_name);
        }
    }
}

/// Unacked deliveries return to the head of the queue in delivery order
fn requeue_unacked(queue: &mut MemoryQueue, unacked: BTreeMap<u64, StoredMessage>) {
    for (_, message) in unacked.into_iter().rev() {
        queue.ready.push_front(StoredMessage {
            redelivered: true,
            ..message
        });
    }
}

enum Settle {
    Ack,
    Requeue,
    Reject,
}

struct MemoryAck {
    broker: Weak<MemoryInner>,
    queue: String,
    consumer_id: u64,
    tag: u64,
}

impl MemoryAck {
    fn settle(&self, outcome: Settle) -> BrokerResult<()> {
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| BrokerError::ConnectionClosed("broker dropped".to_string()))?;
        broker.settle(&self.queue, self.consumer_id, self.tag, outcome)
    }
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(&self) -> BrokerResult<()> {
        self.settle(Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.settle(if requeue { Settle::Requeue } else { Settle::Reject })
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()> {
        self.inner.ensure_connected()?;
        let mut state = self.inner.lock();
        state.ensure_channel()?;

        if let Some(existing) = state.exchanges.get(&spec.name) {
            if existing != spec {
                let err = BrokerError::operation(
                    ErrorKind::PreconditionFailed,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                        spec.name
                    ),
                );
                return Err(state.close_channel(err));
            }
        } else {
            state.exchanges.insert(spec.name.clone(), spec.clone());
        }
        state.declarations += 1;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()> {
        self.inner.ensure_connected()?;
        let mut state = self.inner.lock();
        state.ensure_channel()?;

        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => {
                let err = BrokerError::operation(
                    ErrorKind::PreconditionFailed,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                        spec.name
                    ),
                );
                return Err(state.close_channel(err));
            }
            Some(_) => {}
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    MemoryQueue {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                    },
                );
            }
        }
        state.declarations += 1;
        Ok(())
    }

    async fn bind_queue(&self, binding: &Binding) -> BrokerResult<()> {
        self.inner.ensure_connected()?;
        let mut state = self.inner.lock();
        state.ensure_channel()?;

        if !state.queues.contains_key(&binding.queue) {
            let err = BrokerError::operation(
                ErrorKind::NotFound,
                format!("NOT_FOUND - no queue '{}'", binding.queue),
            );
            return Err(state.close_channel(err));
        }
        if !state.exchanges.contains_key(&binding.exchange) {
            let err = BrokerError::operation(
                ErrorKind::NotFound,
                format!("NOT_FOUND - no exchange '{}'", binding.exchange),
            );
            return Err(state.close_channel(err));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        state.declarations += 1;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> BrokerResult<()> {
        self.inner.ensure_connected()?;
        let mut state = self.inner.lock();
        state.ensure_channel()?;

        if let Some(kind) = state.failing_exchanges.get(exchange) {
            return Err(BrokerError::operation(
                *kind,
                format!("injected publish failure on '{}'", exchange),
            ));
        }

        let stored = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
            redelivered: false,
        };
        if let Err(e) = self.inner.route(&mut state, stored.clone()) {
            return Err(state.close_channel(e));
        }
        state.published.push(stored);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        prefetch: u16,
    ) -> BrokerResult<DeliveryStream> {
        self.inner.ensure_connected()?;
        let prefetch = usize::from(prefetch.max(1));
        let (tx, rx) = mpsc::channel(prefetch);
        let token = CancellationToken::new();

        let consumer_id = {
            let mut state = self.inner.lock();
            state.next_consumer_id += 1;
            let id = state.next_consumer_id;
            let q = state.queues.get_mut(queue).ok_or_else(|| {
                BrokerError::operation(
                    ErrorKind::NotFound,
                    format!("NOT_FOUND - no queue '{}'", queue),
                )
            })?;
            q.consumers.push(MemoryConsumer {
                id,
                tx,
                prefetch,
                unacked: BTreeMap::new(),
            });
            self.inner.dispatch(&mut state, queue);
            id
        };

        let inner = Arc::clone(&self.inner);
        let queue_name = queue.to_string();
        let cancelled = token.clone();
        tokio::spawn(async move {
            cancelled.cancelled().await;
            inner.cancel_consumer(&queue_name, consumer_id);
        });

        Ok(DeliveryStream::new(rx, Some(token.drop_guard())))
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst) && self.inner.lock().channel_closed.is_none()
    }

    async fn reconnect(&self) -> BrokerResult<()> {
        {
            let mut state = self.inner.lock();
            if state.refused_reconnects > 0 {
                state.refused_reconnects -= 1;
                return Err(BrokerError::operation(
                    ErrorKind::ConnectionRefused,
                    "connection refused (injected)",
                ));
            }
            state.channel_closed = None;
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageProperties;

    fn message(body: &str) -> OutgoingMessage {
        OutgoingMessage {
            body: body.as_bytes().to_vec(),
            properties: MessageProperties::default(),
        }
    }

    async fn setup(broker: &MemoryBroker) {
        broker.declare_exchange(&ExchangeSpec::topic("events")).await.unwrap();
        broker.declare_exchange(&ExchangeSpec::direct("dlx")).await.unwrap();
        broker
            .declare_queue(&QueueSpec::durable("work").with_dead_letter("dlx", "work"))
            .await
            .unwrap();
        broker.declare_queue(&QueueSpec::durable("dead")).await.unwrap();
        broker.bind_queue(&Binding::new("work", "events", "message.*")).await.unwrap();
        broker.bind_queue(&Binding::new("dead", "dlx", "work")).await.unwrap();
    }

    #[tokio::test]
    async fn test_topic_routing_and_ack() {
        let broker = MemoryBroker::new();
        setup(&broker).await;

        broker.publish("events", "message.received", message("a")).await.unwrap();
        broker.publish("events", "other.thing", message("b")).await.unwrap();
        assert_eq!(broker.queue_depth("work"), 1);

        let mut stream = broker.consume("work", "c1", 10).await.unwrap();
        let delivery = stream.next().await.unwrap();
        assert_eq!(delivery.body, b"a");
        assert_eq!(broker.unacked_count("work"), 1);

        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count("work"), 0);
        assert!(matches!(
            delivery.ack().await,
            Err(BrokerError::UnknownDeliveryTag(_))
        ));
    }

    #[tokio::test]
    async fn test_prefetch_limits_in_flight() {
        let broker = MemoryBroker::new();
        setup(&broker).await;
        for i in 0..3 {
            broker
                .publish("events", "message.x", message(&i.to_string()))
                .await
                .unwrap();
        }

        let mut stream = broker.consume("work", "c1", 1).await.unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(broker.unacked_count("work"), 1);
        assert_eq!(broker.queue_depth("work"), 2);

        first.ack().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(second.body, b"1");
    }

    #[tokio::test]
    async fn test_nack_requeue_and_dead_letter() {
        let broker = MemoryBroker::new();
        setup(&broker).await;
        broker.publish("events", "message.x", message("m")).await.unwrap();

        let mut stream = broker.consume("work", "c1", 10).await.unwrap();
        let delivery = stream.next().await.unwrap();
        delivery.nack(true).await.unwrap();

        let again = stream.next().await.unwrap();
        assert!(again.redelivered);
        again.nack(false).await.unwrap();

        let dead = broker.messages("dead");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].routing_key, "work");
        let props = &dead[0].message.properties;
        assert_eq!(props.header_str(headers::FIRST_DEATH_REASON), Some("rejected"));
        assert_eq!(props.header_str(headers::FIRST_DEATH_QUEUE), Some("work"));
        assert_eq!(props.header_str(headers::FIRST_DEATH_EXCHANGE), Some("events"));
    }

    #[tokio::test]
    async fn test_redeclare_with_other_arguments_fails() {
        let broker = MemoryBroker::new();
        setup(&broker).await;

        setup(&broker).await; // idempotent
        let err = broker
            .declare_queue(&QueueSpec::durable("work"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert!(!broker.is_connected());
        assert!(broker.declare_queue(&QueueSpec::durable("other")).await.unwrap_err().is_connection_error());
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_closes_channel_until_reconnect() {
        let broker = MemoryBroker::new();
        setup(&broker).await;

        let err = broker.publish("nope", "k", message("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!broker.is_connected());

        let err = broker.publish("events", "message.x", message("y")).await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(broker.queue_depth("work"), 0);

        broker.reconnect().await.unwrap();
        assert!(broker.is_connected());
        broker.publish("events", "message.x", message("z")).await.unwrap();
        assert_eq!(broker.queue_depth("work"), 1);
    }

    #[tokio::test]
    async fn test_closed_channel_leaves_consumers_running() {
        let broker = MemoryBroker::new();
        setup(&broker).await;
        broker.publish("events", "message.x", message("m")).await.unwrap();
        let mut stream = broker.consume("work", "c1", 10).await.unwrap();

        assert!(broker.publish("nope", "k", message("x")).await.is_err());

        let delivery = stream.next().await.unwrap();
        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count("work"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_requeues_unacked() {
        let broker = MemoryBroker::new();
        setup(&broker).await;
        broker.publish("events", "message.x", message("m")).await.unwrap();

        let mut stream = broker.consume("work", "c1", 10).await.unwrap();
        let _delivery = stream.next().await.unwrap();

        broker.disconnect();
        assert!(stream.next().await.is_none());
        assert_eq!(broker.queue_depth("work"), 1);
        assert!(broker.publish("events", "message.x", message("n")).await.unwrap_err().is_connection_error());

        broker.refuse_reconnects(1);
        assert!(broker.reconnect().await.is_err());
        broker.reconnect().await.unwrap();
        assert!(broker.is_connected());
        assert!(broker.messages("work")[0].redelivered);
    }

    #[tokio::test]
    async fn test_dropping_stream_returns_unacked() {
        let broker = MemoryBroker::new();
        setup(&broker).await;
        broker.publish("events", "message.x", message("m")).await.unwrap();

        let mut stream = broker.consume("work", "c1", 10).await.unwrap();
        let _delivery = stream.next().await.unwrap();
        drop(stream);

        // Cancellation runs on a spawned task
        for _ in 0..10 {
            if broker.queue_depth("work") == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(broker.queue_depth("work"), 1);
    }
}
