// ============================================================================
// AMQP broker (RabbitMQ via lapin)
// ============================================================================
//
// - One connection, one confirm-mode channel for declarations and publishes.
//   A soft error (NOT_FOUND, PRECONDITION_FAILED) closes only that channel;
//   `reconnect` reopens it on the live connection
// - One extra channel per consumer so that basic_qos is per consumer and
//   closing it hands unacked deliveries back to the queue
// - Persistent delivery mode on every publish; a publish only succeeds once
//   the broker confirms it
//
// ============================================================================

use super::{
    AckHandle, Acker, Binding, Broker, BrokerError, BrokerResult, Delivery, DeliveryStream,
    ExchangeKind, ExchangeSpec, HeaderValue, Headers, MessageProperties, OutgoingMessage,
    QueueSpec,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use relay_config::BrokerConfig;
use relay_types::headers;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// AMQP delivery mode 2 = persistent
const PERSISTENT: u8 = 2;

struct Session {
    connection: Arc<Connection>,
    channel: Channel,
}

impl Session {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

pub struct AmqpBroker {
    url: String,
    url_for_logging: String,
    session: RwLock<Option<Arc<Session>>>,
}

impl AmqpBroker {
    /// Connect and open the confirm-mode channel
    pub async fn connect(config: &BrokerConfig) -> BrokerResult<Self> {
        let broker = Self {
            url: config.url.clone(),
            url_for_logging: config.url_for_logging(),
            session: RwLock::new(None),
        };
        broker.open_session().await?;
        Ok(broker)
    }

    async fn open_session(&self) -> BrokerResult<()> {
        tracing::info!(url = %self.url_for_logging, "Connecting to AMQP broker");

        let connection =
            Arc::new(Connection::connect(&self.url, ConnectionProperties::default()).await?);
        let channel = confirm_channel(&connection).await?;
        self.store_session(connection, channel);

        tracing::info!(url = %self.url_for_logging, "AMQP broker connected");
        Ok(())
    }

    fn store_session(&self, connection: Arc<Connection>, channel: Channel) {
        *self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(Session {
            connection,
            channel,
        }));
    }

    /// The current session, if both its connection and its channel are open
    fn session(&self) -> BrokerResult<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .filter(|s| s.is_open())
            .ok_or_else(|| BrokerError::ConnectionClosed(self.url_for_logging.clone()))
    }
}

async fn confirm_channel(connection: &Connection) -> BrokerResult<Channel> {
    let channel = connection.create_channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    Ok(channel)
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()> {
        let session = self.session()?;
        let kind = match spec.kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        session
            .channel
            .exchange_declare(
                &spec.name,
                kind,
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()> {
        let session = self.session()?;

        let mut arguments = FieldTable::default();
        if let Some(dlx) = &spec.arguments.dead_letter_exchange {
            arguments.insert(
                headers::ARG_DEAD_LETTER_EXCHANGE.into(),
                AMQPValue::LongString(dlx.as_str().into()),
            );
        }
        if let Some(key) = &spec.arguments.dead_letter_routing_key {
            arguments.insert(
                headers::ARG_DEAD_LETTER_ROUTING_KEY.into(),
                AMQPValue::LongString(key.as_str().into()),
            );
        }

        session
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                arguments,
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, binding: &Binding) -> BrokerResult<()> {
        let session = self.session()?;
        session
            .channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> BrokerResult<()> {
        let session = self.session()?;
        let properties = to_basic_properties(&message.properties);

        let confirmation = session
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Nack(_) => Err(BrokerError::NotConfirmed(format!(
                "{} / {}",
                exchange, routing_key
            ))),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> BrokerResult<DeliveryStream> {
        let session = self.session()?;
        let channel = session.connection.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        let mut consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let (tx, rx) = mpsc::channel(usize::from(prefetch.max(1)));
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let queue_name = queue.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    next = consumer.next() => match next {
                        Some(Ok(delivery)) => {
                            if tx.send(from_lapin_delivery(delivery)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(queue = %queue_name, error = %e, "AMQP consumer stream failed");
                            break;
                        }
                        None => break,
                    }
                }
            }

            // Closing the channel returns unacked deliveries to the queue
            if channel.status().connected() {
                if let Err(e) = channel.close(200, "consumer stopped").await {
                    tracing::debug!(queue = %queue_name, error = %e, "Consumer channel close failed");
                }
            }
            tracing::info!(queue = %queue_name, "AMQP consumer stopped");
        });

        Ok(DeliveryStream::new(rx, Some(token.drop_guard())))
    }

    fn is_connected(&self) -> bool {
        self.session().is_ok()
    }

    async fn reconnect(&self) -> BrokerResult<()> {
        let stale = self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(stale) = stale {
            if stale.connection.status().connected() {
                // Only the channel died: reopen it on the same connection
                match confirm_channel(&stale.connection).await {
                    Ok(channel) => {
                        tracing::info!(url = %self.url_for_logging, "AMQP channel reopened");
                        self.store_session(Arc::clone(&stale.connection), channel);
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "AMQP channel reopen failed, reconnecting");
                        let _ = stale.connection.close(200, "reconnecting").await;
                    }
                }
            }
        }
        self.open_session().await
    }
}

struct LapinAck(lapin::acker::Acker);

#[async_trait]
impl AckHandle for LapinAck {
    async fn ack(&self) -> BrokerResult<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(BrokerError::from)
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(BrokerError::from)
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let properties = MessageProperties {
        message_id: props.message_id().as_ref().map(|s| s.as_str().to_string()),
        timestamp: *props.timestamp(),
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
        priority: *props.priority(),
        persistent: *props.delivery_mode() == Some(PERSISTENT),
        headers: props.headers().as_ref().map(from_field_table).unwrap_or_default(),
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        body: delivery.data,
        properties,
        acker: Acker::new(Arc::new(LapinAck(delivery.acker))),
    }
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default()
        .with_content_type(
            props
                .content_type
                .as_deref()
                .unwrap_or("application/json")
                .into(),
        )
        .with_headers(to_field_table(&props.headers));

    if props.persistent {
        basic = basic.with_delivery_mode(PERSISTENT);
    }
    if let Some(id) = &props.message_id {
        basic = basic.with_message_id(id.as_str().into());
    }
    if let Some(ts) = props.timestamp {
        basic = basic.with_timestamp(ts);
    }
    if let Some(priority) = props.priority {
        basic = basic.with_priority(priority);
    }
    basic
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers {
        let value = match value {
            HeaderValue::Str(s) => AMQPValue::LongString(s.as_str().into()),
            HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
        };
        table.insert(name.as_str().into(), value);
    }
    table
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(name, value)| {
            let value = match value {
                AMQPValue::LongString(s) => {
                    HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_string()),
                AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
                AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::LongUInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortUInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortShortInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortShortUInt(i) => HeaderValue::Int(i64::from(*i)),
                _ => return None,
            };
            Some((name.as_str().to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_table_conversion() {
        let mut headers = Headers::new();
        headers.insert("x-retry-count".to_string(), HeaderValue::Int(2));
        headers.insert("x-error-type".to_string(), HeaderValue::from("TIMEOUT"));

        let table = to_field_table(&headers);
        assert_eq!(from_field_table(&table), headers);
    }

    #[test]
    fn test_basic_properties_are_persistent() {
        let props = MessageProperties {
            message_id: Some("m1".to_string()),
            persistent: true,
            priority: Some(5),
            ..Default::default()
        };
        let basic = to_basic_properties(&props);
        assert_eq!(*basic.delivery_mode(), Some(PERSISTENT));
        assert_eq!(basic.message_id().as_ref().map(|s| s.as_str()), Some("m1"));
        assert_eq!(*basic.priority(), Some(5));
    }

    #[tokio::test]
    #[ignore] // Requires RabbitMQ
    async fn test_publish_and_consume_roundtrip() {
        let broker = AmqpBroker::connect(&BrokerConfig::default()).await.unwrap();
        let queue = QueueSpec::durable("relay.test.roundtrip");
        broker.declare_queue(&queue).await.unwrap();

        let message = OutgoingMessage {
            body: b"{}".to_vec(),
            properties: MessageProperties {
                persistent: true,
                ..Default::default()
            },
        };
        broker.publish("", &queue.name, message).await.unwrap();

        let mut stream = broker.consume(&queue.name, "test", 1).await.unwrap();
        let delivery = stream.next().await.unwrap();
        assert_eq!(delivery.body, b"{}");
        delivery.ack().await.unwrap();
    }
}
