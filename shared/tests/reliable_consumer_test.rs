// ============================================================================
// Reliable Consumer Integration Tests
// ============================================================================
//
// Retry, dead-letter and discard paths of the outbound consumer against the
// in-memory broker. Paused clock: backoff delays elapse instantly.
//
// ============================================================================


use relay_error::ErrorKind;
use relay_shared::broker::{Broker, ConsumerOptions, MessageHandler, ReliableConsumer, Resolution};
use relay_types::{DomainEvent, Priority, SendCommand, headers};
use std::sync::Arc;
use std::time::Duration;
use test_utils::{ScriptedHandler, TestRelay, setup, test_config, wait_for};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(30);

fn consumer(relay: &TestRelay, handler: Arc<dyn MessageHandler>, token: &CancellationToken) -> Arc<ReliableConsumer> {
    ReliableConsumer::new(
        Arc::clone(&relay.producer),
        handler,
        ConsumerOptions {
            queue: relay.config.broker.outbound_queue.clone(),
            consumer_tag: "test-outbound".to_string(),
            prefetch: 10,
            retry: relay.config.retry.clone(),
            dead_letter_enabled: true,
        },
        token.clone(),
    )
}

async fn publish_command(relay: &TestRelay) -> String {
    let command = SendCommand {
        tenant_id: "acme".to_string(),
        recipient: "15550001".to_string(),
        content: "hello".to_string(),
    };
    let event = DomainEvent::send_command("acme", &command);
    let id = event.id.clone();
    assert!(relay.producer.publish_event(event, Priority::High).await.unwrap());
    id
}

fn settled(relay: &TestRelay) -> bool {
    let queue = &relay.config.broker.outbound_queue;
    relay.broker.queue_depth(queue) == 0 && relay.broker.unacked_count(queue) == 0
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_then_ack() {
    let relay = setup(test_config()).await;
    let handler = ScriptedHandler::failing(ErrorKind::ConnectionReset, 2);
    let token = CancellationToken::new();
    let task = tokio::spawn(consumer(&relay, handler.clone(), &token).run());

    publish_command(&relay).await;

    assert!(wait_for(WAIT, || async { handler.attempts() == 3 && settled(&relay) }).await);
    assert_eq!(*handler.seen_retry_counts.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(relay.broker.queue_depth(&relay.config.broker.dead_letter_queue), 0);

    // Retries travel through the default exchange but remember where the
    // message was first published
    let retries: Vec<_> = relay
        .broker
        .published()
        .into_iter()
        .filter(|m| m.exchange.is_empty())
        .collect();
    assert_eq!(retries.len(), 2);
    assert_eq!(
        retries[1].message.properties.header_str(headers::ORIGINAL_EXCHANGE),
        Some("relay.commands")
    );
    assert_eq!(
        retries[1].message.properties.header_str(headers::ORIGINAL_ROUTING_KEY),
        Some("command.send.acme")
    );

    token.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_terminal_failure_is_dead_lettered_without_retry() {
    let relay = setup(test_config()).await;
    let handler = ScriptedHandler::failing(ErrorKind::Validation, 1);
    let token = CancellationToken::new();
    let task = tokio::spawn(consumer(&relay, handler.clone(), &token).run());

    let id = publish_command(&relay).await;

    let dlq = relay.config.broker.dead_letter_queue.clone();
    assert!(wait_for(WAIT, || async { relay.broker.queue_depth(&dlq) == 1 && settled(&relay) }).await);

    let dead = relay.broker.messages(&dlq);
    let props = &dead[0].message.properties;
    assert_eq!(props.message_id.as_deref(), Some(id.as_str()));
    assert_eq!(props.header_i64(headers::RETRY_COUNT), Some(0));
    assert_eq!(props.header_str(headers::ERROR_TYPE), Some("VALIDATION"));
    assert_eq!(props.header_str(headers::ORIGINAL_QUEUE), Some("relay.outbound"));
    assert_eq!(props.header_str(headers::TENANT_ID), Some("acme"));

    // Nothing else happens however long we wait
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(handler.attempts(), 1);
    assert_eq!(relay.broker.queue_depth(&dlq), 1);

    token.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_are_dead_lettered_with_count() {
    let relay = setup(test_config()).await;
    let handler = ScriptedHandler::failing(ErrorKind::Timeout, 10);
    let token = CancellationToken::new();
    let task = tokio::spawn(consumer(&relay, handler.clone(), &token).run());

    publish_command(&relay).await;

    let dlq = relay.config.broker.dead_letter_queue.clone();
    assert!(wait_for(WAIT, || async { relay.broker.queue_depth(&dlq) == 1 && settled(&relay) }).await);
    // First attempt plus max_retries
    assert_eq!(handler.attempts(), 4);
    let dead = relay.broker.messages(&dlq);
    assert_eq!(dead[0].message.properties.header_i64(headers::RETRY_COUNT), Some(3));
    assert_eq!(dead[0].message.properties.header_i64(headers::MAX_RETRIES), Some(3));

    token.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_failed_dead_letter_publish_discards() {
    let relay = setup(test_config()).await;
    let handler = ScriptedHandler::failing(ErrorKind::PermissionDenied, 1);
    let token = CancellationToken::new();
    let consumer = consumer(&relay, handler, &token);

    publish_command(&relay).await;
    relay
        .broker
        .fail_publishes_to(&relay.config.broker.dead_letter_exchange, ErrorKind::AccessRefused);

    let mut stream = relay
        .broker
        .consume(&relay.config.broker.outbound_queue, "manual", 1)
        .await
        .unwrap();
    let delivery = stream.next().await.unwrap();

    assert_eq!(consumer.process(delivery).await, Resolution::Discarded);
    assert!(settled(&relay));

    // The queue's own dead-letter arguments still catch the rejection, but
    // without any of the failure context
    let dead = relay.broker.messages(&relay.config.broker.dead_letter_queue);
    assert_eq!(dead.len(), 1);
    let props = &dead[0].message.properties;
    assert_eq!(props.header_str(headers::FIRST_DEATH_REASON), Some("rejected"));
    assert_eq!(
        props.header_str(headers::FIRST_DEATH_QUEUE),
        Some(relay.config.broker.outbound_queue.as_str())
    );
    assert_eq!(props.header_str(headers::ERROR_TYPE), None);
}

#[tokio::test]
async fn test_invalid_envelope_is_dead_lettered() {
    let relay = setup(test_config()).await;
    let handler = ScriptedHandler::failing(ErrorKind::Timeout, 0);
    let token = CancellationToken::new();
    let consumer = consumer(&relay, handler.clone(), &token);

    relay
        .producer
        .publish_bytes(
            "",
            &relay.config.broker.outbound_queue,
            b"definitely not an envelope".to_vec(),
            Default::default(),
        )
        .await
        .unwrap();

    let mut stream = relay
        .broker
        .consume(&relay.config.broker.outbound_queue, "manual", 1)
        .await
        .unwrap();
    let delivery = stream.next().await.unwrap();

    assert_eq!(consumer.process(delivery).await, Resolution::DeadLettered);
    assert_eq!(handler.attempts(), 0);
    let dead = relay.broker.messages(&relay.config.broker.dead_letter_queue);
    assert_eq!(dead[0].message.properties.header_str(headers::ERROR_TYPE), Some("VALIDATION"));
    assert_eq!(dead[0].message.body, b"definitely not an envelope");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_returns_pending_retry_to_queue() {
    let mut config = test_config();
    config.retry.base_delay = Duration::from_secs(60);
    config.retry.max_delay = Duration::from_secs(60);
    let relay = setup(config).await;
    let handler = ScriptedHandler::failing(ErrorKind::ConnectionReset, 1);
    let token = CancellationToken::new();
    let task = tokio::spawn(consumer(&relay, handler.clone(), &token).run());

    publish_command(&relay).await;
    assert!(wait_for(Duration::from_secs(5), || async { handler.attempts() == 1 }).await);

    token.cancel();
    task.await.unwrap();

    let queue = relay.config.broker.outbound_queue.clone();
    assert!(
        wait_for(Duration::from_secs(5), || async {
            relay.broker.queue_depth(&queue) == 1 && relay.broker.unacked_count(&queue) == 0
        })
        .await
    );
    assert!(relay.broker.messages(&queue)[0].redelivered);
}
