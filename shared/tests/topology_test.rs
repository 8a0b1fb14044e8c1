// ============================================================================
// Topology Integration Tests
// ============================================================================


use relay_error::ErrorKind;
use relay_shared::broker::{Broker, MemoryBroker, Producer, PublishOptions, QueueSpec};
use relay_types::Priority;
use std::sync::Arc;
use test_utils::{inbound_event, setup, test_config};

#[tokio::test]
async fn test_declaring_topology_repeatedly_is_idempotent() {
    let relay = setup(test_config()).await;
    let queues = relay.broker.queue_names();
    let bindings = relay.broker.bindings();

    for _ in 0..5 {
        relay.producer.declare_topology().await.unwrap();
    }

    assert_eq!(relay.broker.queue_names(), queues);
    assert_eq!(relay.broker.bindings(), bindings);
    assert_eq!(
        queues,
        vec!["relay.dead_letters", "relay.inbound", "relay.outbound"]
    );

    let inbound = relay.broker.queue_spec("relay.inbound").unwrap();
    assert_eq!(inbound.arguments.dead_letter_exchange.as_deref(), Some("relay.dlx"));
    assert_eq!(inbound.arguments.dead_letter_routing_key.as_deref(), Some("relay.inbound"));
    let dlq = relay.broker.queue_spec("relay.dead_letters").unwrap();
    assert_eq!(dlq.arguments.dead_letter_exchange, None);
}

#[tokio::test]
async fn test_conflicting_queue_arguments_fail_declaration() {
    let broker = MemoryBroker::new();
    broker
        .declare_queue(&QueueSpec::durable("relay.inbound"))
        .await
        .unwrap();

    let config = test_config();
    let producer = Producer::new(Arc::new(broker), config.broker.clone(), &config.retry, "relay-test");
    let err = producer.declare_topology().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

#[tokio::test]
async fn test_send_to_queue_declares_dead_lettered_queue_once() {
    let relay = setup(test_config()).await;

    for i in 0..3 {
        let sent = relay
            .producer
            .send_to_queue("relay.audit", &serde_json::json!({ "n": i }), PublishOptions::default())
            .await
            .unwrap();
        assert!(sent);
    }

    assert_eq!(relay.broker.queue_depth("relay.audit"), 3);
    let spec = relay.broker.queue_spec("relay.audit").unwrap();
    assert_eq!(spec.arguments.dead_letter_routing_key.as_deref(), Some("relay.audit"));
    let dead_letter_bindings = relay
        .broker
        .bindings()
        .into_iter()
        .filter(|b| b.routing_key == "relay.audit")
        .count();
    assert_eq!(dead_letter_bindings, 1);
    assert!(relay.producer.topology().contains_queue("relay.audit"));
}

#[tokio::test(start_paused = true)]
async fn test_publish_after_connection_loss_reconnects_and_redeclares() {
    let relay = setup(test_config()).await;
    let before = relay.broker.declaration_count();

    relay.broker.disconnect();
    relay.broker.refuse_reconnects(2);

    let event = inbound_event("acme", "s1", "15550001", "after the outage");
    assert!(relay.producer.publish_event(event, Priority::Medium).await.unwrap());

    assert!(relay.broker.is_connected());
    assert!(relay.broker.declaration_count() > before);
    assert_eq!(relay.broker.queue_depth("relay.inbound"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_publish_fails_when_broker_stays_down() {
    let relay = setup(test_config()).await;
    relay.broker.disconnect();
    relay.broker.refuse_reconnects(100);

    let event = inbound_event("acme", "s1", "15550001", "lost");
    let err = relay
        .producer
        .publish_event(event, Priority::Medium)
        .await
        .unwrap_err();
    assert!(err.is_connection_error());
}

#[tokio::test(start_paused = true)]
async fn test_publish_to_missing_exchange_does_not_wedge_later_publishes() {
    let relay = setup(test_config()).await;

    let sent = relay
        .producer
        .publish("relay.missing", "anything", &serde_json::json!({ "n": 1 }), PublishOptions::default())
        .await
        .unwrap();
    assert!(!sent);
    assert!(!relay.broker.is_connected());

    let event = inbound_event("acme", "s1", "15550001", "after the soft error");
    assert!(relay.producer.publish_event(event, Priority::Medium).await.unwrap());
    assert!(relay.broker.is_connected());
    assert_eq!(relay.broker.queue_depth("relay.inbound"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_declaration_is_recovered_by_next_publish() {
    let relay = setup(test_config()).await;

    // Same queue, different arguments
    let err = relay
        .broker
        .declare_queue(&QueueSpec::durable("relay.inbound"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    let event = inbound_event("acme", "s1", "15550001", "still flowing");
    assert!(relay.producer.publish_event(event, Priority::Medium).await.unwrap());
    assert_eq!(relay.broker.queue_depth("relay.inbound"), 1);
}
