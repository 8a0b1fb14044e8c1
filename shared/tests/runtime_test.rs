// ============================================================================
// Runtime Integration Tests
// ============================================================================
//
// The whole relay on in-memory backends: provider inbound channel through to
// the message store, and send commands through to the session provider.
//
// ============================================================================


use async_trait::async_trait;
use relay_error::RelayResult;
use relay_shared::broker::MemoryBroker;
use relay_shared::persistence::MemoryMessageStore;
use relay_shared::runtime::{RelayBackends, RelayRuntime};
use relay_shared::sessions::{InboundMessage, SendReceipt, SessionInfo, SessionProvider};
use relay_shared::storage::MemoryKeyValueStore;
use relay_shared::stream_bridge::MemoryStreamLog;
use relay_types::{DomainEvent, Priority, SendCommand};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::{test_config, wait_for};

#[derive(Default)]
struct RecordingSessions {
    sent: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl SessionProvider for RecordingSessions {
    async fn list_active_sessions(&self) -> RelayResult<Vec<SessionInfo>> {
        Ok(vec![SessionInfo {
            id: "session-1".into(),
            tenant_id: "acme".into(),
        }])
    }

    async fn send(&self, session_id: &str, recipient: &str, content: &str) -> RelayResult<SendReceipt> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((session_id.into(), recipient.into(), content.into()));
        Ok(SendReceipt {
            id: format!("provider-{}", sent.len()),
        })
    }
}

struct Harness {
    broker: MemoryBroker,
    store: MemoryMessageStore,
    log: MemoryStreamLog,
    runtime: RelayRuntime,
}

async fn start(sessions: Option<Arc<dyn SessionProvider>>) -> Harness {
    let broker = MemoryBroker::new();
    let store = MemoryMessageStore::new();
    let log = MemoryStreamLog::new();
    let runtime = RelayRuntime::start(
        &test_config(),
        RelayBackends {
            broker: Arc::new(broker.clone()),
            kv: Arc::new(MemoryKeyValueStore::new()),
            stream_log: Arc::new(log.clone()),
            message_store: Arc::new(store.clone()),
            sessions,
        },
    )
    .await
    .unwrap();
    Harness {
        broker,
        store,
        log,
        runtime,
    }
}

#[tokio::test(start_paused = true)]
async fn test_inbound_message_reaches_message_store() {
    let harness = start(None).await;
    let inbound = harness.runtime.inbound_sender();

    for i in 0..3 {
        inbound
            .send(InboundMessage {
                tenant_id: "acme".into(),
                session_id: "session-1".into(),
                from: format!("1555000{i}"),
                message_type: "text".into(),
                content: serde_json::json!({ "text": format!("hello {i}") }),
                timestamp: None,
            })
            .await
            .unwrap();
    }

    let store = harness.store.clone();
    assert!(wait_for(Duration::from_secs(5), || async { store.len() == 3 }).await);

    let stream = harness.runtime.bridge().stream_key().to_string();
    assert_eq!(harness.log.len(&stream), 3);
    assert!(
        wait_for(Duration::from_secs(5), || async {
            harness.log.pending_count(&stream, &test_config().stream.group) == 0
        })
        .await
    );
    assert_eq!(harness.broker.queue_depth("relay.inbound"), 0);
    assert!(store.all().iter().all(|r| r.tenant_id == "acme"));

    harness.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_command_reaches_session_provider() {
    let sessions = Arc::new(RecordingSessions::default());
    let harness = start(Some(sessions.clone() as Arc<dyn SessionProvider>)).await;

    let command = SendCommand {
        tenant_id: "acme".into(),
        recipient: "15550001".into(),
        content: "your order shipped".into(),
    };
    let published = harness
        .runtime
        .producer()
        .publish_event(DomainEvent::send_command("acme", &command), Priority::High)
        .await
        .unwrap();
    assert!(published);

    assert!(wait_for(Duration::from_secs(5), || async { !sessions.sent.lock().unwrap().is_empty() }).await);
    assert_eq!(
        sessions.sent.lock().unwrap()[0],
        ("session-1".to_string(), "15550001".to_string(), "your order shipped".to_string())
    );
    assert_eq!(harness.runtime.dead_letters().count().await.unwrap(), 0);

    harness.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_every_task() {
    let harness = start(None).await;
    let token = harness.runtime.token().clone();

    tokio::time::timeout(Duration::from_secs(5), harness.runtime.shutdown())
        .await
        .unwrap();
    assert!(token.is_cancelled());
}
