// ============================================================================
// Send-command handler
// ============================================================================
//
// Business handler behind the outbound queue:
//
//   SendCommand ─▶ resolve tenant → exactly one active session
//               ─▶ admission control (until admitted once)
//               ─▶ session-send circuit breaker ─▶ SessionProvider::send
//
// A command that passes admission and then fails to send is retried with the
// x-admitted header, and skips admission from then on: its content is already
// recorded, so it would otherwise be rejected as its own duplicate. A
// rate-limited command is retried without the header and is checked again.
//
// ============================================================================

use crate::broker::{DeliveryError, DeliveryInfo, HandlerOutcome, MessageHandler};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::rate_limit::{RateLimiterDedup, RejectReason};
use crate::sessions::{SessionInfo, SessionProvider};
use crate::utils::log_safe_id;
use async_trait::async_trait;
use relay_config::LoggingConfig;
use relay_error::{ErrorKind, RelayError};
use relay_types::{EventKind, QueueMessage, SendCommand, headers};
use std::sync::Arc;

/// Breaker guarding calls into the session provider
pub const SESSION_SEND_BREAKER: &str = "session-send";

pub struct SendCommandHandler {
    sessions: Arc<dyn SessionProvider>,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiterDedup>,
    logging: LoggingConfig,
}

impl SendCommandHandler {
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        breakers: Arc<CircuitBreakerRegistry>,
        limiter: Arc<RateLimiterDedup>,
        logging: LoggingConfig,
    ) -> Self {
        Self {
            sessions,
            breakers,
            limiter,
            logging,
        }
    }

    /// Pull the command out of an envelope: either a wrapped `send-command`
    /// event or a bare command in `content`
    fn parse_command(message: &QueueMessage) -> Result<SendCommand, DeliveryError> {
        let content = match message.domain_event() {
            Some(event) if event.kind == EventKind::SendCommand => event.payload,
            Some(event) => {
                return Err(DeliveryError::new(
                    ErrorKind::Validation,
                    format!("unexpected event kind {} on command queue", event.kind.as_str()),
                ));
            }
            None => message.content.clone(),
        };
        let command: SendCommand = serde_json::from_value(content).map_err(|e| {
            DeliveryError::new(ErrorKind::Validation, format!("invalid send command: {}", e))
        })?;
        if command.recipient.trim().is_empty() {
            return Err(DeliveryError::new(ErrorKind::Validation, "empty recipient"));
        }
        Ok(command)
    }

    /// The tenant's single active session
    async fn resolve_session(&self, tenant_id: &str) -> Result<SessionInfo, DeliveryError> {
        let sessions = self
            .sessions
            .list_active_sessions()
            .await
            .map_err(DeliveryError::from)?;

        let mut matching = sessions.into_iter().filter(|s| s.tenant_id == tenant_id);
        match (matching.next(), matching.next()) {
            (Some(session), None) => Ok(session),
            (None, _) => Err(RelayError::routing(format!(
                "no active session for tenant {}",
                tenant_id
            ))
            .into()),
            (Some(_), Some(_)) => Err(RelayError::routing(format!(
                "ambiguous destination: several active sessions for tenant {}",
                tenant_id
            ))
            .into()),
        }
    }

    fn safe_id(&self, id: &str) -> String {
        if self.logging.enable_user_identifiers {
            id.to_string()
        } else {
            log_safe_id(id, &self.logging.hash_salt)
        }
    }
}

#[async_trait]
impl MessageHandler for SendCommandHandler {
    async fn handle(
        &self,
        message: &QueueMessage,
        info: DeliveryInfo<'_>,
    ) -> Result<HandlerOutcome, DeliveryError> {
        let command = Self::parse_command(message)?;
        let recipient = self.safe_id(&command.recipient);
        let admitted = info.properties.header_i64(headers::ADMITTED) == Some(1);
        let session = self.resolve_session(&command.tenant_id).await.map_err(|e| {
            if admitted {
                e.with_retry_header(headers::ADMITTED, 1u32)
            } else {
                e
            }
        })?;

        if !admitted {
            let key = RateLimiterDedup::key(&session.id, &command.recipient);
            let decision = self.limiter.can_send(&key, &command.content);
            match decision.reason {
                None => {}
                Some(RejectReason::Duplicate) => {
                    return Ok(HandlerOutcome::Skipped(format!(
                        "duplicate content to {} within window",
                        recipient
                    )));
                }
                Some(RejectReason::RateLimited) => {
                    let mut err = DeliveryError::new(
                        ErrorKind::RateLimited,
                        format!("rate limit reached for {}", recipient),
                    );
                    if let Some(remaining) = decision.time_remaining {
                        err = err.with_retry_after(remaining);
                    }
                    return Err(err);
                }
            }
        }

        let breaker = self.breakers.get(SESSION_SEND_BREAKER);
        let receipt = breaker
            .execute(|| {
                self.sessions
                    .send(&session.id, &command.recipient, &command.content)
            })
            .await
            .map_err(|e| DeliveryError::from(e).with_retry_header(headers::ADMITTED, 1u32))?;

        tracing::info!(
            message_id = %message.id,
            session_id = %session.id,
            recipient = %recipient,
            provider_id = %receipt.id,
            "Command sent"
        );
        Ok(HandlerOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageProperties;
    use crate::sessions::SendReceipt;
    use relay_config::{CircuitBreakerSettings, RateLimitConfig};
    use relay_error::RelayResult;
    use relay_types::{DomainEvent, Priority};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeSessions {
        sessions: Mutex<Vec<SessionInfo>>,
        sent: AtomicU32,
        fail: Mutex<Option<String>>,
    }

    #[async_trait]
    impl SessionProvider for FakeSessions {
        async fn list_active_sessions(&self) -> RelayResult<Vec<SessionInfo>> {
            Ok(self.sessions.lock().unwrap().clone())
        }

        async fn send(&self, _session: &str, _recipient: &str, _content: &str) -> RelayResult<SendReceipt> {
            if let Some(msg) = self.fail.lock().unwrap().clone() {
                return Err(RelayError::internal(msg));
            }
            let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SendReceipt { id: format!("wa-{n}") })
        }
    }

    fn session(id: &str, tenant: &str) -> SessionInfo {
        SessionInfo {
            id: id.into(),
            tenant_id: tenant.into(),
        }
    }

    fn handler(sessions: Arc<FakeSessions>) -> SendCommandHandler {
        SendCommandHandler::new(
            sessions,
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerSettings::default())),
            Arc::new(RateLimiterDedup::new(RateLimitConfig::default())),
            LoggingConfig::default(),
        )
    }

    fn command(tenant: &str, content: &str) -> QueueMessage {
        let cmd = SendCommand {
            tenant_id: tenant.into(),
            recipient: "15550001".into(),
            content: content.into(),
        };
        DomainEvent::send_command(tenant, &cmd).into_queue_message(
            "api",
            Priority::High,
            3,
            "relay.outbound",
        )
    }

    async fn run(handler: &SendCommandHandler, message: &QueueMessage) -> Result<HandlerOutcome, DeliveryError> {
        run_with(handler, message, MessageProperties::default()).await
    }

    async fn run_with(
        handler: &SendCommandHandler,
        message: &QueueMessage,
        props: MessageProperties,
    ) -> Result<HandlerOutcome, DeliveryError> {
        let info = DeliveryInfo {
            queue: "relay.outbound",
            exchange: "relay.commands",
            routing_key: "command.send.acme",
            redelivered: false,
            properties: &props,
        };
        handler.handle(message, info).await
    }

    #[tokio::test]
    async fn test_sends_through_single_session() {
        let sessions = Arc::new(FakeSessions::default());
        sessions.sessions.lock().unwrap().extend([session("s1", "acme"), session("s2", "other")]);
        let handler = handler(sessions.clone());

        assert_eq!(run(&handler, &command("acme", "hi")).await.unwrap(), HandlerOutcome::Done);
        assert_eq!(sessions.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_absent_or_ambiguous_session_is_routing_error() {
        let sessions = Arc::new(FakeSessions::default());
        let handler = handler(sessions.clone());

        let err = run(&handler, &command("acme", "hi")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Routing);

        sessions.sessions.lock().unwrap().extend([session("s1", "acme"), session("s2", "acme")]);
        let err = run(&handler, &command("acme", "hi")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Routing);
        assert!(!err.is_retryable());
        assert_eq!(sessions.sent.load(Ordering::SeqCst), 0);
    }

    fn admitted() -> MessageProperties {
        let mut props = MessageProperties::default();
        props.headers.insert(headers::ADMITTED.to_string(), 1u32.into());
        props
    }

    #[tokio::test]
    async fn test_duplicate_is_skipped_but_admitted_retry_is_not_checked() {
        let sessions = Arc::new(FakeSessions::default());
        sessions.sessions.lock().unwrap().push(session("s1", "acme"));
        let handler = handler(sessions.clone());

        let first = command("acme", "same text");
        assert_eq!(run(&handler, &first).await.unwrap(), HandlerOutcome::Done);

        let repeat = command("acme", "same text");
        assert!(matches!(run(&handler, &repeat).await.unwrap(), HandlerOutcome::Skipped(_)));

        // A retry of an admitted message bypasses admission
        let retry = first.next_attempt();
        assert_eq!(run_with(&handler, &retry, admitted()).await.unwrap(), HandlerOutcome::Done);
        assert_eq!(sessions.sent.load(Ordering::SeqCst), 2);

        // Without the header a retry goes through admission again
        assert!(matches!(run(&handler, &retry).await.unwrap(), HandlerOutcome::Skipped(_)));
        assert_eq!(sessions.sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_retry_is_checked_again() {
        let sessions = Arc::new(FakeSessions::default());
        sessions.sessions.lock().unwrap().push(session("s1", "acme"));
        let handler = SendCommandHandler::new(
            sessions.clone(),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerSettings::default())),
            Arc::new(RateLimiterDedup::new(RateLimitConfig {
                max_per_window: 1,
                ..RateLimitConfig::default()
            })),
            LoggingConfig::default(),
        );

        assert_eq!(run(&handler, &command("acme", "one")).await.unwrap(), HandlerOutcome::Done);

        let err = run(&handler, &command("acme", "two")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert!(err.retry_after.is_some());
        assert!(err.retry_headers.is_empty());

        // Its retry carries no admission header and is limited again
        let err = run(&handler, &command("acme", "two").next_attempt()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(sessions.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_failure_after_admission_marks_retry_admitted() {
        let sessions = Arc::new(FakeSessions::default());
        sessions.sessions.lock().unwrap().push(session("s1", "acme"));
        *sessions.fail.lock().unwrap() = Some("socket hang up".into());
        let handler = handler(sessions);

        let err = run(&handler, &command("acme", "hi")).await.unwrap_err();
        assert_eq!(
            err.retry_headers.get(headers::ADMITTED),
            Some(&crate::broker::HeaderValue::Int(1))
        );
    }

    #[tokio::test]
    async fn test_invalid_command_is_validation_error() {
        let handler = handler(Arc::new(FakeSessions::default()));
        let message = QueueMessage::new(serde_json::json!({"nope": true}), "api", 3, "relay.outbound");

        let err = run(&handler, &message).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_provider_failure_is_classified() {
        let sessions = Arc::new(FakeSessions::default());
        sessions.sessions.lock().unwrap().push(session("s1", "acme"));
        *sessions.fail.lock().unwrap() = Some("socket hang up".into());
        let handler = handler(sessions);

        let err = run(&handler, &command("acme", "hi")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionReset);
        assert!(err.is_retryable());
    }
}
