// ============================================================================
// Circuit Breaker - per-dependency fail-fast gate
// ============================================================================
//
// Problem:
// - When the session provider (or any downstream) is failing, every consumer
//   delivery keeps calling it and piles latency onto an unhealthy service
//
// Solution:
// - Count consecutive failures per named dependency
// - After `failure_threshold` failures the breaker opens until `next_try_time`
// - Once the cooldown has elapsed calls go through again: a success closes
//   the breaker, a failure re-opens it with a fresh cooldown
//
// There is no separate half-open flag: "open with an elapsed cooldown" is the
// probing state.
//
// Breakers live in a CircuitBreakerRegistry built once at startup and passed
// to whoever needs one, so independent dependencies never share a budget.
//
// ============================================================================

use relay_config::{CircuitBreakerPolicy, CircuitBreakerSettings};
use relay_error::ErrorKind;
use relay_metrics::CIRCUIT_BREAKER_OPEN;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit Breaker error types
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Breaker is open, the action was not invoked
    #[error("Circuit breaker '{service}' is OPEN - retry in {}s", remaining_secs(.remaining))]
    Open { service: String, remaining: Duration },

    /// Action exceeded the policy's call timeout
    #[error("Circuit breaker '{service}' timeout ({timeout:?}) exceeded")]
    Timeout { service: String, timeout: Duration },

    /// Underlying operation failed
    #[error("Operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitBreakerError<E> {
    /// Time until the breaker lets calls through again
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CircuitBreakerError::Open { remaining, .. } => Some(*remaining),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }

    /// Failure kind for the breaker's own rejections; `None` for `Inner`
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CircuitBreakerError::Open { .. } => Some(ErrorKind::CircuitOpen),
            CircuitBreakerError::Timeout { .. } => Some(ErrorKind::Timeout),
            CircuitBreakerError::Inner(_) => None,
        }
    }
}

fn remaining_secs(remaining: &Duration) -> u64 {
    remaining.as_millis().div_ceil(1000) as u64
}

/// Snapshot of one breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitState {
    /// Consecutive failures since the last success
    pub failure_count: u32,
    pub is_open: bool,
    /// Earliest instant a call may go through while open
    pub next_try_time: Option<Instant>,
    pub total_failures: u64,
    pub total_successes: u64,
}

impl CircuitState {
    fn closed() -> Self {
        Self {
            failure_count: 0,
            is_open: false,
            next_try_time: None,
            total_failures: 0,
            total_successes: 0,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    policy: CircuitBreakerPolicy,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, policy: CircuitBreakerPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            state: Mutex::new(CircuitState::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.policy
    }

    /// Execute an async action with breaker protection.
    ///
    /// While open and cooling down the action is not invoked at all.
    pub async fn execute<F, Fut, T, E>(&self, action: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;

        let outcome = match self.policy.call_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, action()).await {
                Ok(result) => result,
                Err(_) => {
                    self.record_failure();
                    tracing::warn!(
                        service = %self.name,
                        timeout_ms = timeout.as_millis() as u64,
                        "Circuit breaker call timed out"
                    );
                    return Err(CircuitBreakerError::Timeout {
                        service: self.name.clone(),
                        timeout,
                    });
                }
            },
            None => action().await,
        };

        self.settle(outcome)
    }

    /// Synchronous variant of [`execute`](Self::execute). The call timeout
    /// does not apply.
    pub fn execute_sync<F, T, E>(&self, action: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.admit()?;
        self.settle(action())
    }

    /// Operator escape hatch: close the breaker and clear consecutive failures.
    /// Lifetime totals are kept.
    pub fn force_reset(&self) {
        let mut state = self.lock();
        state.failure_count = 0;
        state.is_open = false;
        state.next_try_time = None;
        drop(state);

        CIRCUIT_BREAKER_OPEN.with_label_values(&[self.name.as_str()]).set(0);
        tracing::info!(service = %self.name, "Circuit breaker manually reset");
    }

    pub fn state(&self) -> CircuitState {
        self.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_open
    }

    /// Remaining cooldown, if open and still cooling down
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        let state = self.lock();
        match (state.is_open, state.next_try_time) {
            (true, Some(next)) => {
                let now = Instant::now();
                (now < next).then(|| next - now)
            }
            _ => None,
        }
    }

    fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        if let Some(remaining) = self.remaining_cooldown() {
            tracing::debug!(
                service = %self.name,
                remaining_ms = remaining.as_millis() as u64,
                "Circuit breaker OPEN - rejecting call"
            );
            return Err(CircuitBreakerError::Open {
                service: self.name.clone(),
                remaining,
            });
        }
        Ok(())
    }

    fn settle<T, E>(&self, outcome: Result<T, E>) -> Result<T, CircuitBreakerError<E>> {
        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.lock();
        let was_open = state.is_open;
        state.failure_count = 0;
        state.is_open = false;
        state.next_try_time = None;
        state.total_successes += 1;
        drop(state);

        if was_open {
            CIRCUIT_BREAKER_OPEN.with_label_values(&[self.name.as_str()]).set(0);
            tracing::info!(service = %self.name, "Circuit breaker CLOSED - service recovered");
        }
    }

    fn record_failure(&self) {
        let mut state = self.lock();
        state.failure_count = state.failure_count.saturating_add(1);
        state.total_failures += 1;

        if state.failure_count < self.policy.failure_threshold {
            tracing::warn!(
                service = %self.name,
                failures = state.failure_count,
                threshold = self.policy.failure_threshold,
                "Circuit breaker failure recorded"
            );
            return;
        }

        let reopened = state.is_open;
        state.is_open = true;
        state.next_try_time = Some(Instant::now() + self.policy.cooldown);
        let failures = state.failure_count;
        drop(state);

        CIRCUIT_BREAKER_OPEN.with_label_values(&[self.name.as_str()]).set(1);
        if reopened {
            tracing::warn!(
                service = %self.name,
                cooldown_secs = self.policy.cooldown.as_secs(),
                "Circuit breaker probe failed - re-opened"
            );
        } else {
            tracing::error!(
                service = %self.name,
                failures,
                threshold = self.policy.failure_threshold,
                cooldown_secs = self.policy.cooldown.as_secs(),
                "Circuit breaker OPENED - too many failures"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ============================================================================
// Registry
// ============================================================================

/// One breaker per service name, created lazily.
pub struct CircuitBreakerRegistry {
    settings: CircuitBreakerSettings,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `name` using the configured policy for that name
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let policy = self.settings.policy_for(name);
        self.get_or_create(name, policy)
    }

    /// Breaker for `name`; `policy` only applies if it does not exist yet
    pub fn get_or_create(&self, name: &str, policy: CircuitBreakerPolicy) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, policy)))
            .clone()
    }

    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut states: Vec<_> = breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn force_reset_all(&self) {
        let breakers: Vec<_> = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        for breaker in breakers {
            breaker.force_reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(threshold: u32, cooldown_secs: u64) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(cooldown_secs),
            call_timeout: None,
        }
    }

    async fn fail(cb: &CircuitBreaker) {
        let _ = cb
            .execute(|| async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_skips_action() {
        let cb = CircuitBreaker::new("session-send", policy(3, 30));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            fail(&cb).await;
        }
        let state = cb.state();
        assert!(state.is_open);
        assert_eq!(state.failure_count, 3);
        assert_eq!(state.total_failures, 3);

        let result = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_open());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert!(err.to_string().contains("retry in 30s"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_cooldown_closes() {
        let cb = CircuitBreaker::new("session-send", policy(3, 30));
        for _ in 0..3 {
            fail(&cb).await;
        }

        tokio::time::advance(Duration::from_secs(31)).await;

        let value = cb
            .execute(|| async { Ok::<_, anyhow::Error>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let state = cb.state();
        assert!(!state.is_open);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.next_try_time, None);
        assert_eq!(state.total_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_with_fresh_cooldown() {
        let cb = CircuitBreaker::new("broker", policy(2, 10));
        fail(&cb).await;
        fail(&cb).await;

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cb.remaining_cooldown(), None);

        fail(&cb).await;
        assert!(cb.is_open());
        assert_eq!(cb.remaining_cooldown(), Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new("svc", policy(3, 30));
        fail(&cb).await;
        fail(&cb).await;
        cb.execute(|| async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap();
        fail(&cb).await;

        let state = cb.state();
        assert!(!state.is_open);
        assert_eq!(state.failure_count, 1);
        assert_eq!(state.total_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new(
            "slow",
            CircuitBreakerPolicy {
                failure_threshold: 1,
                cooldown: Duration::from_secs(5),
                call_timeout: Some(Duration::from_millis(100)),
            },
        );

        let result = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, anyhow::Error>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Timeout { .. })));
        assert!(cb.is_open());
    }

    #[test]
    fn test_execute_sync_and_force_reset() {
        let cb = CircuitBreaker::new("sync", policy(1, 60));
        let err = cb.execute_sync(|| Err::<(), _>("nope")).unwrap_err();
        assert!(matches!(err, CircuitBreakerError::Inner("nope")));
        assert!(cb.is_open());

        let err = cb.execute_sync(|| Ok::<_, &str>(1)).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::CircuitOpen));

        cb.force_reset();
        assert_eq!(cb.execute_sync(|| Ok::<_, &str>(1)).unwrap(), 1);
    }

    #[test]
    fn test_registry_isolates_services() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerSettings::default());
        let send = registry.get_or_create("session-send", policy(1, 60));
        let consume = registry.get_or_create("broker-consume", policy(1, 60));

        let _ = send.execute_sync(|| Err::<(), _>("down"));
        assert!(send.is_open());
        assert!(!consume.is_open());

        // Same name resolves to the same instance; the new policy is ignored
        let again = registry.get_or_create("session-send", policy(99, 1));
        assert!(Arc::ptr_eq(&send, &again));
        assert_eq!(again.policy().failure_threshold, 1);

        registry.force_reset_all();
        assert!(registry.snapshot().iter().all(|(_, s)| !s.is_open));
    }
}
