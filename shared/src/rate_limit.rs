// ============================================================================
// Rate Limiter + Duplicate Suppression
// ============================================================================
//
// One sliding window per key (session + recipient) answers two questions:
// - Is this the same content we just sent? → duplicate
// - Have we sent too many messages in this window? → rate-limited
//
// Rules, checked in order:
// - No entry                            → allow, count = 1
// - Entry idle ≥ window                 → reset, allow, count = 1
// - Same content fingerprint            → reject "duplicate"
// - count ≥ max_per_window              → reject "rate-limited"
// - Otherwise                           → allow, count += 1
//
// State is process-local and guarded by a std Mutex; nothing is held across
// an await point.
//
// ============================================================================

use crate::scheduler::PeriodicTask;
use relay_config::RateLimitConfig;
use relay_metrics::RATE_LIMIT_REJECTIONS_TOTAL;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Duplicate,
    RateLimited,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Duplicate => "duplicate",
            RejectReason::RateLimited => "rate-limited",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`RateLimiterDedup::can_send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<RejectReason>,
    /// Time until the current window ends; set on rejections
    pub time_remaining: Option<Duration>,
}

impl AdmissionDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            time_remaining: None,
        }
    }

    fn reject(reason: RejectReason, time_remaining: Duration) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            time_remaining: Some(time_remaining),
        }
    }
}

#[derive(Debug, Clone)]
struct RateLimitEntry {
    last_message_time: Instant,
    message_count: u32,
    last_content_fingerprint: String,
}

pub struct RateLimiterDedup {
    config: RateLimitConfig,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiterDedup {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Build the limiter key for a (session, recipient) pair
    pub fn key(session_id: &str, recipient: &str) -> String {
        format!("{}:{}", session_id, recipient)
    }

    /// Check admission and, when allowed, record the send.
    pub fn can_send(&self, key: &str, content: &str) -> AdmissionDecision {
        let now = Instant::now();
        let fingerprint = fingerprint(content);
        let window = self.config.window;

        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            entries.insert(key.to_string(), RateLimitEntry::first(now, fingerprint));
            return AdmissionDecision::allow();
        };

        let elapsed = now.saturating_duration_since(entry.last_message_time);
        if elapsed >= window {
            *entry = RateLimitEntry::first(now, fingerprint);
            return AdmissionDecision::allow();
        }

        let remaining = window - elapsed;
        let decision = if entry.last_content_fingerprint == fingerprint {
            AdmissionDecision::reject(RejectReason::Duplicate, remaining)
        } else if entry.message_count >= self.config.max_per_window {
            AdmissionDecision::reject(RejectReason::RateLimited, remaining)
        } else {
            entry.message_count += 1;
            entry.last_message_time = now;
            entry.last_content_fingerprint = fingerprint;
            AdmissionDecision::allow()
        };
        drop(entries);

        if let Some(reason) = decision.reason {
            RATE_LIMIT_REJECTIONS_TOTAL
                .with_label_values(&[reason.as_str()])
                .inc();
            tracing::debug!(
                reason = reason.as_str(),
                remaining_ms = remaining.as_millis() as u64,
                "Send rejected by admission control"
            );
        }
        decision
    }

    /// Evict entries idle for more than twice the window. Returns the number
    /// removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let max_idle = self.config.window * 2;

        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.last_message_time) <= max_idle);
        let removed = before - entries.len();

        if removed > 0 {
            tracing::debug!(removed, remaining = entries.len(), "Rate limiter cleanup");
        }
        removed
    }

    pub fn reset_for_key(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn reset_all(&self) {
        let mut entries = self.lock();
        let cleared = entries.len();
        entries.clear();
        tracing::info!(cleared, "Rate limiter reset");
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }

    /// Run [`cleanup`](Self::cleanup) every `cleanup_interval` until cancelled
    pub fn spawn_cleanup(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        PeriodicTask::new("rate-limit-cleanup", self.config.cleanup_interval).spawn(
            token,
            move || {
                let limiter = Arc::clone(&limiter);
                async move {
                    limiter.cleanup();
                }
            },
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RateLimitEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RateLimitEntry {
    fn first(now: Instant, fingerprint: String) -> Self {
        Self {
            last_message_time: now,
            message_count: 1,
            last_content_fingerprint: fingerprint,
        }
    }
}

fn fingerprint(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
