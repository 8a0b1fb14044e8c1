// ============================================================================
// Admission & Fault-Isolation Configuration
// ============================================================================

use crate::constants::*;
use crate::env::parse_or;
use std::collections::HashMap;
use std::time::Duration;

/// Sliding-window rate limit + duplicate suppression per (session, recipient)
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_per_window: u32,
    pub cleanup_interval: Duration,
}

impl RateLimitConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            window: Duration::from_millis(parse_or(
                "RATE_LIMIT_WINDOW_MS",
                DEFAULT_RATE_LIMIT_WINDOW_MS,
            )),
            max_per_window: parse_or("RATE_LIMIT_MAX_PER_WINDOW", DEFAULT_RATE_LIMIT_MAX_PER_WINDOW),
            cleanup_interval: Duration::from_secs(parse_or(
                "RATE_LIMIT_CLEANUP_SECS",
                DEFAULT_RATE_LIMIT_CLEANUP_SECS,
            )),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(DEFAULT_RATE_LIMIT_WINDOW_MS),
            max_per_window: DEFAULT_RATE_LIMIT_MAX_PER_WINDOW,
            cleanup_interval: Duration::from_secs(DEFAULT_RATE_LIMIT_CLEANUP_SECS),
        }
    }
}

/// Threshold/cooldown for one named dependency
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    /// Per-call timeout; a timed-out call counts as a failure
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_BREAKER_THRESHOLD,
            cooldown: Duration::from_secs(DEFAULT_BREAKER_COOLDOWN_SECS),
            call_timeout: None,
        }
    }
}

/// Default breaker policy plus per-service overrides.
///
/// Overrides come from `CIRCUIT_BREAKER_<NAME>_THRESHOLD` and
/// `CIRCUIT_BREAKER_<NAME>_COOLDOWN_SECS`; `<NAME>` is the service name
/// upper-cased with `-` replaced by `_` (e.g. `SESSION_SEND`).
#[derive(Clone, Debug, Default)]
pub struct CircuitBreakerSettings {
    pub default: CircuitBreakerPolicy,
    pub overrides: HashMap<String, CircuitBreakerPolicy>,
}

impl CircuitBreakerSettings {
    pub(crate) fn from_env() -> Self {
        let call_timeout = std::env::var("CIRCUIT_BREAKER_CALL_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis);

        let default = CircuitBreakerPolicy {
            failure_threshold: parse_or("CIRCUIT_BREAKER_THRESHOLD", DEFAULT_BREAKER_THRESHOLD),
            cooldown: Duration::from_secs(parse_or(
                "CIRCUIT_BREAKER_COOLDOWN_SECS",
                DEFAULT_BREAKER_COOLDOWN_SECS,
            )),
            call_timeout,
        };

        Self::with_overrides(default, std::env::vars())
    }

    fn with_overrides(
        default: CircuitBreakerPolicy,
        vars: impl Iterator<Item = (String, String)>,
    ) -> Self {
        let mut overrides: HashMap<String, CircuitBreakerPolicy> = HashMap::new();

        for (key, value) in vars {
            let Some(rest) = key.strip_prefix("CIRCUIT_BREAKER_") else {
                continue;
            };
            if let Some(name) = rest.strip_suffix("_THRESHOLD") {
                if let Ok(threshold) = value.parse() {
                    overrides
                        .entry(service_name(name))
                        .or_insert(default)
                        .failure_threshold = threshold;
                }
            } else if let Some(name) = rest.strip_suffix("_COOLDOWN_SECS") {
                if let Ok(secs) = value.parse() {
                    overrides
                        .entry(service_name(name))
                        .or_insert(default)
                        .cooldown = Duration::from_secs(secs);
                }
            }
        }

        Self { default, overrides }
    }

    /// Policy for a named dependency
    pub fn policy_for(&self, service: &str) -> CircuitBreakerPolicy {
        self.overrides.get(service).copied().unwrap_or(self.default)
    }
}

fn service_name(env_name: &str) -> String {
    env_name.to_ascii_lowercase().replace('_', "-")
}
