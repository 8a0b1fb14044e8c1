// ============================================================================
// Delivery Configuration (consumer retries + dead-letter store)
// ============================================================================

use crate::constants::*;
use crate::env::{parse_or, string_or};
use std::time::Duration;

/// Consumer retry policy
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// false = constant `base_delay` between attempts
    pub backoff_enabled: bool,
    /// Fixed delay used for RESOURCE_LOCKED failures
    pub resource_locked_delay: Duration,
}

impl RetryConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            max_retries: parse_or("RETRY_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            base_delay: Duration::from_millis(parse_or(
                "RETRY_BASE_DELAY_MS",
                DEFAULT_RETRY_BASE_DELAY_MS,
            )),
            max_delay: Duration::from_millis(parse_or(
                "RETRY_MAX_DELAY_MS",
                DEFAULT_RETRY_MAX_DELAY_MS,
            )),
            backoff_enabled: parse_or("RETRY_BACKOFF_ENABLED", true),
            resource_locked_delay: Duration::from_millis(parse_or(
                "RETRY_RESOURCE_LOCKED_DELAY_MS",
                DEFAULT_RESOURCE_LOCKED_DELAY_MS,
            )),
        }
    }

    /// `base × 2^retry_count`, capped at `max_delay`
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        if !self.backoff_enabled {
            return self.base_delay.min(self.max_delay);
        }
        let factor = 2u32.saturating_pow(retry_count);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            backoff_enabled: true,
            resource_locked_delay: Duration::from_millis(DEFAULT_RESOURCE_LOCKED_DELAY_MS),
        }
    }
}

/// Dead-letter store and retry sweep
#[derive(Clone, Debug)]
pub struct DeadLetterConfig {
    pub enabled: bool,
    /// Key prefix, e.g. "dlq:" → "dlq:message:{id}"
    pub key_prefix: String,
    pub record_ttl: Duration,
    pub archive_ttl: Duration,
    pub sweep_interval: Duration,
    pub sweep_batch_size: usize,
    /// Minimum time since the last failure before a record may be retried
    pub min_retry_delay: Duration,
}

impl DeadLetterConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            enabled: parse_or("DLQ_ENABLED", true),
            key_prefix: string_or("DLQ_KEY_PREFIX", "dlq:"),
            record_ttl: days(parse_or("DLQ_RECORD_TTL_DAYS", DEFAULT_DLQ_RECORD_TTL_DAYS)),
            archive_ttl: days(parse_or("DLQ_ARCHIVE_TTL_DAYS", DEFAULT_DLQ_ARCHIVE_TTL_DAYS)),
            sweep_interval: Duration::from_secs(parse_or(
                "DLQ_SWEEP_INTERVAL_SECS",
                DEFAULT_DLQ_SWEEP_INTERVAL_SECS,
            )),
            sweep_batch_size: parse_or("DLQ_SWEEP_BATCH_SIZE", DEFAULT_DLQ_SWEEP_BATCH_SIZE),
            min_retry_delay: Duration::from_secs(parse_or(
                "DLQ_MIN_RETRY_DELAY_SECS",
                DEFAULT_DLQ_MIN_RETRY_DELAY_SECS,
            )),
        }
    }
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "dlq:".to_string(),
            record_ttl: days(DEFAULT_DLQ_RECORD_TTL_DAYS),
            archive_ttl: days(DEFAULT_DLQ_ARCHIVE_TTL_DAYS),
            sweep_interval: Duration::from_secs(DEFAULT_DLQ_SWEEP_INTERVAL_SECS),
            sweep_batch_size: DEFAULT_DLQ_SWEEP_BATCH_SIZE,
            min_retry_delay: Duration::from_secs(DEFAULT_DLQ_MIN_RETRY_DELAY_SECS),
        }
    }
}

fn days(n: i64) -> Duration {
    Duration::from_secs((n.max(0) * SECONDS_PER_DAY) as u64)
}
