//! Prometheus metrics for the relay
//!
//! Provides centralized metrics collection for monitoring:
//! - Broker publishes
//! - Consumer outcomes (acked / retried / dead-lettered / discarded)
//! - Circuit breaker states
//! - Rate-limit rejections
//! - Stream bridge throughput
//! - Dead-letter sweeps

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGaugeVec, TextEncoder, opts, register_int_counter,
    register_int_counter_vec, register_int_gauge_vec,
};

// ============================================================================
// Broker Metrics
// ============================================================================

/// Messages accepted by the broker
pub static MESSAGES_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "relay_messages_published_total",
            "Messages accepted by the broker, by exchange"
        ),
        &["exchange"]
    )
    .expect("Failed to register MESSAGES_PUBLISHED_TOTAL metric")
});

/// Publishes rejected by the broker or failed in transit
pub static PUBLISH_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "relay_publish_failures_total",
            "Publishes that failed, by error type"
        ),
        &["error_type"]
    )
    .expect("Failed to register PUBLISH_FAILURES_TOTAL metric")
});

/// Broker reconnects (successful)
pub static BROKER_RECONNECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_broker_reconnects_total",
        "Successful broker reconnects"
    ))
    .expect("Failed to register BROKER_RECONNECTS_TOTAL metric")
});

// ============================================================================
// Consumer Metrics
// ============================================================================

/// Final outcome of each delivery
pub static CONSUMER_OUTCOMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "relay_consumer_outcomes_total",
            "Delivery outcomes by queue and outcome"
        ),
        &["queue", "outcome"]
    )
    .expect("Failed to register CONSUMER_OUTCOMES_TOTAL metric")
});

/// Messages dropped because the dead-letter publish itself failed
pub static MESSAGES_DISCARDED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_messages_discarded_total",
        "Messages dropped after a failed dead-letter publish"
    ))
    .expect("Failed to register MESSAGES_DISCARDED_TOTAL metric")
});

// ============================================================================
// Circuit Breaker / Rate Limit Metrics
// ============================================================================

/// 0 = closed, 1 = open
pub static CIRCUIT_BREAKER_OPEN: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!(
            "relay_circuit_breaker_open",
            "Circuit breaker state per service (1 = open)"
        ),
        &["service"]
    )
    .expect("Failed to register CIRCUIT_BREAKER_OPEN metric")
});

pub static RATE_LIMIT_REJECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "relay_rate_limit_rejections_total",
            "Sends rejected by admission control, by reason"
        ),
        &["reason"]
    )
    .expect("Failed to register RATE_LIMIT_REJECTIONS_TOTAL metric")
});

// ============================================================================
// Stream Bridge Metrics
// ============================================================================

pub static STREAM_APPENDS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_stream_appends_total",
        "Broker deliveries appended to the stream log"
    ))
    .expect("Failed to register STREAM_APPENDS_TOTAL metric")
});

pub static STREAM_APPEND_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_stream_append_failures_total",
        "Broker deliveries that could not be appended"
    ))
    .expect("Failed to register STREAM_APPEND_FAILURES_TOTAL metric")
});

pub static STREAM_ENTRIES_STORED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_stream_entries_stored_total",
        "Stream entries written to the message store and acknowledged"
    ))
    .expect("Failed to register STREAM_ENTRIES_STORED_TOTAL metric")
});

// ============================================================================
// Dead-Letter Metrics
// ============================================================================

pub static DEAD_LETTERS_PARKED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_dead_letters_parked_total",
        "Records written to the dead-letter store"
    ))
    .expect("Failed to register DEAD_LETTERS_PARKED_TOTAL metric")
});

/// Per-sweep counters: processed / retried / failed / discarded
pub static DLQ_SWEEP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "relay_dlq_sweep_records_total",
            "Dead-letter sweep results by outcome"
        ),
        &["outcome"]
    )
    .expect("Failed to register DLQ_SWEEP_TOTAL metric")
});

/// Gather all metrics and encode them in Prometheus text format
pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_touched_metrics() {
        MESSAGES_PUBLISHED_TOTAL.with_label_values(&["relay.events"]).inc();
        CIRCUIT_BREAKER_OPEN.with_label_values(&["session-send"]).set(0);

        let text = gather_metrics().unwrap();
        assert!(text.contains("relay_messages_published_total"));
        assert!(text.contains("relay_circuit_breaker_open"));
    }
}
