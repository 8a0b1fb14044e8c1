// ============================================================================
// Broker Configuration
// ============================================================================

use crate::constants::*;
use crate::env::{parse_or, string_or};
use std::time::Duration;

/// AMQP broker connection and topology names
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Full AMQP URL including credentials and vhost
    pub url: String,
    /// Max unacked deliveries per consumer
    pub prefetch: u16,
    /// Topic exchange for domain events
    pub events_exchange: String,
    /// Topic exchange for command dispatch
    pub commands_exchange: String,
    /// Direct exchange receiving dead letters
    pub dead_letter_exchange: String,
    /// Queue for inbound message-received events
    pub inbound_queue: String,
    /// Queue for outbound send commands
    pub outbound_queue: String,
    /// Queue bound to the dead-letter exchange
    pub dead_letter_queue: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_max_attempts: u32,
}

impl BrokerConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            url: string_or("AMQP_URL", DEFAULT_AMQP_URL),
            prefetch: parse_or("AMQP_PREFETCH", DEFAULT_PREFETCH),
            events_exchange: string_or("AMQP_EVENTS_EXCHANGE", "relay.events"),
            commands_exchange: string_or("AMQP_COMMANDS_EXCHANGE", "relay.commands"),
            dead_letter_exchange: string_or("AMQP_DEAD_LETTER_EXCHANGE", "relay.dlx"),
            inbound_queue: string_or("AMQP_INBOUND_QUEUE", "relay.inbound"),
            outbound_queue: string_or("AMQP_OUTBOUND_QUEUE", "relay.outbound"),
            dead_letter_queue: string_or("AMQP_DEAD_LETTER_QUEUE", "relay.dead_letters"),
            reconnect_base_delay: Duration::from_millis(parse_or(
                "AMQP_RECONNECT_BASE_DELAY_MS",
                DEFAULT_RECONNECT_BASE_DELAY_MS,
            )),
            reconnect_max_delay: Duration::from_millis(parse_or(
                "AMQP_RECONNECT_MAX_DELAY_MS",
                DEFAULT_RECONNECT_MAX_DELAY_MS,
            )),
            reconnect_max_attempts: parse_or(
                "AMQP_RECONNECT_MAX_ATTEMPTS",
                DEFAULT_RECONNECT_MAX_ATTEMPTS,
            ),
        }
    }

    /// Credentials masked for logging
    pub fn url_for_logging(&self) -> String {
        mask_credentials(&self.url)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_AMQP_URL.to_string(),
            prefetch: DEFAULT_PREFETCH,
            events_exchange: "relay.events".to_string(),
            commands_exchange: "relay.commands".to_string(),
            dead_letter_exchange: "relay.dlx".to_string(),
            inbound_queue: "relay.inbound".to_string(),
            outbound_queue: "relay.outbound".to_string(),
            dead_letter_queue: "relay.dead_letters".to_string(),
            reconnect_base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            reconnect_max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_DELAY_MS),
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

/// Replace `user:pass@` in a URL with `***@`
pub fn mask_credentials(url: &str) -> String {
    match url.find('@') {
        Some(at_pos) => {
            let protocol_end = url.find("://").map(|p| p + 3).unwrap_or(0);
            if protocol_end > at_pos {
                return url.to_string();
            }
            format!("{}***{}", &url[..protocol_end], &url[at_pos..])
        }
        None => url.to_string(),
    }
}
