// ============================================================================
// Stream Configuration (broker → append log → persistent store)
// ============================================================================

use crate::constants::*;
use crate::env::{parse_or, string_or};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Stream key prefix: "{prefix}{topic}"
    pub key_prefix: String,
    /// Consumer group shared by all store writers
    pub group: String,
    /// Identity of this reader within the group
    pub consumer_name: String,
    pub batch_count: usize,
    pub block: Duration,
    /// Fixed delay after a read error
    pub error_backoff: Duration,
    /// Approximate MAXLEN applied on append
    pub max_len: usize,
}

impl StreamConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            key_prefix: string_or("STREAM_KEY_PREFIX", "relay:stream:"),
            group: string_or("STREAM_GROUP", "relay-store"),
            consumer_name: std::env::var("STREAM_CONSUMER_NAME")
                .unwrap_or_else(|_| default_consumer_name()),
            batch_count: parse_or("STREAM_BATCH_COUNT", DEFAULT_STREAM_BATCH_COUNT),
            block: Duration::from_millis(parse_or("STREAM_BLOCK_MS", DEFAULT_STREAM_BLOCK_MS)),
            error_backoff: Duration::from_millis(parse_or(
                "STREAM_ERROR_BACKOFF_MS",
                DEFAULT_STREAM_ERROR_BACKOFF_MS,
            )),
            max_len: parse_or("STREAM_MAX_LEN", DEFAULT_STREAM_MAX_LEN),
        }
    }

    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}{}", self.key_prefix, topic)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            key_prefix: "relay:stream:".to_string(),
            group: "relay-store".to_string(),
            consumer_name: default_consumer_name(),
            batch_count: DEFAULT_STREAM_BATCH_COUNT,
            block: Duration::from_millis(DEFAULT_STREAM_BLOCK_MS),
            error_backoff: Duration::from_millis(DEFAULT_STREAM_ERROR_BACKOFF_MS),
            max_len: DEFAULT_STREAM_MAX_LEN,
        }
    }
}

fn default_consumer_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("relay-{}", &id[..8])
}
