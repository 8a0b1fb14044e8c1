//! Redis Streams support with consumer groups

use crate::{RedisClient, Result};
use redis::{AsyncCommands, RedisError, Value, streams::StreamReadReply};
use std::collections::HashMap;

/// Entry in a Redis Stream (string values)
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Options for XREADGROUP
#[derive(Debug, Clone, Default)]
pub struct StreamReadOptions {
    /// Block for N milliseconds (None = no blocking)
    pub block: Option<u64>,
    /// Maximum number of entries to return
    pub count: Option<u64>,
}

/// The group already exists (XGROUP CREATE)
pub fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP")
}

/// The group or stream no longer exists (XREADGROUP / XACK)
pub fn is_no_group(err: &RedisError) -> bool {
    err.code() == Some("NOGROUP")
}

impl RedisClient {
    // ============================================================================
    // Stream Operations
    // ============================================================================

    /// XADD with `MAXLEN ~ max_len` - Add entry and trim approximately
    ///
    /// Returns the generated ID
    pub async fn xadd_maxlen(
        &mut self,
        stream_key: &str,
        max_len: usize,
        fields: &[(&str, &str)],
    ) -> Result<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream_key).arg("MAXLEN").arg("~").arg(max_len).arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        cmd.query_async(self.connection_mut()).await
    }

    /// XGROUP CREATE ... MKSTREAM
    ///
    /// Returns `false` when the group already existed.
    pub async fn xgroup_create_mkstream(
        &mut self,
        stream_key: &str,
        group: &str,
        start_id: &str,
    ) -> Result<bool> {
        let created: Result<()> = self
            .connection_mut()
            .xgroup_create_mkstream(stream_key, group, start_id)
            .await;
        match created {
            Ok(()) => Ok(true),
            Err(e) if is_busy_group(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// XREADGROUP - Read entries for a consumer of a group
    ///
    /// `id` is `">"` for new entries or `"0"` for this consumer's pending ones.
    /// A blocking read that times out yields an empty vector.
    pub async fn xreadgroup(
        &mut self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        id: &str,
        options: StreamReadOptions,
    ) -> Result<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer);

        if let Some(count) = options.count {
            cmd.arg("COUNT").arg(count);
        }
        if let Some(block_ms) = options.block {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(stream_key).arg(id);

        let reply: Option<StreamReadReply> = cmd.query_async(self.connection_mut()).await?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for stream in reply.keys {
            for stream_id in stream.ids {
                let mut fields = HashMap::new();
                for (key, value) in stream_id.map.iter() {
                    let value_str = match value {
                        Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
                        Value::SimpleString(s) => s.clone(),
                        Value::Int(i) => i.to_string(),
                        _ => continue,
                    };
                    fields.insert(key.clone(), value_str);
                }
                entries.push(StreamEntry {
                    id: stream_id.id,
                    fields,
                });
            }
        }

        Ok(entries)
    }

    /// XACK - Acknowledge stream entries
    pub async fn xack(&mut self, stream_key: &str, group: &str, ids: &[&str]) -> Result<i64> {
        self.connection_mut().xack(stream_key, group, ids).await
    }

    /// XLEN - Get stream length
    pub async fn xlen(&mut self, stream_key: &str) -> Result<i64> {
        self.connection_mut().xlen(stream_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_consumer_group_roundtrip() -> Result<()> {
        let mut client = RedisClient::connect("redis://localhost:6379").await?;
        let stream_key = "relay_test_stream";
        client.del(stream_key).await?;

        assert!(client.xgroup_create_mkstream(stream_key, "g", "0").await?);
        // Second create is absorbed
        assert!(!client.xgroup_create_mkstream(stream_key, "g", "0").await?);

        let id = client
            .xadd_maxlen(stream_key, 1000, &[("data", "hello")])
            .await?;
        assert!(!id.is_empty());

        let options = StreamReadOptions {
            block: None,
            count: Some(10),
        };
        let entries = client
            .xreadgroup(stream_key, "g", "c1", ">", options.clone())
            .await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields.get("data"), Some(&"hello".to_string()));

        // Unacked entry is still pending for this consumer
        let pending = client
            .xreadgroup(stream_key, "g", "c1", "0", options.clone())
            .await?;
        assert_eq!(pending.len(), 1);

        client.xack(stream_key, "g", &[id.as_str()]).await?;
        let pending = client.xreadgroup(stream_key, "g", "c1", "0", options).await?;
        assert!(pending.is_empty());

        client.del(stream_key).await?;
        Ok(())
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_missing_group_is_detected() -> Result<()> {
        let mut client = RedisClient::connect("redis://localhost:6379").await?;
        let stream_key = "relay_test_nogroup";
        client.del(stream_key).await?;

        let err = client
            .xreadgroup(stream_key, "ghost", "c1", ">", StreamReadOptions::default())
            .await
            .unwrap_err();
        assert!(is_no_group(&err));
        Ok(())
    }
}
