//! Redis client implementation with connection management

use crate::Result;
use redis::{AsyncCommands, aio::ConnectionManager};

/// Redis client with automatic reconnection
///
/// Cloning is cheap: clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisClient {
    conn: ConnectionManager,
}

impl RedisClient {
    /// Connect to Redis server
    ///
    /// Supports both redis:// and rediss:// (TLS) URLs
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionManager {
        &mut self.conn
    }

    // ============================================================================
    // Key-Value Operations
    // ============================================================================

    /// GET - Get value by key
    pub async fn get<T: redis::FromRedisValue>(&mut self, key: &str) -> Result<Option<T>> {
        self.conn.get(key).await
    }

    /// SETEX - Set key with expiry in seconds
    pub async fn set_ex<V>(&mut self, key: &str, value: V, seconds: u64) -> Result<()>
    where
        V: redis::ToRedisArgs + Send + Sync,
    {
        self.conn.set_ex(key, value, seconds).await
    }

    /// DEL - Delete one or more keys
    pub async fn del<K>(&mut self, keys: K) -> Result<i64>
    where
        K: redis::ToRedisArgs + Send + Sync,
    {
        self.conn.del(keys).await
    }

    /// EXISTS - Check if key exists
    pub async fn exists(&mut self, key: &str) -> Result<bool> {
        self.conn.exists(key).await
    }

    /// EXPIRE - Set expiry time in seconds
    pub async fn expire(&mut self, key: &str, seconds: i64) -> Result<bool> {
        self.conn.expire(key, seconds).await
    }

    /// TTL - Get time to live in seconds
    pub async fn ttl(&mut self, key: &str) -> Result<i64> {
        self.conn.ttl(key).await
    }

    // ============================================================================
    // Sorted Set Operations
    // ============================================================================

    /// ZADD - Add member with score
    pub async fn zadd(&mut self, key: &str, member: &str, score: i64) -> Result<i64> {
        self.conn.zadd(key, member, score).await
    }

    /// ZRANGE - Members by rank, lowest score first
    pub async fn zrange(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.conn.zrange(key, start, stop).await
    }

    /// ZREM - Remove member
    pub async fn zrem(&mut self, key: &str, member: &str) -> Result<i64> {
        self.conn.zrem(key, member).await
    }

    /// ZCARD - Number of members
    pub async fn zcard(&mut self, key: &str) -> Result<i64> {
        self.conn.zcard(key).await
    }

    // ============================================================================
    // List Operations
    // ============================================================================

    /// RPUSH - Push to tail of list
    pub async fn rpush<V>(&mut self, key: &str, value: V) -> Result<i64>
    where
        V: redis::ToRedisArgs + Send + Sync,
    {
        self.conn.rpush(key, value).await
    }

    /// RPUSH + EXPIRE in one MULTI/EXEC
    pub async fn rpush_with_expiry<V>(&mut self, key: &str, value: V, seconds: i64) -> Result<()>
    where
        V: redis::ToRedisArgs + Send + Sync,
    {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .rpush(key, value)
            .ignore()
            .expire(key, seconds)
            .ignore();
        pipe.query_async(&mut self.conn).await
    }

    /// LRANGE - Range of list elements
    pub async fn lrange(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.conn.lrange(key, start, stop).await
    }

    /// LLEN - Get list length
    pub async fn llen(&mut self, key: &str) -> Result<i64> {
        self.conn.llen(key).await
    }

    /// PING - Liveness check
    pub async fn ping(&mut self) -> Result<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        Ok(())
    }
}
