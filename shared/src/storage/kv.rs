use async_trait::async_trait;
use relay_error::RelayResult;
use relay_redis::RedisClient;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// The subset of Redis the dead-letter store relies on: expiring string
/// values, one score-ordered index and append-only lists.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()>;

    async fn get(&self, key: &str) -> RelayResult<Option<String>>;

    /// Returns whether the key existed
    async fn del(&self, key: &str) -> RelayResult<bool>;

    async fn zadd(&self, key: &str, member: &str, score: i64) -> RelayResult<()>;

    /// Members by ascending score; `stop = -1` means "to the end"
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> RelayResult<Vec<String>>;

    async fn zrem(&self, key: &str, member: &str) -> RelayResult<()>;

    async fn zcard(&self, key: &str) -> RelayResult<usize>;

    /// Append and (re)set the list's expiry
    async fn rpush_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()>;

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> RelayResult<Vec<String>>;
}

// ============================================================================
// Redis
// ============================================================================

#[derive(Clone)]
pub struct RedisKeyValueStore {
    client: RedisClient,
}

impl RedisKeyValueStore {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()> {
        let mut client = self.client.clone();
        client.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> RelayResult<Option<String>> {
        let mut client = self.client.clone();
        Ok(client.get(key).await?)
    }

    async fn del(&self, key: &str) -> RelayResult<bool> {
        let mut client = self.client.clone();
        Ok(client.del(key).await? > 0)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> RelayResult<()> {
        let mut client = self.client.clone();
        client.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> RelayResult<Vec<String>> {
        let mut client = self.client.clone();
        Ok(client.zrange(key, start, stop).await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> RelayResult<()> {
        let mut client = self.client.clone();
        client.zrem(key, member).await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> RelayResult<usize> {
        let mut client = self.client.clone();
        Ok(client.zcard(key).await?.max(0) as usize)
    }

    async fn rpush_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()> {
        let mut client = self.client.clone();
        let seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1);
        client.rpush_with_expiry(key, value, seconds).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> RelayResult<Vec<String>> {
        let mut client = self.client.clone();
        Ok(client.lrange(key, start, stop).await?)
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, (String, Instant)>,
    /// key → member → score
    sorted: HashMap<String, HashMap<String, i64>>,
    lists: HashMap<String, (Vec<String>, Instant)>,
}

/// In-process stand-in for Redis. Expired keys disappear on next access.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining time to live of a value or list key
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let state = self.lock();
        state
            .values
            .get(key)
            .map(|(_, at)| *at)
            .or_else(|| state.lists.get(key).map(|(_, at)| *at))
            .filter(|at| *at > now)
            .map(|at| at - now)
    }

    /// All live value keys with the given prefix
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .lock()
            .values
            .iter()
            .filter(|(k, (_, at))| k.starts_with(prefix) && *at > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Redis-style inclusive range with negative indices counted from the end
fn slice_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()> {
        let expires = Instant::now() + ttl;
        self.lock()
            .values
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn get(&self, key: &str) -> RelayResult<Option<String>> {
        let now = Instant::now();
        let mut state = self.lock();
        match state.values.get(key) {
            Some((_, expires)) if *expires <= now => {
                state.values.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> RelayResult<bool> {
        let mut state = self.lock();
        let removed = state.values.remove(key).is_some()
            | state.sorted.remove(key).is_some()
            | state.lists.remove(key).is_some();
        Ok(removed)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> RelayResult<()> {
        self.lock()
            .sorted
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> RelayResult<Vec<String>> {
        let state = self.lock();
        let Some(set) = state.sorted.get(key) else {
            return Ok(Vec::new());
        };
        // Redis orders equal scores lexicographically
        let ordered: BTreeMap<(i64, &String), ()> =
            set.iter().map(|(m, s)| ((*s, m), ())).collect();
        let members: Vec<String> = ordered.keys().map(|(_, m)| (*m).clone()).collect();

        Ok(match slice_range(members.len(), start, stop) {
            Some((from, to)) => members[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> RelayResult<()> {
        let mut state = self.lock();
        if let Some(set) = state.sorted.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                state.sorted.remove(key);
            }
        }
        Ok(())
    }

    async fn zcard(&self, key: &str) -> RelayResult<usize> {
        Ok(self.lock().sorted.get(key).map_or(0, HashMap::len))
    }

    async fn rpush_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<()> {
        let now = Instant::now();
        let mut state = self.lock();
        let entry = state
            .lists
            .entry(key.to_string())
            .or_insert_with(|| (Vec::new(), now));
        if entry.1 <= now {
            entry.0.clear();
        }
        entry.0.push(value.to_string());
        entry.1 = now + ttl;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> RelayResult<Vec<String>> {
        let now = Instant::now();
        let state = self.lock();
        let Some((items, expires)) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        if *expires <= now {
            return Ok(Vec::new());
        }
        Ok(match slice_range(items.len(), start, stop) {
            Some((from, to)) => items[from..=to].to_vec(),
            None => Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_values_expire() {
        let store = MemoryKeyValueStore::new();
        store.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sorted_index_orders_by_score() {
        let store = MemoryKeyValueStore::new();
        store.zadd("idx", "late", 300).await.unwrap();
        store.zadd("idx", "early", 100).await.unwrap();
        store.zadd("idx", "middle", 200).await.unwrap();

        assert_eq!(
            store.zrange("idx", 0, -1).await.unwrap(),
            vec!["early", "middle", "late"]
        );
        assert_eq!(store.zrange("idx", 0, 1).await.unwrap(), vec!["early", "middle"]);
        assert_eq!(store.zrange("idx", 5, 10).await.unwrap(), Vec::<String>::new());

        store.zrem("idx", "middle").await.unwrap();
        assert_eq!(store.zcard("idx").await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_expiry_is_refreshed_on_push() {
        let store = MemoryKeyValueStore::new();
        let ttl = Duration::from_secs(60);
        store.rpush_with_expiry("l", "a", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        store.rpush_with_expiry("l", "b", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;

        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["a", "b"]);
        assert!(store.ttl("l").unwrap() <= Duration::from_secs(10));
    }

    #[test]
    fn test_slice_range() {
        assert_eq!(slice_range(5, 0, -1), Some((0, 4)));
        assert_eq!(slice_range(5, -2, -1), Some((3, 4)));
        assert_eq!(slice_range(5, 3, 100), Some((3, 4)));
        assert_eq!(slice_range(0, 0, -1), None);
        assert_eq!(slice_range(5, 4, 2), None);
    }
}
