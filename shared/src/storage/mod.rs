//! Key-value storage used by the dead-letter store.
//!
//! Production runs on Redis; tests and local runs use the in-memory store,
//! which honours expiries on tokio's clock.

mod kv;

pub use kv::{KeyValueStore, MemoryKeyValueStore, RedisKeyValueStore};
