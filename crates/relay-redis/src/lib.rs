//! # Relay Redis
//!
//! Low-level Redis client for the relay.
//!
//! ## Design Principles
//!
//! - **No business logic** - Pure infrastructure layer
//! - **No dependencies** on other relay-* crates
//! - **Generic operations** - Key naming belongs to callers
//!
//! ## Features
//!
//! - Connection management with automatic reconnection
//! - Key-value operations with expiry
//! - Sorted-set indexes and lists
//! - Redis Streams with consumer groups
//!
//! ## Example
//!
//! ```rust,no_run
//! use relay_redis::RedisClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = RedisClient::connect("redis://localhost:6379").await?;
//!
//!     client.set_ex("key", "value", 3600).await?;
//!     let value: Option<String> = client.get("key").await?;
//!
//!     Ok(())
//! }
//! ```

mod client;
mod streams;

pub use client::RedisClient;
pub use streams::{StreamEntry, StreamReadOptions, is_busy_group, is_no_group};

// Re-export commonly used types
pub use redis::RedisError;

/// Result type for Redis operations
pub type Result<T> = std::result::Result<T, RedisError>;
