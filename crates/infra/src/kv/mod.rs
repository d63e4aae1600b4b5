//! Shared key/value backing store.
//!
//! Everything that must be visible to every backend process (cache entries,
//! namespace versions, lock tokens, rate-limit windows, cron tick claims)
//! lives behind [`KvStore`]. Each operation is atomic on its own; the few
//! read-then-write sequences the pipeline needs are exposed as single
//! primitives (`set_nx`, `delete_if_eq`, `compare_and_set`) so adapters can
//! run them atomically (a mutex in memory, a Lua script on Redis).

use std::time::Duration;

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::InMemoryKvStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisKvStore;

/// Backing store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("backing store connection error: {0}")]
    Connection(String),

    #[error("backing store command error: {0}")]
    Command(String),

    #[error("value at {key} is not an integer")]
    NotAnInteger { key: String },

    #[error("in-memory store lock poisoned")]
    Poisoned,
}

/// Key/value store with per-key TTL.
///
/// `ttl: None` means the key does not expire.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Set only if the key does not exist. Returns whether the write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Delete `key` only if its current value equals `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, KvError>;

    /// Increment an integer key (missing counts as 0). `ttl_on_create` is
    /// applied only when this call created the key.
    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> Result<i64, KvError>;

    /// Write `key = value` only if `guard_key` currently holds `expected_guard`
    /// (`None`: the guard key must be absent). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        guard_key: &str,
        expected_guard: Option<&str>,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    /// Remaining time to live. `None` for missing keys and keys without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError>;
}
