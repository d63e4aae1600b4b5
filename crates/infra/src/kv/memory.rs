//! In-memory key/value store for tests/dev and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{KvError, KvStore};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &str, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|t| now + t),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-memory store.
///
/// Expiry uses `tokio::time::Instant`, so tests can drive TTLs with
/// `tokio::time::pause()` / `advance()`. Every operation takes the single map
/// lock, which makes each trait method atomic.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    inner: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of live keys (test helper).
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .map(|m| m.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn map(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, KvError> {
        self.inner.lock().map_err(|_| KvError::Poisoned)
    }
}

/// Drop `key` if it has expired, then return the live value (if any).
fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if map.get(key).is_some_and(|e| !e.is_live(now)) {
        map.remove(key);
    }
    map.get_mut(key)
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut map = self.map()?;
        Ok(live(&mut map, key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut map = self.map()?;
        map.insert(key.to_string(), Entry::new(value, ttl, Instant::now()));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut map = self.map()?;
        if live(&mut map, key, now).is_some() {
            return Ok(false);
        }
        map.insert(key.to_string(), Entry::new(value, Some(ttl), now));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut map = self.map()?;
        let existed = live(&mut map, key, now).is_some();
        map.remove(key);
        Ok(existed)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut map = self.map()?;
        let matches = live(&mut map, key, now).is_some_and(|e| e.value == expected);
        if matches {
            map.remove(key);
        }
        Ok(matches)
    }

    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> Result<i64, KvError> {
        let now = Instant::now();
        let mut map = self.map()?;
        match live(&mut map, key, now) {
            Some(e) => {
                let current: i64 = e.value.parse().map_err(|_| KvError::NotAnInteger {
                    key: key.to_string(),
                })?;
                let next = current + 1;
                e.value = next.to_string();
                Ok(next)
            }
            None => {
                map.insert(key.to_string(), Entry::new("1", ttl_on_create, now));
                Ok(1)
            }
        }
    }

    async fn compare_and_set(
        &self,
        guard_key: &str,
        expected_guard: Option<&str>,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut map = self.map()?;
        let current = live(&mut map, guard_key, now).map(|e| e.value.clone());
        if current.as_deref() != expected_guard {
            return Ok(false);
        }
        map.insert(key.to_string(), Entry::new(value, ttl, now));
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let now = Instant::now();
        let mut map = self.map()?;
        Ok(live(&mut map, key, now)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }
}
