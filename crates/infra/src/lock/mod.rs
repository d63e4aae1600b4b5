//! Distributed mutual exclusion over the shared key/value store.
//!
//! A lock is a key holding a random token with a TTL. Only the holder of the
//! matching token can release it, so a holder whose lock expired and was
//! re-acquired by someone else cannot release the new holder's lock.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::kv::{KvError, KvStore};

const KEY_PREFIX: &str = "scribe:lock";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("lock store unavailable: {0}")]
    Store(#[from] KvError),
}

/// Fencing token for one acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bounded retry used by [`LockManager::acquire_with_retry`] and
/// [`LockManager::execute_with_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KvStore>,
    retry: LockRetry,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn storage_key(resource_key: &str) -> String {
    format!("{KEY_PREFIX}:{resource_key}")
}

impl LockManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_retry(store, LockRetry::default())
    }

    pub fn with_retry(store: Arc<dyn KvStore>, retry: LockRetry) -> Self {
        Self { store, retry }
    }

    pub fn retry(&self) -> LockRetry {
        self.retry
    }

    /// Single non-blocking attempt. `Ok(None)` if someone else holds the lock.
    pub async fn acquire(
        &self,
        resource_key: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, LockError> {
        let token = LockToken::generate();
        let acquired = self
            .store
            .set_nx(&storage_key(resource_key), token.as_str(), ttl)
            .await?;
        Ok(acquired.then_some(token))
    }

    /// Up to `retry.attempts` tries, sleeping `retry.delay` between them.
    pub async fn acquire_with_retry(
        &self,
        resource_key: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, LockError> {
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(token) = self.acquire(resource_key, ttl).await? {
                return Ok(Some(token));
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.delay).await;
            }
        }
        debug!(resource_key, attempts, "lock busy");
        Ok(None)
    }

    /// Release a lock. A token that no longer matches is a no-op (`Ok(false)`).
    pub async fn release(&self, resource_key: &str, token: &LockToken) -> Result<bool, LockError> {
        release(self.store.as_ref(), resource_key, token).await
    }

    /// Run `f` while holding the lock.
    ///
    /// Returns `Ok(None)` without running `f` when the lock could not be
    /// acquired within the retry budget. The lock is released however `f`
    /// ends; if the caller's future is dropped or `f` panics, the release
    /// runs as a background task.
    pub async fn execute_with_lock<T, F, Fut>(
        &self,
        resource_key: &str,
        ttl: Duration,
        f: F,
    ) -> Result<Option<T>, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(token) = self.acquire_with_retry(resource_key, ttl).await? else {
            return Ok(None);
        };

        let guard = HeldLock {
            store: Arc::clone(&self.store),
            resource_key: resource_key.to_string(),
            token: Some(token),
        };
        let out = f().await;
        guard.release().await;
        Ok(Some(out))
    }
}

async fn release(store: &dyn KvStore, resource_key: &str, token: &LockToken) -> Result<bool, LockError> {
    let released = store
        .delete_if_eq(&storage_key(resource_key), token.as_str())
        .await?;
    if !released {
        debug!(resource_key, "lock token no longer current; release skipped");
    }
    Ok(released)
}

struct HeldLock {
    store: Arc<dyn KvStore>,
    resource_key: String,
    token: Option<LockToken>,
}

impl HeldLock {
    async fn release(mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = release(self.store.as_ref(), &self.resource_key, &token).await {
                warn!(resource_key = %self.resource_key, error = %e, "lock release failed; lock expires by TTL");
            }
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(resource_key = %self.resource_key, "no runtime to release lock; lock expires by TTL");
            return;
        };
        let store = Arc::clone(&self.store);
        let resource_key = std::mem::take(&mut self.resource_key);
        handle.spawn(async move {
            if let Err(e) = release(store.as_ref(), &resource_key, &token).await {
                warn!(resource_key = %resource_key, error = %e, "background lock release failed");
            }
        });
    }
}
