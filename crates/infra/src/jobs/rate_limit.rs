//! Fixed-window claim limiter shared through the key/value store.

use std::sync::Arc;
use std::time::Duration;

use crate::kv::{KvError, KvStore};

use super::config::RateLimit;
use super::types::QueueName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Window is full; it resets in `retry_in`.
    Limited { retry_in: Duration },
}

/// The first claim in a window creates the counter with the window as TTL;
/// every claim increments it. Claims beyond `max_jobs` are refused until the
/// counter expires.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn try_acquire(&self, queue: QueueName, limit: RateLimit) -> Result<RateDecision, KvError> {
        let key = format!("scribe:ratelimit:{queue}");
        let count = self.store.incr(&key, Some(limit.window)).await?;
        if count <= i64::from(limit.max_jobs) {
            return Ok(RateDecision::Allowed);
        }
        let retry_in = self.store.ttl(&key).await?.unwrap_or(limit.window);
        Ok(RateDecision::Limited { retry_in })
    }
}
