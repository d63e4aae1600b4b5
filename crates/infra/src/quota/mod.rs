//! Per-user, per-resource quota enforcement.
//!
//! [`QuotaLimiter::check_limit`] reads counts from the versioned cache and
//! recomputes them from the [`UsageRepository`] on a miss. Every
//! quota-affecting write runs inside a lock keyed by `(resource, user)`,
//! checks against the repository count (never the cache), and bumps the
//! counter namespace right after, so a recount that started before the write
//! can never put a stale count back into the cache.

mod usage;

pub use usage::{InMemoryUsageRepository, UsageError, UsageRepository};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use scribe_core::{Limit, PlanLimits, ResourceType, UserId};

use crate::cache::{CacheKey, VersionedCache, ttl};
use crate::error::{PipelineError, PipelineResult};
use crate::lock::LockManager;

/// Default TTL of the per-(resource, user) quota lock.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(5);

/// Shortest quota lock TTL accepted. A lock that expires while the check and
/// write are still running no longer serializes anything.
pub const MIN_LOCK_TTL: Duration = Duration::from_millis(100);

/// Lock key serializing quota-affecting writes for one user and resource.
pub fn lock_key(user: UserId, resource: ResourceType) -> String {
    format!("quota-{resource}-{user}")
}

fn counter_key(user: UserId, resource: ResourceType) -> CacheKey {
    CacheKey::new(counter_namespace(user, resource), "count")
}

fn counter_namespace(user: UserId, resource: ResourceType) -> String {
    format!("quota:{user}:{resource}")
}

/// Current usage against a limit, as seen by an admitted check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub current: u64,
    pub limit: Limit,
}

#[derive(Clone)]
pub struct QuotaLimiter {
    cache: VersionedCache,
    locks: LockManager,
    usage: Arc<dyn UsageRepository>,
    limits: PlanLimits,
    lock_ttl: Duration,
    counter_ttl: Duration,
}

impl fmt::Debug for QuotaLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaLimiter")
            .field("limits", &self.limits)
            .field("lock_ttl", &self.lock_ttl)
            .finish_non_exhaustive()
    }
}

impl QuotaLimiter {
    pub fn new(
        cache: VersionedCache,
        locks: LockManager,
        usage: Arc<dyn UsageRepository>,
        limits: PlanLimits,
    ) -> Self {
        Self {
            cache,
            locks,
            usage,
            limits,
            lock_ttl: DEFAULT_LOCK_TTL,
            counter_ttl: ttl::COUNTER,
        }
    }

    /// Clamped to [`MIN_LOCK_TTL`].
    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl.max(MIN_LOCK_TTL);
        self
    }

    /// Admit or reject one more unit of `resource` for `user`.
    ///
    /// Fails closed: if the plan or the authoritative count cannot be read,
    /// the answer is `StoreUnavailable`, never an admission.
    pub async fn check_limit(&self, user: UserId, resource: ResourceType) -> PipelineResult<Usage> {
        let current = self.current_usage(user, resource).await?;
        self.admit(user, resource, current).await
    }

    async fn admit(&self, user: UserId, resource: ResourceType, current: u64) -> PipelineResult<Usage> {
        let plan = self.usage.plan_for(user).await?;
        let limit = self.limits.limit(plan, resource);

        match limit {
            Limit::Capped(max) if !limit.admits(current) => {
                info!(user_id = %user, resource = %resource, plan = %plan, current, limit = max, "quota exceeded");
                Err(PipelineError::QuotaExceeded {
                    resource,
                    limit: max,
                    current,
                })
            }
            _ => Ok(Usage { current, limit }),
        }
    }

    /// Check the quota and run `write` under the `(resource, user)` lock, then
    /// invalidate the cached count.
    ///
    /// The check inside the lock counts from the repository, so a cached
    /// count left behind by a failed invalidation cannot admit an extra write.
    ///
    /// `LockUnavailable` if the lock could not be taken within the retry budget.
    pub async fn consume<T, F, Fut>(&self, user: UserId, resource: ResourceType, write: F) -> PipelineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        self.locked(user, resource, || async {
            let current = self.usage.count_usage(user, resource).await?;
            self.admit(user, resource, current).await?;
            let out = write().await;
            self.invalidate_cache(user, resource).await;
            out
        })
        .await
    }

    /// Run a removing write (no limit check) under the same lock discipline.
    pub async fn release<T, F, Fut>(&self, user: UserId, resource: ResourceType, remove: F) -> PipelineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        self.locked(user, resource, || async {
            let out = remove().await;
            self.invalidate_cache(user, resource).await;
            out
        })
        .await
    }

    /// Make the cached count for `(user, resource)` stale.
    ///
    /// Falls back to deleting the counter entry if the version bump fails.
    pub async fn invalidate_cache(&self, user: UserId, resource: ResourceType) {
        let bumped = self
            .cache
            .invalidate_version(&counter_namespace(user, resource))
            .await;
        if bumped.is_none() {
            self.cache.delete(&counter_key(user, resource)).await;
        }
    }

    async fn locked<T, F, Fut>(&self, user: UserId, resource: ResourceType, section: F) -> PipelineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let resource_key = lock_key(user, resource);
        match self
            .locks
            .execute_with_lock(&resource_key, self.lock_ttl, section)
            .await?
        {
            Some(out) => out,
            None => {
                debug!(resource_key = %resource_key, "quota lock busy");
                Err(PipelineError::LockUnavailable { resource_key })
            }
        }
    }

    async fn current_usage(&self, user: UserId, resource: ResourceType) -> PipelineResult<u64> {
        let key = counter_key(user, resource);
        let (cached, version) = self.cache.get_with_version::<u64>(&key).await;
        if let Some(count) = cached {
            return Ok(count);
        }

        let count = self.usage.count_usage(user, resource).await?;
        self.cache
            .set_with_version(&key, &count, version, self.counter_ttl)
            .await;
        Ok(count)
    }
}
