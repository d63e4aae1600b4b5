//! Authoritative usage counts and plan lookup.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use scribe_core::{Plan, ResourceType, UserId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    #[error("usage store unavailable: {0}")]
    Unavailable(String),
}

/// Source of truth for quota decisions (the application database).
#[async_trait]
pub trait UsageRepository: Send + Sync + 'static {
    async fn plan_for(&self, user: UserId) -> Result<Plan, UsageError>;

    async fn count_usage(&self, user: UserId, resource: ResourceType) -> Result<u64, UsageError>;
}

/// In-memory usage repository for tests/dev.
///
/// Usage is tracked as a set of item ids per `(user, resource)`, so recording
/// the same item twice counts once. Users without an assigned plan are `Free`.
#[derive(Debug, Default)]
pub struct InMemoryUsageRepository {
    plans: RwLock<HashMap<UserId, Plan>>,
    items: RwLock<HashMap<(UserId, ResourceType), BTreeSet<String>>>,
    counts_served: AtomicUsize,
}

impl InMemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_plan(&self, user: UserId, plan: Plan) {
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user, plan);
    }

    /// Record one unit of usage. Returns `false` if `item` was already recorded.
    pub fn record(&self, user: UserId, resource: ResourceType, item: impl Into<String>) -> bool {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((user, resource))
            .or_default()
            .insert(item.into())
    }

    pub fn remove(&self, user: UserId, resource: ResourceType, item: &str) -> bool {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&(user, resource))
            .is_some_and(|set| set.remove(item))
    }

    /// Record `n` anonymous items (test setup).
    pub fn seed(&self, user: UserId, resource: ResourceType, n: u64) {
        for i in 0..n {
            self.record(user, resource, format!("seed-{i}"));
        }
    }

    /// How many times `count_usage` hit this repository.
    pub fn counts_served(&self) -> usize {
        self.counts_served.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UsageRepository for InMemoryUsageRepository {
    async fn plan_for(&self, user: UserId) -> Result<Plan, UsageError> {
        let plans = self
            .plans
            .read()
            .map_err(|_| UsageError::Unavailable("plan table lock poisoned".into()))?;
        Ok(plans.get(&user).copied().unwrap_or(Plan::Free))
    }

    async fn count_usage(&self, user: UserId, resource: ResourceType) -> Result<u64, UsageError> {
        self.counts_served.fetch_add(1, Ordering::SeqCst);
        let items = self
            .items
            .read()
            .map_err(|_| UsageError::Unavailable("usage table lock poisoned".into()))?;
        Ok(items.get(&(user, resource)).map_or(0, |s| s.len() as u64))
    }
}
