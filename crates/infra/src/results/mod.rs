//! Durable results written by jobs (e.g. generated summaries).
//!
//! The pipeline only reads a result's id and owner; the body is opaque.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scribe_core::{ResultId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResultStoreError {
    #[error("result store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableResult {
    pub id: ResultId,
    pub owner: UserId,
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl DurableResult {
    pub fn new(owner: UserId, body: serde_json::Value) -> Self {
        Self {
            id: ResultId::new(),
            owner,
            body,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ResultStore: Send + Sync + 'static {
    async fn find(&self, id: ResultId) -> Result<Option<DurableResult>, ResultStoreError>;

    async fn save(&self, result: DurableResult) -> Result<(), ResultStoreError>;
}

/// In-memory result store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    results: RwLock<HashMap<ResultId, DurableResult>>,
    finds: AtomicUsize,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// How many `find` calls reached this store.
    pub fn finds(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn find(&self, id: ResultId) -> Result<Option<DurableResult>, ResultStoreError> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        let results = self
            .results
            .read()
            .map_err(|_| ResultStoreError::Unavailable("result table lock poisoned".into()))?;
        Ok(results.get(&id).cloned())
    }

    async fn save(&self, result: DurableResult) -> Result<(), ResultStoreError> {
        let mut results = self
            .results
            .write()
            .map_err(|_| ResultStoreError::Unavailable("result table lock poisoned".into()))?;
        results.insert(result.id, result);
        Ok(())
    }
}
