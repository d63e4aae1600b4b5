//! Periodic feed ingestion.
//!
//! Each run polls the configured feeds, skips items already seen and queues a
//! notification for the owner of every new item.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use scribe_core::UserId;

use crate::jobs::{Job, JobFailure, JobHandler, JobQueue, QueueName, ResultPointer};
use crate::kv::KvStore;

/// How long an item id is remembered as seen.
pub const SEEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub owner: UserId,
    pub feed_url: String,
    pub item_id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("feed fetch failed: {0}")]
    Fetch(String),

    #[error("malformed feed: {0}")]
    Malformed(String),
}

/// Source of subscribed feed items.
#[async_trait]
pub trait FeedSource: Send + Sync + 'static {
    async fn poll(&self) -> Result<Vec<FeedItem>, FeedError>;
}

/// Fixed item list for tests/dev.
#[derive(Debug, Default)]
pub struct StaticFeedSource {
    items: Mutex<Vec<FeedItem>>,
}

impl StaticFeedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn push(&self, item: FeedItem) {
        if let Ok(mut items) = self.items.lock() {
            items.push(item);
        }
    }
}

#[async_trait]
impl FeedSource for StaticFeedSource {
    async fn poll(&self) -> Result<Vec<FeedItem>, FeedError> {
        self.items
            .lock()
            .map(|items| items.clone())
            .map_err(|_| FeedError::Fetch("feed list lock poisoned".into()))
    }
}

pub struct FeedIngestionHandler {
    source: Arc<dyn FeedSource>,
    seen: Arc<dyn KvStore>,
    queue: JobQueue,
}

impl FeedIngestionHandler {
    pub fn new(source: Arc<dyn FeedSource>, seen: Arc<dyn KvStore>, queue: JobQueue) -> Self {
        Self { source, seen, queue }
    }

    fn seen_key(item: &FeedItem) -> String {
        format!("scribe:feed:seen:{}:{}", item.owner, item.item_id)
    }
}

#[async_trait]
impl JobHandler for FeedIngestionHandler {
    async fn handle(&self, job: &Job) -> Result<Option<ResultPointer>, JobFailure> {
        let items = self.source.poll().await.map_err(|e| match e {
            FeedError::Fetch(_) => JobFailure::retryable(e.to_string()),
            FeedError::Malformed(_) => JobFailure::permanent(e.to_string()),
        })?;

        let mut queued = 0usize;
        for item in &items {
            let key = Self::seen_key(item);
            let fresh = self
                .seen
                .set_nx(&key, "1", SEEN_TTL)
                .await
                .map_err(|e| JobFailure::retryable(e.to_string()))?;
            if !fresh {
                continue;
            }

            let payload = serde_json::json!({
                "userId": item.owner,
                "message": format!("New in {}: {}", item.feed_url, item.title),
                "itemId": item.item_id,
            });
            if let Err(e) = self.queue.enqueue(QueueName::Notification, payload).await {
                // Forget the item so the retry picks it up again.
                if let Err(undo) = self.seen.delete(&key).await {
                    warn!(item_id = %item.item_id, error = %undo, "failed to clear seen marker");
                }
                return Err(JobFailure::retryable(e.to_string()));
            }
            queued += 1;
        }

        info!(job_id = %job.id, polled = items.len(), queued, "feed ingestion finished");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{FailureKind, InMemoryQueueStore, QueueConfigs, QueueStore};
    use crate::kv::InMemoryKvStore;

    struct Broken;

    #[async_trait]
    impl FeedSource for Broken {
        async fn poll(&self) -> Result<Vec<FeedItem>, FeedError> {
            Err(FeedError::Fetch("connection reset".into()))
        }
    }

    fn item(owner: UserId, id: &str) -> FeedItem {
        FeedItem {
            owner,
            feed_url: "https://example.org/rss".into(),
            item_id: id.into(),
            title: format!("post {id}"),
        }
    }

    fn tick() -> Job {
        Job::new(QueueName::FeedIngestion, serde_json::json!({"trigger": "manual"}), 3)
    }

    #[tokio::test]
    async fn new_items_are_notified_once() {
        let store = InMemoryQueueStore::arc();
        let queue = JobQueue::new(store.clone(), QueueConfigs::default());
        let source = StaticFeedSource::arc();
        let owner = UserId::new();
        source.push(item(owner, "a"));
        source.push(item(owner, "b"));

        let handler = FeedIngestionHandler::new(source.clone(), InMemoryKvStore::arc(), queue.clone());
        handler.handle(&tick()).await.unwrap();
        assert_eq!(queue.counts(QueueName::Notification).await.unwrap().waiting, 2);

        source.push(item(owner, "c"));
        handler.handle(&tick()).await.unwrap();
        assert_eq!(queue.counts(QueueName::Notification).await.unwrap().waiting, 3);

        let job = store
            .claim(QueueName::Notification, Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.owner(), Some(owner));
    }

    #[tokio::test]
    async fn fetch_error_is_retryable() {
        let queue = JobQueue::new(InMemoryQueueStore::arc(), QueueConfigs::default());
        let handler = FeedIngestionHandler::new(Arc::new(Broken), InMemoryKvStore::arc(), queue);
        let failure = handler.handle(&tick()).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Retryable);
    }
}
