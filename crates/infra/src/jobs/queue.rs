//! Producer side of the queues.

use std::sync::Arc;

use tracing::info;

use super::config::QueueConfigs;
use super::store::{QueueCounts, QueueError, QueueStore};
use super::types::{Job, JobId, QueueName};

/// Enqueues jobs and answers lookups. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn QueueStore>,
    configs: Arc<QueueConfigs>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn QueueStore>, configs: QueueConfigs) -> Self {
        Self {
            store,
            configs: Arc::new(configs),
        }
    }

    /// Add a job and return its id. One store write; never waits on processing.
    ///
    /// `payload` must be a JSON object.
    pub async fn enqueue(&self, queue: QueueName, payload: serde_json::Value) -> Result<JobId, QueueError> {
        if !payload.is_object() {
            return Err(QueueError::Encoding("job payload must be a JSON object".into()));
        }
        let max_attempts = self.configs.get(queue).retry.max_attempts;
        let job = Job::new(queue, payload, max_attempts);
        let id = job.id;
        self.store.push(job).await?;
        info!(job_id = %id, queue = %queue, "job enqueued");
        Ok(id)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.store.get(id).await
    }

    pub async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError> {
        self.store.counts(queue).await
    }

    pub fn configs(&self) -> &QueueConfigs {
        &self.configs
    }

    pub fn store(&self) -> Arc<dyn QueueStore> {
        Arc::clone(&self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryQueueStore;
    use crate::jobs::types::JobState;

    #[tokio::test]
    async fn enqueue_stores_a_waiting_job_with_queue_attempts() {
        let queue = JobQueue::new(InMemoryQueueStore::arc(), QueueConfigs::default());
        let id = queue
            .enqueue(QueueName::Notification, serde_json::json!({"message": "hi"}))
            .await
            .unwrap();

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(queue.counts(QueueName::Notification).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn non_object_payload_is_rejected() {
        let queue = JobQueue::new(InMemoryQueueStore::arc(), QueueConfigs::default());
        let err = queue
            .enqueue(QueueName::Summary, serde_json::json!("text"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Encoding(_)));
    }
}
