//! Queue storage.
//!
//! The store owns job records plus per-queue waiting/active bookkeeping.
//! `claim` is the only way a job becomes active, and it is atomic across
//! every pool sharing the store. Writes that end an attempt (`reschedule`,
//! `finish`) are fenced on the job's [`LeaseToken`], so a worker whose lease
//! was reclaimed cannot overwrite the reclaimer's decision or a later attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;

use super::types::{Job, JobId, JobState, LeaseToken, QueueName};

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {0} is no longer held by this worker")]
    LeaseLost(JobId),
    #[error("job encoding error: {0}")]
    Encoding(String),
    #[error("queue storage error: {0}")]
    Storage(String),
}

/// Jobs per state for one queue. Terminal counts only include retained jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Add a new waiting job.
    async fn push(&self, job: Job) -> Result<(), QueueError>;

    /// Get a job by ID. Evicted jobs are `None`.
    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    /// Atomically take the oldest ready waiting job of `queue`, mark it
    /// active and lease it for `lease`.
    async fn claim(&self, queue: QueueName, lease: Duration) -> Result<Option<Job>, QueueError>;

    /// Store `job` (now `waiting`) and make it claimable after `delay`.
    async fn reschedule(&self, job: &Job, delay: Duration) -> Result<(), QueueError>;

    /// Store a terminal `job`, evicting it after `retain_for`.
    async fn finish(&self, job: &Job, retain_for: Duration) -> Result<(), QueueError>;

    /// Re-lease, for the caller, every active job of `queue` whose lease has
    /// expired. Each stalled job is handed to exactly one caller.
    async fn reclaim_stalled(&self, queue: QueueName, lease: Duration) -> Result<Vec<Job>, QueueError>;

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError>;

    /// Drop terminal jobs past their retention. Returns how many were removed.
    async fn prune(&self, queue: QueueName) -> Result<usize, QueueError>;
}

#[derive(Debug, Clone)]
struct Slot {
    job: Job,
    seq: u64,
    ready_at: Instant,
    lease_until: Option<Instant>,
    evict_at: Option<Instant>,
}

impl Slot {
    fn is_evicted(&self, now: Instant) -> bool {
        self.evict_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Slot>,
    next_seq: u64,
    next_lease: i64,
}

impl Inner {
    fn issue_lease(&mut self) -> LeaseToken {
        self.next_lease += 1;
        LeaseToken(self.next_lease)
    }
}

/// In-memory queue store for tests/dev and single-process deployments.
///
/// Timing uses `tokio::time::Instant` so tests can drive backoff, leases and
/// retention with a paused clock. Eviction is lazy on read plus `prune`.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    inner: Mutex<Inner>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>, QueueError> {
        self.inner
            .lock()
            .map_err(|_| QueueError::Storage("queue store lock poisoned".into()))
    }

    /// Overwrite the record of a job still held under `job.lease`.
    fn release_active(
        &self,
        job: &Job,
        ready_at: Instant,
        evict_at: Option<Instant>,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner()?;
        let slot = inner
            .jobs
            .get_mut(&job.id)
            .ok_or(QueueError::NotFound(job.id))?;
        if slot.job.state != JobState::Active || job.lease.is_none() || slot.job.lease != job.lease {
            return Err(QueueError::LeaseLost(job.id));
        }
        slot.job = Job {
            lease: None,
            ..job.clone()
        };
        slot.ready_at = ready_at;
        slot.lease_until = None;
        slot.evict_at = evict_at;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn push(&self, job: Job) -> Result<(), QueueError> {
        let mut inner = self.inner()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(QueueError::AlreadyExists(job.id));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            job.id,
            Slot {
                job,
                seq,
                ready_at: Instant::now(),
                lease_until: None,
                evict_at: None,
            },
        );
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner()?;
        if inner.jobs.get(&id).is_some_and(|s| s.is_evicted(now)) {
            inner.jobs.remove(&id);
        }
        Ok(inner.jobs.get(&id).map(|s| s.job.clone()))
    }

    async fn claim(&self, queue: QueueName, lease: Duration) -> Result<Option<Job>, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner()?;

        // Oldest ready job first: by readiness, then by enqueue order.
        let next = inner
            .jobs
            .values()
            .filter(|s| s.job.queue == queue && s.job.state == JobState::Waiting && s.ready_at <= now)
            .min_by_key(|s| (s.ready_at, s.seq))
            .map(|s| s.job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let token = inner.issue_lease();
        let Some(slot) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        slot.job.mark_claimed(token);
        slot.lease_until = Some(now + lease);
        Ok(Some(slot.job.clone()))
    }

    async fn reschedule(&self, job: &Job, delay: Duration) -> Result<(), QueueError> {
        self.release_active(job, Instant::now() + delay, None)
    }

    async fn finish(&self, job: &Job, retain_for: Duration) -> Result<(), QueueError> {
        self.release_active(job, Instant::now(), Some(Instant::now() + retain_for))
    }

    async fn reclaim_stalled(&self, queue: QueueName, lease: Duration) -> Result<Vec<Job>, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner()?;
        let stalled: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|s| {
                s.job.queue == queue
                    && s.job.state == JobState::Active
                    && s.lease_until.is_some_and(|until| until <= now)
            })
            .map(|s| s.job.id)
            .collect();

        let mut reclaimed = Vec::with_capacity(stalled.len());
        for id in stalled {
            let token = inner.issue_lease();
            if let Some(slot) = inner.jobs.get_mut(&id) {
                slot.lease_until = Some(now + lease);
                slot.job.lease = Some(token);
                reclaimed.push(slot.job.clone());
            }
        }
        reclaimed.sort_by_key(|j| j.id);
        Ok(reclaimed)
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError> {
        let now = Instant::now();
        let inner = self.inner()?;
        let mut counts = QueueCounts::default();
        for slot in inner.jobs.values() {
            if slot.job.queue != queue || slot.is_evicted(now) {
                continue;
            }
            match slot.job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn prune(&self, queue: QueueName) -> Result<usize, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner()?;
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, s| s.job.queue != queue || !s.is_evicted(now));
        Ok(before - inner.jobs.len())
    }
}
