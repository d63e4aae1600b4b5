//! Worker pool: claims jobs from one queue and runs them with retry, backoff,
//! per-job timeout and rate limiting.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::QueueConfig;
use super::rate_limit::{RateDecision, RateLimiter};
use super::store::{QueueError, QueueStore};
use super::types::{FailureOutcome, Job, JobFailure, QueueName, ResultPointer};

/// Executes jobs of one queue.
///
/// Handlers classify their own failures: [`JobFailure::retryable`] for
/// transient problems, [`JobFailure::permanent`] for input that can never
/// succeed. A successful job may point at a durable result.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<Option<ResultPointer>, JobFailure>;
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
    pub jobs_stalled: u64,
    pub claims_rate_limited: u64,
    pub current_running: usize,
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    queue: QueueName,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPoolHandle {
    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// Stop claiming, let in-flight jobs finish, and wait for every worker.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(queue = %self.queue, error = %e, "worker task ended abnormally");
            }
        }
        info!(queue = %self.queue, "worker pool stopped");
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct WorkerPool {
    config: QueueConfig,
    store: Arc<dyn QueueStore>,
    handler: Arc<dyn JobHandler>,
    limiter: Option<RateLimiter>,
}

impl WorkerPool {
    pub fn new(config: QueueConfig, store: Arc<dyn QueueStore>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            config,
            store,
            handler,
            limiter: None,
        }
    }

    /// Enforce `config.rate_limit` through `limiter`. Without a limiter the
    /// configured rate limit is ignored.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Spawn `concurrency` workers plus one maintenance task.
    pub fn spawn(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = self.config.name;
        let concurrency = self.config.concurrency.max(1);
        let shared = Arc::new(Shared {
            config: self.config,
            store: self.store,
            handler: self.handler,
            limiter: self.limiter,
            stats: Arc::new(Mutex::new(PoolStats::default())),
        });

        let mut tasks = Vec::with_capacity(concurrency + 1);
        for worker in 0..concurrency {
            let shared = Arc::clone(&shared);
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { shared.worker_loop(worker, shutdown).await }));
        }
        {
            let shared = Arc::clone(&shared);
            tasks.push(tokio::spawn(async move { shared.maintenance_loop(shutdown_rx).await }));
        }

        info!(queue = %queue, concurrency, "worker pool started");
        WorkerPoolHandle {
            queue,
            shutdown: shutdown_tx,
            tasks,
            stats: Arc::clone(&shared.stats),
        }
    }
}

struct Shared {
    config: QueueConfig,
    store: Arc<dyn QueueStore>,
    handler: Arc<dyn JobHandler>,
    limiter: Option<RateLimiter>,
    stats: Arc<Mutex<PoolStats>>,
}

/// Sleep for `d` unless shutdown is requested first. Returns whether to stop.
async fn idle(d: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(d) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

impl Shared {
    fn bump(&self, f: impl FnOnce(&mut PoolStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        let queue = self.config.name;
        debug!(queue = %queue, worker, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.store.claim(queue, self.config.lease()).await {
                Ok(Some(job)) => {
                    debug!(queue = %queue, worker, job_id = %job.id, attempt = job.current_attempt(), "claimed job");
                    if let Some(wait) = self.admission().await {
                        self.put_back(job, wait).await;
                        if idle(wait, &mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                    self.run(job).await;
                }
                Ok(None) => {
                    if idle(self.config.poll_interval, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(queue = %queue, worker, error = %e, "failed to claim job");
                    if idle(self.config.poll_interval, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        debug!(queue = %queue, worker, "worker stopped");
    }

    /// `Some(wait)` if the rate limiter refuses this claim.
    async fn admission(&self) -> Option<Duration> {
        let (Some(limiter), Some(limit)) = (&self.limiter, self.config.rate_limit) else {
            return None;
        };
        match limiter.try_acquire(self.config.name, limit).await {
            Ok(RateDecision::Allowed) => None,
            Ok(RateDecision::Limited { retry_in }) => Some(retry_in),
            Err(e) => {
                warn!(queue = %self.config.name, error = %e, "rate limiter unavailable; backing off");
                Some(self.config.poll_interval)
            }
        }
    }

    async fn put_back(&self, mut job: Job, wait: Duration) {
        job.put_back(wait);
        self.bump(|s| s.claims_rate_limited += 1);
        debug!(queue = %self.config.name, job_id = %job.id, wait_ms = wait.as_millis() as u64, "rate limited; job put back");
        if let Err(e) = self.store.reschedule(&job, wait).await {
            self.record_error(&job, e);
        }
    }

    async fn run(&self, mut job: Job) {
        let started = Utc::now();
        self.bump(|s| s.current_running += 1);
        let outcome = self.execute(&job).await;
        self.bump(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
        });

        match outcome {
            Ok(result) => {
                job.mark_completed(result, started, self.config.retention.completed);
                info!(queue = %job.queue, job_id = %job.id, attempt = job.attempts_made, "job completed");
                self.bump(|s| s.jobs_succeeded += 1);
                if let Err(e) = self.store.finish(&job, self.config.retention.completed).await {
                    self.record_error(&job, e);
                }
            }
            Err(failure) => self.settle_failure(job, &failure, started).await,
        }
    }

    /// Run the handler in its own task so a panic fails only this attempt.
    async fn execute(&self, job: &Job) -> Result<Option<ResultPointer>, JobFailure> {
        let handler = Arc::clone(&self.handler);
        let snapshot = job.clone();
        let task = tokio::spawn(async move { handler.handle(&snapshot).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(self.config.timeout, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Err(JobFailure::retryable(format!("handler panicked: {join}"))),
            Err(_) => {
                abort.abort();
                Err(JobFailure::timeout(self.config.timeout))
            }
        }
    }

    async fn settle_failure(&self, mut job: Job, failure: &JobFailure, started: DateTime<Utc>) {
        if failure.timed_out {
            self.bump(|s| s.jobs_timed_out += 1);
        }

        let outcome = job.mark_failed(failure, started, &self.config.retry, self.config.retention.failed);
        let stored = match outcome {
            FailureOutcome::Retry { delay } => {
                warn!(
                    queue = %job.queue,
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "job failed; retry scheduled"
                );
                self.bump(|s| s.jobs_retried += 1);
                self.store.reschedule(&job, delay).await
            }
            FailureOutcome::Failed => {
                error!(
                    queue = %job.queue,
                    job_id = %job.id,
                    attempts = job.attempts_made,
                    retryable = failure.is_retryable(),
                    error = %failure,
                    "job failed"
                );
                self.bump(|s| s.jobs_failed += 1);
                self.store.finish(&job, self.config.retention.failed).await
            }
        };
        if let Err(e) = stored {
            self.record_error(&job, e);
        }
    }

    fn record_error(&self, job: &Job, e: QueueError) {
        match e {
            QueueError::LeaseLost(_) => {
                warn!(queue = %job.queue, job_id = %job.id, "job was reclaimed elsewhere; outcome dropped")
            }
            other => {
                error!(queue = %job.queue, job_id = %job.id, error = %other, "failed to store job outcome; lease expiry will recover it")
            }
        }
    }

    /// Reclaim jobs whose worker died and drop expired terminal jobs.
    async fn maintenance_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.config.name;
        loop {
            if idle(self.config.maintenance_interval, &mut shutdown).await {
                break;
            }

            match self.store.reclaim_stalled(queue, self.config.lease()).await {
                Ok(stalled) => {
                    for job in stalled {
                        warn!(queue = %queue, job_id = %job.id, attempt = job.current_attempt(), "reclaiming stalled job");
                        self.bump(|s| s.jobs_stalled += 1);
                        self.settle_failure(job, &JobFailure::stalled(), Utc::now()).await;
                    }
                }
                Err(e) => error!(queue = %queue, error = %e, "stalled job scan failed"),
            }

            match self.store.prune(queue).await {
                Ok(0) => {}
                Ok(n) => debug!(queue = %queue, evicted = n, "evicted expired jobs"),
                Err(e) => warn!(queue = %queue, error = %e, "job eviction failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use scribe_core::ResultId;
    use tokio::sync::Semaphore;
    use tokio::time::Instant;

    use super::*;
    use crate::jobs::config::{QueueConfigs, RateLimit};
    use crate::jobs::queue::JobQueue;
    use crate::jobs::scheduler::CronScheduler;
    use crate::jobs::store::InMemoryQueueStore;
    use crate::jobs::types::{JobId, JobState, RetryPolicy};
    use crate::kv::InMemoryKvStore;

    fn config(queue: QueueName) -> QueueConfig {
        QueueConfig::for_queue(queue)
            .with_rate_limit(None)
            .with_poll_interval(Duration::from_millis(10))
            .with_maintenance_interval(Duration::from_millis(50))
    }

    async fn push(store: &InMemoryQueueStore, cfg: &QueueConfig) -> JobId {
        let job = Job::new(cfg.name, serde_json::json!({}), cfg.retry.max_attempts);
        let id = job.id;
        store.push(job).await.unwrap();
        id
    }

    async fn wait_terminal(store: &InMemoryQueueStore, id: JobId) -> Job {
        for _ in 0..10_000 {
            if let Some(job) = store.get(id).await.unwrap() {
                if job.state.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never finished");
    }

    /// Records the start time of every attempt; fails until `succeed_on`.
    struct Recording {
        starts: Mutex<Vec<Instant>>,
        succeed_on: Option<u32>,
        failure: JobFailure,
    }

    impl Recording {
        fn new(succeed_on: Option<u32>, failure: JobFailure) -> Arc<Self> {
            Arc::new(Self {
                starts: Mutex::new(Vec::new()),
                succeed_on,
                failure,
            })
        }

        fn starts(&self) -> Vec<Instant> {
            self.starts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobHandler for Recording {
        async fn handle(&self, job: &Job) -> Result<Option<ResultPointer>, JobFailure> {
            self.starts.lock().unwrap().push(Instant::now());
            if self.succeed_on == Some(job.current_attempt()) {
                Ok(Some(ResultPointer { result_id: ResultId::new() }))
            } else {
                Err(self.failure.clone())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_job_completes_with_result_pointer() {
        let store = InMemoryQueueStore::arc();
        let cfg = config(QueueName::Summary);
        let id = push(&store, &cfg).await;
        let handler = Recording::new(Some(1), JobFailure::retryable("unused"));

        let pool = WorkerPool::new(cfg, store.clone(), handler.clone()).spawn();
        let job = wait_terminal(&store, id).await;
        pool.shutdown().await;

        assert_eq!(job.state, JobState::Completed);
        assert!(job.result.is_some());
        assert_eq!(job.attempts_made, 1);
        assert_eq!(handler.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_job_runs_three_times_with_growing_delays() {
        let store = InMemoryQueueStore::arc();
        let cfg = config(QueueName::Summary).with_retry(RetryPolicy::exponential(3, Duration::from_secs(1)));
        let id = push(&store, &cfg).await;
        let handler = Recording::new(None, JobFailure::retryable("upstream 503"));

        let pool = WorkerPool::new(cfg, store.clone(), handler.clone()).spawn();
        let job = wait_terminal(&store, id).await;
        // Give a wrongly scheduled fourth attempt the chance to show up.
        tokio::time::sleep(Duration::from_secs(30)).await;
        let stats = pool.stats();
        pool.shutdown().await;

        let starts = handler.starts();
        assert_eq!(starts.len(), 3);
        let first_gap = starts[1] - starts[0];
        let second_gap = starts[2] - starts[1];
        assert!(first_gap >= Duration::from_secs(1));
        assert!(second_gap >= Duration::from_secs(2));
        assert!(second_gap > first_gap);

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 3);
        assert_eq!(stats.jobs_retried, 2);
        assert_eq!(stats.jobs_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let store = InMemoryQueueStore::arc();
        let cfg = config(QueueName::Summary);
        let id = push(&store, &cfg).await;
        let handler = Recording::new(None, JobFailure::permanent("text is empty"));

        let pool = WorkerPool::new(cfg, store.clone(), handler.clone()).spawn();
        let job = wait_terminal(&store, id).await;
        pool.shutdown().await;

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.last_error.as_deref(), Some("text is empty"));
        assert_eq!(handler.starts().len(), 1);
    }

    struct SlowFirstAttempt;

    #[async_trait]
    impl JobHandler for SlowFirstAttempt {
        async fn handle(&self, job: &Job) -> Result<Option<ResultPointer>, JobFailure> {
            if job.current_attempt() == 1 {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_attempt_is_retried() {
        let store = InMemoryQueueStore::arc();
        let cfg = config(QueueName::Notification)
            .with_timeout(Duration::from_secs(1))
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(100)));
        let id = push(&store, &cfg).await;

        let pool = WorkerPool::new(cfg, store.clone(), Arc::new(SlowFirstAttempt)).spawn();
        let job = wait_terminal(&store, id).await;
        let stats = pool.stats();
        pool.shutdown().await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 2);
        assert!(job.history[0].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(stats.jobs_timed_out, 1);
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn handle(&self, _job: &Job) -> Result<Option<ResultPointer>, JobFailure> {
            panic!("handler bug")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_fails_only_the_job() {
        let store = InMemoryQueueStore::arc();
        let cfg = config(QueueName::Summary).with_retry(RetryPolicy::fixed(2, Duration::from_millis(10)));
        let first = push(&store, &cfg).await;
        let second = push(&store, &cfg).await;

        let pool = WorkerPool::new(cfg, store.clone(), Arc::new(Panics)).spawn();
        let a = wait_terminal(&store, first).await;
        let b = wait_terminal(&store, second).await;
        pool.shutdown().await;

        assert_eq!((a.state, b.state), (JobState::Failed, JobState::Failed));
        assert_eq!(a.attempts_made, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_job_is_reclaimed_and_retried() {
        let store = InMemoryQueueStore::arc();
        let cfg = config(QueueName::Summary)
            .with_timeout(Duration::from_secs(1))
            .with_lease_grace(Duration::from_secs(1))
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(100)));
        let id = push(&store, &cfg).await;

        // A worker in another process claims the job and dies.
        store.claim(QueueName::Summary, cfg.lease()).await.unwrap().unwrap();

        let handler = Recording::new(Some(2), JobFailure::retryable("unused"));
        let pool = WorkerPool::new(cfg, store.clone(), handler.clone()).spawn();
        let job = wait_terminal(&store, id).await;
        let stats = pool.stats();
        pool.shutdown().await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 2);
        assert!(job.history[0].error.as_deref().unwrap().contains("stalled"));
        assert_eq!(stats.jobs_stalled, 1);
        assert_eq!(handler.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_caps_claims_without_consuming_attempts() {
        let store = InMemoryQueueStore::arc();
        let cfg = config(QueueName::Notification)
            .with_concurrency(5)
            .with_rate_limit(Some(RateLimit {
                max_jobs: 2,
                window: Duration::from_secs(1),
            }));
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(push(&store, &cfg).await);
        }
        let handler = Recording::new(Some(1), JobFailure::retryable("unused"));

        let pool = WorkerPool::new(cfg, store.clone(), handler.clone())
            .with_rate_limiter(RateLimiter::new(InMemoryKvStore::arc()))
            .spawn();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(handler.starts().len(), 2);

        let mut jobs = Vec::new();
        for id in ids {
            jobs.push(wait_terminal(&store, id).await);
        }
        let stats = pool.stats();
        pool.shutdown().await;

        assert!(jobs.iter().all(|j| j.state == JobState::Completed && j.attempts_made == 1));
        assert!(stats.claims_rate_limited > 0);

        let starts = handler.starts();
        let origin = starts[0];
        for window in 0..3u32 {
            let lo = origin + Duration::from_secs(1) * window;
            let hi = lo + Duration::from_secs(1);
            let in_window = starts.iter().filter(|t| **t >= lo && **t < hi).count();
            assert!(in_window <= 2, "window {window} ran {in_window} jobs");
        }
    }

    /// Blocks every job until a permit is released.
    struct Gated {
        gate: Arc<Semaphore>,
        started: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for Gated {
        async fn handle(&self, _job: &Job) -> Result<Option<ResultPointer>, JobFailure> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let permit = self.gate.acquire().await.map_err(|e| JobFailure::retryable(e.to_string()))?;
            permit.forget();
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_worker_queue_keeps_triggered_run_waiting() {
        let store = InMemoryQueueStore::arc();
        let cfg = config(QueueName::FeedIngestion);
        assert_eq!(cfg.concurrency, 1);
        let handler = Arc::new(Gated {
            gate: Arc::new(Semaphore::new(0)),
            started: AtomicU32::new(0),
        });
        let pool = WorkerPool::new(cfg, store.clone(), handler.clone()).spawn();

        // The scheduled tick fires at once; a manual trigger lands while it runs.
        let queue = JobQueue::new(store.clone(), QueueConfigs::default());
        let cron = CronScheduler::new(queue, InMemoryKvStore::arc())
            .spawn(QueueName::FeedIngestion, Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_secs(1)).await;
        cron.trigger();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let counts = store.counts(QueueName::FeedIngestion).await.unwrap();
        assert_eq!((counts.active, counts.waiting), (1, 1));
        assert_eq!(handler.started.load(Ordering::SeqCst), 1);

        handler.gate.add_permits(2);
        for _ in 0..1_000 {
            if store.counts(QueueName::FeedIngestion).await.unwrap().completed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cron.shutdown().await;
        pool.shutdown().await;

        let counts = store.counts(QueueName::FeedIngestion).await.unwrap();
        assert_eq!((counts.completed, counts.active, counts.waiting), (2, 0, 0));
        assert_eq!(handler.started.load(Ordering::SeqCst), 2);
    }

    struct Sleeps(Duration);

    #[async_trait]
    impl JobHandler for Sleeps {
        async fn handle(&self, _job: &Job) -> Result<Option<ResultPointer>, JobFailure> {
            tokio::time::sleep(self.0).await;
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_in_flight_job_finish() {
        let store = InMemoryQueueStore::arc();
        let cfg = config(QueueName::Summary);
        let id = push(&store, &cfg).await;

        let pool = WorkerPool::new(cfg, store.clone(), Arc::new(Sleeps(Duration::from_secs(2)))).spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.stats().current_running, 1);

        pool.shutdown().await;
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }
}
