//! Service wiring.
//!
//! Every component is constructed here from explicit backends and passed to
//! callers as a cheap-to-clone [`Pipeline`]. Nothing is global: tests build a
//! fresh in-memory pipeline per case.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use scribe_ai::{ExtractiveSummarizer, Summarizer};
use scribe_core::{PlanLimits, UserId};

use crate::cache::VersionedCache;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::handlers::{
    FeedIngestionHandler, FeedSource, LogNotifier, NotificationHandler, Notifier, StaticFeedSource,
    SummaryJobHandler,
};
use crate::jobs::{
    CronHandle, CronScheduler, InMemoryQueueStore, JobHandler, JobId, JobQueue, JobState, PoolStats, QueueName,
    QueueStore, RateLimiter, WorkerPool, WorkerPoolHandle,
};
use crate::kv::{InMemoryKvStore, KvStore};
use crate::lock::LockManager;
use crate::quota::{InMemoryUsageRepository, QuotaLimiter, UsageRepository};
use crate::results::{InMemoryResultStore, ResultStore};
use crate::status::{JobStatusResolver, JobStatusView, stable_ref};

const WAIT_POLL: Duration = Duration::from_millis(100);

/// Storage the pipeline runs on.
#[derive(Clone)]
pub struct Backends {
    pub kv: Arc<dyn KvStore>,
    pub jobs: Arc<dyn QueueStore>,
    pub results: Arc<dyn ResultStore>,
    pub usage: Arc<dyn UsageRepository>,
}

impl Backends {
    pub fn in_memory(usage: Arc<dyn UsageRepository>) -> Self {
        Self {
            kv: InMemoryKvStore::arc(),
            jobs: InMemoryQueueStore::arc(),
            results: InMemoryResultStore::arc(),
            usage,
        }
    }

    /// Shared stores on Redis when `redis_url` is set, in-memory otherwise.
    ///
    /// Results and usage counts stay with the caller's repositories.
    pub async fn connect(
        redis_url: Option<&str>,
        results: Arc<dyn ResultStore>,
        usage: Arc<dyn UsageRepository>,
    ) -> PipelineResult<Self> {
        let Some(url) = redis_url else {
            info!("REDIS_URL not set; using in-memory stores");
            return Ok(Self {
                results,
                ..Self::in_memory(usage)
            });
        };
        let (kv, jobs) = redis_stores(url).await?;
        info!("connected to redis");
        Ok(Self {
            kv,
            jobs,
            results,
            usage,
        })
    }
}

#[cfg(feature = "redis")]
async fn redis_stores(url: &str) -> PipelineResult<(Arc<dyn KvStore>, Arc<dyn QueueStore>)> {
    use redis::aio::ConnectionManager;

    use crate::jobs::RedisQueueStore;
    use crate::kv::RedisKvStore;

    let client = redis::Client::open(url).map_err(|e| PipelineError::store_unavailable(e.to_string()))?;
    let conn = ConnectionManager::new(client)
        .await
        .map_err(|e| PipelineError::store_unavailable(e.to_string()))?;
    let kv: Arc<dyn KvStore> = Arc::new(RedisKvStore::from_connection(conn.clone()));
    let jobs: Arc<dyn QueueStore> = Arc::new(RedisQueueStore::new(conn));
    Ok((kv, jobs))
}

#[cfg(not(feature = "redis"))]
async fn redis_stores(_url: &str) -> PipelineResult<(Arc<dyn KvStore>, Arc<dyn QueueStore>)> {
    Err(PipelineError::store_unavailable(
        "REDIS_URL is set but this build has no redis support",
    ))
}

/// External collaborators of the job handlers.
#[derive(Clone)]
pub struct Collaborators {
    pub summarizer: Arc<dyn Summarizer>,
    pub feeds: Arc<dyn FeedSource>,
    pub notifier: Arc<dyn Notifier>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            summarizer: Arc::new(ExtractiveSummarizer::default()),
            feeds: StaticFeedSource::arc(),
            notifier: Arc::new(LogNotifier),
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    kv: Arc<dyn KvStore>,
    results: Arc<dyn ResultStore>,
    queue: JobQueue,
    cache: VersionedCache,
    quota: QuotaLimiter,
    status: JobStatusResolver,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig, backends: Backends, limits: PlanLimits) -> Self {
        let cache = VersionedCache::new(Arc::clone(&backends.kv));
        let locks = LockManager::new(Arc::clone(&backends.kv));
        let quota = QuotaLimiter::new(cache.clone(), locks, backends.usage, limits).with_lock_ttl(config.lock_ttl);
        let status = JobStatusResolver::new(Arc::clone(&backends.jobs), Arc::clone(&backends.results), cache.clone())
            .with_in_flight_cache(config.cache_in_flight);
        let queue = JobQueue::new(backends.jobs, config.queues.clone());

        Self {
            config: Arc::new(config),
            kv: backends.kv,
            results: backends.results,
            queue,
            cache,
            quota,
            status,
        }
    }

    /// Single-process pipeline with default plan limits.
    pub fn in_memory(config: PipelineConfig) -> (Self, Arc<InMemoryUsageRepository>) {
        let usage = InMemoryUsageRepository::arc();
        let backends = Backends::in_memory(usage.clone());
        (Self::new(config, backends, PlanLimits::default()), usage)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn quota(&self) -> &QuotaLimiter {
        &self.quota
    }

    pub fn status(&self) -> &JobStatusResolver {
        &self.status
    }

    pub fn cache(&self) -> &VersionedCache {
        &self.cache
    }

    pub async fn enqueue(&self, queue: QueueName, payload: serde_json::Value) -> PipelineResult<JobId> {
        Ok(self.queue.enqueue(queue, payload).await?)
    }

    /// Wait until `job_id` reaches a terminal state.
    ///
    /// `JobFailed` carries the last attempt's error; `JobTimeout` means the
    /// job was still running when `timeout` elapsed.
    pub async fn wait_for_completion(
        &self,
        job_id: JobId,
        requester: UserId,
        timeout: Duration,
    ) -> PipelineResult<JobStatusView> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.queue.get(job_id).await?.ok_or(PipelineError::JobNotFound)?;
            if job.owner() != Some(requester) {
                return Err(PipelineError::JobNotFound);
            }
            match job.state {
                JobState::Completed => {
                    return match job.result {
                        Some(pointer) => self.status.resolve(&stable_ref(pointer.result_id), requester).await,
                        None => Ok(JobStatusView::Completed {
                            result: None,
                            stable_ref: None,
                        }),
                    };
                }
                JobState::Failed => {
                    return Err(PipelineError::JobFailed {
                        job_id,
                        reason: job.last_error.unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
                JobState::Waiting | JobState::Active => {}
            }
            if Instant::now() >= deadline {
                return Err(PipelineError::JobTimeout { job_id });
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Spawn one worker pool per queue and the cron schedules.
    pub fn start(&self, collaborators: Collaborators) -> PipelineRuntime {
        let handlers: [(QueueName, Arc<dyn JobHandler>); 3] = [
            (
                QueueName::Summary,
                Arc::new(SummaryJobHandler::new(collaborators.summarizer, Arc::clone(&self.results))),
            ),
            (
                QueueName::FeedIngestion,
                Arc::new(FeedIngestionHandler::new(
                    collaborators.feeds,
                    Arc::clone(&self.kv),
                    self.queue.clone(),
                )),
            ),
            (
                QueueName::Notification,
                Arc::new(NotificationHandler::new(collaborators.notifier)),
            ),
        ];

        let limiter = RateLimiter::new(Arc::clone(&self.kv));
        let pools = handlers
            .into_iter()
            .map(|(name, handler)| {
                WorkerPool::new(self.config.queues.get(name).clone(), self.queue.store(), handler)
                    .with_rate_limiter(limiter.clone())
                    .spawn()
            })
            .collect();

        let scheduler = CronScheduler::new(self.queue.clone(), Arc::clone(&self.kv));
        let crons = QueueName::ALL
            .into_iter()
            .filter_map(|name| {
                let interval = self.config.queues.get(name).cron_interval?;
                info!(queue = %name, interval_secs = interval.as_secs(), "cron schedule started");
                Some(scheduler.spawn(name, interval))
            })
            .collect();

        PipelineRuntime { pools, crons }
    }
}

/// Running worker pools and schedules.
#[derive(Debug)]
pub struct PipelineRuntime {
    pools: Vec<WorkerPoolHandle>,
    crons: Vec<CronHandle>,
}

impl PipelineRuntime {
    pub fn stats(&self) -> Vec<(QueueName, PoolStats)> {
        self.pools.iter().map(|p| (p.queue(), p.stats())).collect()
    }

    /// Run `queue`'s cron job now. `false` if the queue has no schedule.
    pub fn trigger(&self, queue: QueueName) -> bool {
        match self.crons.iter().find(|c| c.queue() == queue) {
            Some(cron) => {
                cron.trigger();
                true
            }
            None => {
                warn!(queue = %queue, "manual trigger for a queue without a schedule");
                false
            }
        }
    }

    /// Stop schedules first so nothing new is enqueued, then drain the pools.
    pub async fn shutdown(self) {
        for cron in self.crons {
            cron.shutdown().await;
        }
        for pool in self.pools {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use scribe_core::{ArticleId, ResourceType};

    use super::*;
    use crate::handlers::FeedItem;

    fn fast_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.queues = config
            .queues
            .map_all(|q| q.with_poll_interval(Duration::from_millis(10)));
        config
    }

    #[tokio::test]
    async fn summary_request_runs_to_a_stable_result() {
        let (pipeline, usage) = Pipeline::in_memory(fast_config());
        let runtime = pipeline.start(Collaborators::default());
        let user = UserId::new();

        let job_id = pipeline
            .quota()
            .consume(user, ResourceType::Summary, || async {
                let id = pipeline
                    .enqueue(
                        QueueName::Summary,
                        serde_json::json!({
                            "userId": user,
                            "articleId": ArticleId::new(),
                            "text": "Rust is fast. It is also safe. Tests agree.",
                        }),
                    )
                    .await?;
                usage.record(user, ResourceType::Summary, id.to_string());
                Ok(id)
            })
            .await
            .unwrap();

        let view = pipeline
            .wait_for_completion(job_id, user, Duration::from_secs(5))
            .await
            .unwrap();
        let JobStatusView::Completed {
            result: Some(body),
            stable_ref: Some(stable),
        } = view
        else {
            panic!("unexpected view: {view:?}");
        };
        assert_eq!(body["model"], "extractive");

        let again = pipeline.status().resolve(&stable, user).await.unwrap();
        assert!(matches!(again, JobStatusView::Completed { .. }));
        assert_eq!(
            pipeline.status().resolve(&stable, UserId::new()).await,
            Err(PipelineError::JobNotFound)
        );

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn permanent_failure_surfaces_reason() {
        let (pipeline, _usage) = Pipeline::in_memory(fast_config());
        let runtime = pipeline.start(Collaborators::default());
        let user = UserId::new();

        let job_id = pipeline
            .enqueue(
                QueueName::Summary,
                serde_json::json!({"userId": user, "articleId": ArticleId::new(), "text": "   "}),
            )
            .await
            .unwrap();

        let err = pipeline
            .wait_for_completion(job_id, user, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::JobFailed { reason, .. } if reason.contains("text is empty")));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn waiting_past_the_deadline_times_out() {
        let (pipeline, _usage) = Pipeline::in_memory(fast_config());
        let user = UserId::new();
        // No workers running: the job never leaves `waiting`.
        let job_id = pipeline
            .enqueue(QueueName::Notification, serde_json::json!({"userId": user, "message": "hi"}))
            .await
            .unwrap();

        let err = pipeline
            .wait_for_completion(job_id, user, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::JobTimeout { job_id });
    }

    #[tokio::test]
    async fn feed_trigger_fans_out_notifications() {
        let (pipeline, _usage) = Pipeline::in_memory(fast_config());
        let feeds = StaticFeedSource::arc();
        let owner = UserId::new();
        feeds.push(FeedItem {
            owner,
            feed_url: "https://example.org/rss".into(),
            item_id: "1".into(),
            title: "hello".into(),
        });
        let runtime = pipeline.start(Collaborators {
            feeds,
            ..Collaborators::default()
        });

        let mut delivered = false;
        for _ in 0..200 {
            let stats = runtime.stats();
            let notification = stats
                .iter()
                .find(|(q, _)| *q == QueueName::Notification)
                .map(|(_, s)| s.jobs_succeeded)
                .unwrap_or(0);
            if notification == 1 {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(delivered, "notification was not delivered");
        assert!(!runtime.trigger(QueueName::Summary));

        runtime.shutdown().await;
    }
}
