//! Per-queue configuration.

use std::time::Duration;

use super::types::{QueueName, RetryPolicy};

/// At most `max_jobs` claims per `window`, shared by every process serving
/// the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_jobs: u32,
    pub window: Duration,
}

/// How long terminal jobs stay queryable before eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub completed: Duration,
    pub failed: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed: Duration::from_secs(60 * 60),
            failed: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub name: QueueName,
    /// Parallel jobs per worker pool
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
    pub retry: RetryPolicy,
    /// Per-job timeout; exceeding it is a retryable failure
    pub timeout: Duration,
    /// Enqueue a synthetic job on this interval
    pub cron_interval: Option<Duration>,
    pub retention: Retention,
    /// Idle workers re-check the queue this often
    pub poll_interval: Duration,
    /// Added to `timeout` to form the claim lease
    pub lease_grace: Duration,
    /// How often the pool reclaims stalled jobs and prunes expired ones
    pub maintenance_interval: Duration,
}

impl QueueConfig {
    fn base(name: QueueName) -> Self {
        Self {
            name,
            concurrency: 1,
            rate_limit: None,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(60),
            cron_interval: None,
            retention: Retention::default(),
            poll_interval: Duration::from_millis(250),
            lease_grace: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(5),
        }
    }

    /// AI summaries: 5 workers, 10 jobs/s toward the model API, 3 tries.
    pub fn summary() -> Self {
        Self {
            concurrency: 5,
            rate_limit: Some(RateLimit {
                max_jobs: 10,
                window: Duration::from_secs(1),
            }),
            retry: RetryPolicy::exponential(3, Duration::from_secs(2)),
            timeout: Duration::from_secs(60),
            ..Self::base(QueueName::Summary)
        }
    }

    /// Feed polling: a single worker, triggered every 15 minutes.
    pub fn feed_ingestion() -> Self {
        Self {
            concurrency: 1,
            retry: RetryPolicy::exponential(3, Duration::from_secs(5)),
            timeout: Duration::from_secs(120),
            cron_interval: Some(Duration::from_secs(15 * 60)),
            ..Self::base(QueueName::FeedIngestion)
        }
    }

    pub fn notification() -> Self {
        Self {
            concurrency: 10,
            rate_limit: Some(RateLimit {
                max_jobs: 50,
                window: Duration::from_secs(1),
            }),
            retry: RetryPolicy::exponential(5, Duration::from_secs(1)),
            timeout: Duration::from_secs(15),
            ..Self::base(QueueName::Notification)
        }
    }

    pub fn for_queue(name: QueueName) -> Self {
        match name {
            QueueName::Summary => Self::summary(),
            QueueName::FeedIngestion => Self::feed_ingestion(),
            QueueName::Notification => Self::notification(),
        }
    }

    /// Claim lease: a job not finished within this window counts as stalled.
    pub fn lease(&self) -> Duration {
        self.timeout + self.lease_grace
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: Option<RateLimit>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_cron_interval(mut self, interval: Option<Duration>) -> Self {
        self.cron_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_lease_grace(mut self, grace: Duration) -> Self {
        self.lease_grace = grace;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }
}

/// Configuration of every queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfigs {
    pub summary: QueueConfig,
    pub feed_ingestion: QueueConfig,
    pub notification: QueueConfig,
}

impl Default for QueueConfigs {
    fn default() -> Self {
        Self {
            summary: QueueConfig::summary(),
            feed_ingestion: QueueConfig::feed_ingestion(),
            notification: QueueConfig::notification(),
        }
    }
}

impl QueueConfigs {
    pub fn get(&self, name: QueueName) -> &QueueConfig {
        match name {
            QueueName::Summary => &self.summary,
            QueueName::FeedIngestion => &self.feed_ingestion,
            QueueName::Notification => &self.notification,
        }
    }

    pub fn get_mut(&mut self, name: QueueName) -> &mut QueueConfig {
        match name {
            QueueName::Summary => &mut self.summary,
            QueueName::FeedIngestion => &mut self.feed_ingestion,
            QueueName::Notification => &mut self.notification,
        }
    }

    /// Apply `f` to every queue (e.g. shorter poll intervals in tests).
    pub fn map_all(mut self, f: impl Fn(QueueConfig) -> QueueConfig) -> Self {
        for name in QueueName::ALL {
            let slot = self.get_mut(name);
            *slot = f(slot.clone());
        }
        self
    }
}
