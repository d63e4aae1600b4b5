//! Background job queues with retry, backoff, timeouts and rate limiting.
//!
//! ## Components
//!
//! - `JobQueue`: producer side (`enqueue`, lookups)
//! - `QueueStore`: shared job storage (in-memory or Redis)
//! - `WorkerPool`: runs a queue's jobs through a `JobHandler`
//! - `CronScheduler`: enqueues a synthetic job on a fixed interval
//! - `RateLimiter`: fixed-window claim limit shared across processes

pub mod config;
pub mod queue;
pub mod rate_limit;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod worker;

pub use config::{QueueConfig, QueueConfigs, RateLimit, Retention};
pub use queue::JobQueue;
pub use rate_limit::{RateDecision, RateLimiter};
#[cfg(feature = "redis")]
pub use redis_store::RedisQueueStore;
pub use scheduler::{CronHandle, CronScheduler};
pub use store::{InMemoryQueueStore, QueueCounts, QueueError, QueueStore};
pub use types::{
    BackoffStrategy, FailureKind, FailureOutcome, Job, JobAttemptRecord, JobFailure, JobId, JobState, LeaseToken,
    QueueName, ResultPointer, RetryPolicy,
};
pub use worker::{JobHandler, PoolStats, WorkerPool, WorkerPoolHandle};
