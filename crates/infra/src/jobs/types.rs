//! Core job types and policies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scribe_core::{DomainError, ResultId, UserId};

/// Unique job identifier (UUIDv7, rendered as text in poll handles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))
    }
}

/// Named queue. Each queue has its own worker pool and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    Summary,
    FeedIngestion,
    Notification,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [
        QueueName::Summary,
        QueueName::FeedIngestion,
        QueueName::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Summary => "summary",
            QueueName::FeedIngestion => "feed-ingestion",
            QueueName::Notification => "notification",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| DomainError::unknown("queue", s))
    }
}

/// Job lifecycle state.
///
/// `waiting -> active -> completed | failed`, with retryable failures going
/// back to `waiting` until the attempts are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl FromStr for BackoffStrategy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            _ => Err(DomainError::unknown("backoff type", s)),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total tries, the first one included (1 = never retried)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10 * 60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so that jobs failing together do not retry in lockstep.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another try is allowed after `attempts_made` tries.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// How a handler failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient (timeout, upstream 5xx, rate limited). Retried per policy.
    Retryable,
    /// The job can never succeed (bad input). Fails immediately.
    Permanent,
}

/// Failure reported by a job handler, classified by the handler itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    pub timed_out: bool,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            timed_out: true,
            ..Self::retryable(format!("timed out after {}ms", after.as_millis()))
        }
    }

    /// The worker holding the job stopped renewing it (process died).
    pub fn stalled() -> Self {
        Self::retryable("job stalled: lease expired")
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }
}

/// Pointer from a completed job to its durable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPointer {
    pub result_id: ResultId,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `waiting`, eligible again after `delay`.
    Retry { delay: Duration },
    /// Terminal.
    Failed,
}

/// Fencing token of the claim that currently holds a job.
///
/// Every claim and every stalled-job reclaim issues a new token. Writes that
/// end an attempt must carry the token the store still holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(pub i64);

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    pub queue: QueueName,
    /// JSON object; carries `userId` when the job belongs to a user
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Finished attempts (successful or not)
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub result: Option<ResultPointer>,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may be claimed (carries retry backoff)
    pub run_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Execution history, one record per attempt
    pub history: Vec<JobAttemptRecord>,
    /// Set once the job is terminal; the store may evict it after this
    pub retain_until: Option<DateTime<Utc>>,
    /// Held while active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseToken>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

impl Job {
    /// Create a new waiting job.
    pub fn new(queue: QueueName, payload: serde_json::Value, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue,
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: max_attempts.max(1),
            result: None,
            enqueued_at: now,
            run_at: now,
            completed_at: None,
            last_error: None,
            history: Vec::new(),
            retain_until: None,
            lease: None,
        }
    }

    /// Owning user, read from `payload.userId`.
    pub fn owner(&self) -> Option<UserId> {
        self.payload
            .get("userId")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    /// Number of the attempt currently running (or about to run).
    pub fn current_attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    pub fn mark_active(&mut self) {
        self.state = JobState::Active;
    }

    /// Mark active under the lease identified by `token`.
    pub fn mark_claimed(&mut self, token: LeaseToken) {
        self.mark_active();
        self.lease = Some(token);
    }

    /// Return a claimed job to `waiting` without consuming an attempt.
    pub fn put_back(&mut self, delay: Duration) {
        self.state = JobState::Waiting;
        self.run_at = Utc::now() + chrono_duration(delay);
    }

    /// Mark job as completed.
    pub fn mark_completed(
        &mut self,
        result: Option<ResultPointer>,
        started_at: DateTime<Utc>,
        retain_for: Duration,
    ) {
        let now = Utc::now();
        self.push_attempt(started_at, now, None);
        self.state = JobState::Completed;
        self.result = result;
        self.completed_at = Some(now);
        self.retain_until = Some(now + chrono_duration(retain_for));
    }

    /// Record a failed attempt and decide between retry and terminal failure.
    ///
    /// Permanent failures and the last allowed attempt are terminal;
    /// `retain_failed_for` then sets the eviction time.
    pub fn mark_failed(
        &mut self,
        failure: &JobFailure,
        started_at: DateTime<Utc>,
        policy: &RetryPolicy,
        retain_failed_for: Duration,
    ) -> FailureOutcome {
        let now = Utc::now();
        self.push_attempt(started_at, now, Some(failure.message.clone()));
        self.last_error = Some(failure.message.clone());

        let allowed = self.max_attempts.min(policy.max_attempts.max(1));
        if failure.is_retryable() && self.attempts_made < allowed {
            let delay = policy.delay_for_attempt(self.attempts_made);
            self.state = JobState::Waiting;
            self.run_at = now + chrono_duration(delay);
            FailureOutcome::Retry { delay }
        } else {
            self.state = JobState::Failed;
            self.completed_at = Some(now);
            self.retain_until = Some(now + chrono_duration(retain_failed_for));
            FailureOutcome::Failed
        }
    }

    fn push_attempt(&mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>, error: Option<String>) {
        self.attempts_made += 1;
        self.history.push(JobAttemptRecord {
            attempt: self.attempts_made,
            started_at,
            finished_at,
            success: error.is_none(),
            error,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        });
    }
}
