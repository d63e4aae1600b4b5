//! Pipeline error model.
//!
//! Module errors (`KvError`, `LockError`, `QueueError`, ...) describe what went
//! wrong in one component. `PipelineError` is what request handlers see: it
//! says what the caller can do about it.

use scribe_core::{DomainError, ResourceType};

use crate::jobs::{JobId, QueueError};
use crate::kv::KvError;
use crate::lock::LockError;
use crate::quota::UsageError;
use crate::results::ResultStoreError;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// The user is at their plan's limit. Not retryable.
    #[error("{resource} quota exceeded: {current} of {limit} used")]
    QuotaExceeded {
        resource: ResourceType,
        limit: u64,
        current: u64,
    },

    /// The resource lock could not be acquired in time. Retryable.
    #[error("resource {resource_key} is busy, try again")]
    LockUnavailable { resource_key: String },

    #[error("job {job_id} timed out")]
    JobTimeout { job_id: JobId },

    #[error("job {job_id} failed: {reason}")]
    JobFailed { job_id: JobId, reason: String },

    /// Unknown job, or a job owned by someone else.
    #[error("job not found")]
    JobNotFound,

    /// A backing store needed to make a decision could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Whether the end user may simply retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::LockUnavailable { .. } | PipelineError::StoreUnavailable(_)
        )
    }
}

impl From<KvError> for PipelineError {
    fn from(e: KvError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<LockError> for PipelineError {
    fn from(e: LockError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<UsageError> for PipelineError {
    fn from(e: UsageError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<ResultStoreError> for PipelineError {
    fn from(e: ResultStoreError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<QueueError> for PipelineError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::NotFound(_) => Self::JobNotFound,
            QueueError::Encoding(msg) => Self::Validation(msg),
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<DomainError> for PipelineError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::NotFound => Self::JobNotFound,
            other => Self::Validation(other.to_string()),
        }
    }
}
