//! Job status polling.
//!
//! A poll handle is either a live job id or, for completed work, the stable
//! reference `completed:<resultId>`. The live job is evicted from the queue
//! after its retention window; the stable reference keeps resolving against
//! the durable result store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use scribe_core::{ResultId, UserId};

use crate::cache::{CacheKey, VersionedCache, ttl};
use crate::error::{PipelineError, PipelineResult};
use crate::jobs::{JobId, JobState, QueueStore};
use crate::results::{DurableResult, ResultStore};

const COMPLETED_REF_PREFIX: &str = "completed:";

/// Stable poll handle for a completed job's result.
pub fn stable_ref(result_id: ResultId) -> String {
    format!("{COMPLETED_REF_PREFIX}{result_id}")
}

/// What a poll returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatusView {
    Waiting,
    Active,
    Completed {
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(rename = "stableRef", skip_serializing_if = "Option::is_none")]
        stable_ref: Option<String>,
    },
    Failed,
}

impl JobStatusView {
    fn completed(result: DurableResult) -> Self {
        Self::Completed {
            stable_ref: Some(stable_ref(result.id)),
            result: Some(result.body),
        }
    }
}

/// Cached view of a non-terminal job: enough to re-check ownership.
#[derive(Serialize, Deserialize)]
struct LiveSnapshot {
    owner: Option<UserId>,
    state: JobState,
}

#[derive(Clone)]
pub struct JobStatusResolver {
    jobs: Arc<dyn QueueStore>,
    results: Arc<dyn ResultStore>,
    cache: VersionedCache,
    cache_in_flight: bool,
}

impl std::fmt::Debug for JobStatusResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStatusResolver")
            .field("cache_in_flight", &self.cache_in_flight)
            .finish_non_exhaustive()
    }
}

impl JobStatusResolver {
    pub fn new(jobs: Arc<dyn QueueStore>, results: Arc<dyn ResultStore>, cache: VersionedCache) -> Self {
        Self {
            jobs,
            results,
            cache,
            cache_in_flight: false,
        }
    }

    /// Cache waiting/active lookups for the in-flight TTL.
    pub fn with_in_flight_cache(mut self, enabled: bool) -> Self {
        self.cache_in_flight = enabled;
        self
    }

    /// Resolve a poll handle for `requester`.
    ///
    /// Unknown handles and handles owned by another user are both
    /// `JobNotFound`.
    pub async fn resolve(&self, handle: &str, requester: UserId) -> PipelineResult<JobStatusView> {
        if let Ok(job_id) = handle.parse::<JobId>() {
            if let Some(view) = self.resolve_live(job_id, requester).await? {
                return Ok(view);
            }
        }

        if let Some(raw) = handle.strip_prefix(COMPLETED_REF_PREFIX) {
            if let Ok(result_id) = raw.parse::<ResultId>() {
                return self
                    .load_result(result_id, requester)
                    .await?
                    .map(JobStatusView::completed)
                    .ok_or(PipelineError::JobNotFound);
            }
        }

        debug!(handle, "poll handle not found");
        Err(PipelineError::JobNotFound)
    }

    /// `Ok(None)` when the queue no longer knows the job.
    async fn resolve_live(&self, job_id: JobId, requester: UserId) -> PipelineResult<Option<JobStatusView>> {
        let key = CacheKey::new("job-status", job_id.to_string());
        if self.cache_in_flight {
            if let Some(snapshot) = self.cache.get::<LiveSnapshot>(&key).await {
                return self.authorize(snapshot.owner, requester).map(|()| Some(in_flight(snapshot.state)));
            }
        }

        let Some(job) = self.jobs.get(job_id).await? else {
            return Ok(None);
        };
        self.authorize(job.owner(), requester)?;

        let view = match job.state {
            JobState::Waiting | JobState::Active => {
                if self.cache_in_flight {
                    let snapshot = LiveSnapshot {
                        owner: job.owner(),
                        state: job.state,
                    };
                    self.cache.set(&key, &snapshot, ttl::IN_FLIGHT).await;
                }
                in_flight(job.state)
            }
            JobState::Failed => JobStatusView::Failed,
            JobState::Completed => match job.result {
                Some(pointer) => match self.load_result(pointer.result_id, requester).await? {
                    Some(result) => JobStatusView::completed(result),
                    None => {
                        warn!(job_id = %job_id, result_id = %pointer.result_id, "completed job points at a missing result");
                        return Err(PipelineError::JobNotFound);
                    }
                },
                None => JobStatusView::Completed {
                    result: None,
                    stable_ref: None,
                },
            },
        };
        Ok(Some(view))
    }

    /// Fetch a result through the cache and check its owner.
    async fn load_result(&self, id: ResultId, requester: UserId) -> PipelineResult<Option<DurableResult>> {
        let key = CacheKey::new("result", id.to_string());
        let result = self
            .cache
            .get_or_load(&key, ttl::IMMUTABLE, || self.results.find(id))
            .await?;
        match result {
            Some(r) if r.owner == requester => Ok(Some(r)),
            Some(_) => Err(PipelineError::JobNotFound),
            None => Ok(None),
        }
    }

    fn authorize(&self, owner: Option<UserId>, requester: UserId) -> PipelineResult<()> {
        if owner == Some(requester) {
            Ok(())
        } else {
            Err(PipelineError::JobNotFound)
        }
    }
}

fn in_flight(state: JobState) -> JobStatusView {
    match state {
        JobState::Active => JobStatusView::Active,
        _ => JobStatusView::Waiting,
    }
}
