use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use scribe_ai::{AiError, SummaryRequest, Summarizer};

use crate::jobs::{Job, JobFailure, JobHandler, ResultPointer};
use crate::results::{DurableResult, ResultStore};

/// Generates a summary and stores it as a durable result owned by the
/// requesting user. The job itself only keeps a pointer to it.
pub struct SummaryJobHandler {
    summarizer: Arc<dyn Summarizer>,
    results: Arc<dyn ResultStore>,
}

impl SummaryJobHandler {
    pub fn new(summarizer: Arc<dyn Summarizer>, results: Arc<dyn ResultStore>) -> Self {
        Self { summarizer, results }
    }
}

/// Provider errors that can never succeed on retry are permanent.
fn classify(err: AiError) -> JobFailure {
    match err {
        AiError::InvalidInput(msg) => JobFailure::permanent(msg),
        AiError::Upstream { status, .. } if (400..500).contains(&status) && !matches!(status, 408 | 429) => {
            JobFailure::permanent(err.to_string())
        }
        AiError::Upstream { .. } | AiError::RateLimited | AiError::Unavailable(_) => {
            JobFailure::retryable(err.to_string())
        }
    }
}

#[async_trait]
impl JobHandler for SummaryJobHandler {
    async fn handle(&self, job: &Job) -> Result<Option<ResultPointer>, JobFailure> {
        let request: SummaryRequest = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobFailure::permanent(format!("malformed summary payload: {e}")))?;

        let output = self.summarizer.summarize(&request).await.map_err(classify)?;

        let result = DurableResult::new(
            request.user_id,
            serde_json::json!({
                "articleId": request.article_id,
                "summary": output.summary,
                "model": output.model,
                "metadata": output.metadata,
            }),
        );
        let result_id = result.id;
        self.results
            .save(result)
            .await
            .map_err(|e| JobFailure::retryable(e.to_string()))?;

        info!(job_id = %job.id, user_id = %request.user_id, result_id = %result_id, "summary stored");
        Ok(Some(ResultPointer { result_id }))
    }
}
