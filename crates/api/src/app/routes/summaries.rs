use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use scribe_ai::SummaryRequest;
use scribe_core::ResourceType;
use scribe_infra::jobs::QueueName;
use scribe_infra::PipelineError;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::UserContext;

/// Queue a summary for the caller, counted against their summary quota.
pub async fn create_summary(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<dto::CreateSummaryRequest>,
) -> axum::response::Response {
    if let Err(e) = body.validate() {
        return errors::pipeline_error_to_response(e);
    }

    let user_id = user.user_id();
    let request = SummaryRequest {
        user_id,
        article_id: body.article_id,
        text: body.text,
    };
    let payload = match serde_json::to_value(&request) {
        Ok(p) => p,
        Err(e) => return errors::pipeline_error_to_response(PipelineError::validation(e.to_string())),
    };

    let pipeline = &services.pipeline;
    let queued = pipeline
        .quota()
        .consume(user_id, ResourceType::Summary, || async {
            let job_id = pipeline.enqueue(QueueName::Summary, payload).await?;
            services.usage.record(user_id, ResourceType::Summary, job_id.to_string());
            Ok(job_id)
        })
        .await;

    match queued {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "jobId": job_id.to_string() })),
        )
            .into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
