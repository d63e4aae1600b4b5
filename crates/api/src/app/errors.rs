use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use serde_json::json;

use scribe_infra::PipelineError;

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        PipelineError::QuotaExceeded {
            resource,
            limit,
            current,
        } => (
            StatusCode::FORBIDDEN,
            axum::Json(json!({
                "error": "quota_exceeded",
                "message": message,
                "resource": resource,
                "limit": limit,
                "current": current,
            })),
        )
            .into_response(),
        PipelineError::LockUnavailable { .. } => {
            let mut res = json_error(StatusCode::CONFLICT, "resource_busy", message);
            res.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
            res
        }
        PipelineError::JobNotFound => json_error(StatusCode::NOT_FOUND, "not_found", message),
        PipelineError::Validation(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        PipelineError::StoreUnavailable(_) => {
            tracing::warn!(error = %message, "request denied: backing store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", "service temporarily unavailable")
        }
        PipelineError::JobTimeout { .. } => json_error(StatusCode::INTERNAL_SERVER_ERROR, "job_timeout", message),
        PipelineError::JobFailed { .. } => json_error(StatusCode::INTERNAL_SERVER_ERROR, "job_failed", message),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
