use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    response::IntoResponse,
    Json,
};

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::UserContext;

/// Poll a job by id or by its `completed:<resultId>` reference.
pub async fn job_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(handle): Path<String>,
) -> axum::response::Response {
    match services.pipeline.status().resolve(&handle, user.user_id()).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
