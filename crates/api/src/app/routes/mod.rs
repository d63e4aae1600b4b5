use axum::{
    routing::{delete, get, post},
    Router,
};

pub mod articles;
pub mod jobs;
pub mod summaries;
pub mod system;

/// Router for all user-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/summaries", post(summaries::create_summary))
        .route("/articles", post(articles::create_article))
        .route("/articles/:id", delete(articles::delete_article))
        .route("/jobs/:job_id", get(jobs::job_status))
}
