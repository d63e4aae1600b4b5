use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use scribe_core::{ArticleId, ResourceType};

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::UserContext;

pub async fn create_article(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<dto::CreateArticleRequest>,
) -> axum::response::Response {
    if let Err(e) = body.validate() {
        return errors::pipeline_error_to_response(e);
    }

    let user_id = user.user_id();
    let saved = services
        .pipeline
        .quota()
        .consume(user_id, ResourceType::Article, || async {
            let id = ArticleId::new();
            services.usage.record(user_id, ResourceType::Article, id.to_string());
            Ok(id)
        })
        .await;

    match saved {
        Ok(id) => {
            tracing::info!(user_id = %user_id, article_id = %id, "article saved");
            (
                StatusCode::CREATED,
                Json(serde_json::json!({
                    "id": id.to_string(),
                    "title": body.title,
                    "url": body.url,
                })),
            )
                .into_response()
        }
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// Deleting an unknown article is not an error.
pub async fn delete_article(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(article_id) = id.parse::<ArticleId>() else {
        return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid article id");
    };

    let user_id = user.user_id();
    let removed = services
        .pipeline
        .quota()
        .release(user_id, ResourceType::Article, || async {
            Ok(services
                .usage
                .remove(user_id, ResourceType::Article, &article_id.to_string()))
        })
        .await;

    match removed {
        Ok(existed) => {
            tracing::info!(user_id = %user_id, article_id = %article_id, existed, "article deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
