use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;

use scribe_api::app::services::{in_memory_services, AppServices};
use scribe_core::{ArticleId, UserId};
use scribe_infra::{Collaborators, PipelineConfig, PipelineRuntime};

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
    runtime: Option<PipelineRuntime>,
}

impl TestServer {
    async fn spawn() -> Self {
        let mut config = PipelineConfig::default();
        // Polls must see state changes immediately.
        config.cache_in_flight = false;
        config.queues = config
            .queues
            .map_all(|q| q.with_poll_interval(Duration::from_millis(10)));

        let services = Arc::new(in_memory_services(config));
        let runtime = services.pipeline.start(Collaborators::default());

        // Build app (same router as prod), but bind to an ephemeral port.
        let app = scribe_api::app::build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            handle,
            runtime: Some(runtime),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        if let Some(runtime) = self.runtime.take() {
            tokio::spawn(runtime.shutdown());
        }
    }
}

async fn create_article(client: &reqwest::Client, srv: &TestServer, user: UserId) -> reqwest::Response {
    client
        .post(srv.url("/articles"))
        .header("x-user-id", user.to_string())
        .json(&json!({ "title": "On queues", "url": "https://example.org/queues" }))
        .send()
        .await
        .unwrap()
}

async fn request_summary(client: &reqwest::Client, srv: &TestServer, user: UserId, text: &str) -> reqwest::Response {
    client
        .post(srv.url("/summaries"))
        .header("x-user-id", user.to_string())
        .json(&json!({ "articleId": ArticleId::new(), "text": text }))
        .send()
        .await
        .unwrap()
}

async fn poll_until_terminal(client: &reqwest::Client, srv: &TestServer, user: UserId, handle: &str) -> serde_json::Value {
    for _ in 0..300 {
        let res = client
            .get(srv.url(&format!("/jobs/{handle}")))
            .header("x-user-id", user.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = res.json().await.unwrap();
        if body["status"] == "completed" || body["status"] == "failed" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {handle} did not finish within timeout");
}

#[tokio::test]
async fn health_needs_no_user() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn user_header_required_for_protected_endpoints() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/jobs/anything")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(srv.url("/articles"))
        .header("x-user-id", "not-a-user")
        .json(&json!({ "title": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn summary_lifecycle_enqueue_poll_stable_ref() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let user = UserId::new();

    let res = request_summary(&client, &srv, user, "Queues decouple work. Workers drain them. Done.").await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let done = poll_until_terminal(&client, &srv, user, &job_id).await;
    assert_eq!(done["status"], "completed");
    assert_eq!(done["result"]["summary"], "Queues decouple work. Workers drain them. Done.");
    let stable = done["stableRef"].as_str().unwrap().to_string();
    assert!(stable.starts_with("completed:"));

    // The stable reference resolves on its own, for the owner only.
    let res = client
        .get(srv.url(&format!("/jobs/{stable}")))
        .header("x-user-id", user.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    for handle in [&job_id, &stable] {
        let res = client
            .get(srv.url(&format!("/jobs/{handle}")))
            .header("x-user-id", UserId::new().to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for handle in ["nope", "completed:nope", "0190a1b2-0000-7000-8000-000000000000"] {
        let res = client
            .get(srv.url(&format!("/jobs/{handle}")))
            .header("x-user-id", UserId::new().to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND, "{handle}");
    }
}

#[tokio::test]
async fn empty_text_is_rejected_before_enqueue() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let user = UserId::new();

    let res = request_summary(&client, &srv, user, "   ").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn free_plan_article_quota_is_enforced_and_released_by_delete() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let user = UserId::new();

    let mut ids = Vec::new();
    for _ in 0..10 {
        let res = create_article(&client, &srv, user).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let body: serde_json::Value = res.json().await.unwrap();
        ids.push(body["id"].as_str().unwrap().to_string());
    }

    let res = create_article(&client, &srv, user).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "quota_exceeded");
    assert_eq!(body["resource"], "article");
    assert_eq!(body["limit"], 10);
    assert_eq!(body["current"], 10);

    let res = client
        .delete(srv.url(&format!("/articles/{}", ids[0])))
        .header("x-user-id", user.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    // Deleting again is a no-op.
    let res = client
        .delete(srv.url(&format!("/articles/{}", ids[0])))
        .header("x-user-id", user.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = create_article(&client, &srv, user).await;
    assert_eq!(res.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn concurrent_saves_at_nine_of_ten_admit_exactly_one() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let user = UserId::new();
    srv.services
        .usage
        .seed(user, scribe_core::ResourceType::Article, 9);

    let (a, b) = tokio::join!(
        create_article(&client, &srv, user),
        create_article(&client, &srv, user)
    );
    let mut statuses = [a.status(), b.status()];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::CREATED, StatusCode::FORBIDDEN]);
}

#[tokio::test]
async fn summary_quota_counts_requests() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let user = UserId::new();

    for _ in 0..5 {
        let res = request_summary(&client, &srv, user, "One sentence.").await;
        assert_eq!(res.status(), StatusCode::ACCEPTED);
    }
    let res = request_summary(&client, &srv, user, "One sentence.").await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}
