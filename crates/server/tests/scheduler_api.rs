//! Scheduler API tests.
//!
//! These run the router in-process against a real orchestrator whose plugin
//! is backed by mocks (see `common`).

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use common::TestFixture;
use terrapipe_core::testing::fixtures;
use terrapipe_server::api::WsMessage;

#[tokio::test]
async fn test_health() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/health").await;

    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["status"], "ok");
}

#[tokio::test]
async fn test_status_of_empty_orchestrator() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/status").await;

    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["started"], true);
    assert_eq!(response.body["closed"], false);
    assert_eq!(response.body["schedulers"], 0);
    assert_eq!(response.body["shared_downloaders"], 0);
}

#[tokio::test]
async fn test_create_and_get_scheduler() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post("/api/v1/schedulers", fixture.project("amhara"))
        .await;
    assert_status!(response, StatusCode::CREATED);
    assert_eq!(response.body["id"], 0);
    assert_eq!(response.body["project_name"], "amhara");
    assert_eq!(response.body["plugins"][0]["plugin"], "modis");

    let by_name = fixture.get("/api/v1/schedulers/amhara").await;
    assert_status!(by_name, StatusCode::OK);
    assert_eq!(by_name.body["id"], 0);

    let by_id = fixture.get("/api/v1/schedulers/0").await;
    assert_status!(by_id, StatusCode::OK);
    assert_eq!(by_id.body["project_name"], "amhara");

    let list = fixture.get("/api/v1/schedulers").await;
    assert_status!(list, StatusCode::OK);
    assert_eq!(list.body.as_array().map(Vec::len), Some(1));

    let status = fixture.get("/api/v1/status").await;
    assert_eq!(status.body["schedulers"], 1);
    assert_eq!(status.body["shared_downloaders"], 1);
}

#[tokio::test]
async fn test_create_duplicate_is_conflict() {
    let fixture = TestFixture::new().await;

    let first = fixture
        .post("/api/v1/schedulers", fixture.project("amhara"))
        .await;
    assert_status!(first, StatusCode::CREATED);

    let second = fixture
        .post("/api/v1/schedulers", fixture.project("amhara"))
        .await;
    assert_status!(second, StatusCode::CONFLICT);
    assert!(second.body["error"].as_str().unwrap().contains("amhara"));
    assert_eq!(fixture.orchestrator.number_of_schedulers(), 1);
}

#[tokio::test]
async fn test_create_rejects_unknown_plugin() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post(
            "/api/v1/schedulers",
            json!({
                "name": "amhara",
                "working_dir": fixture.temp_dir.path(),
                "start_date": "2024-01-01",
                "plugins": [{ "name": "landsat" }]
            }),
        )
        .await;

    assert_status!(response, StatusCode::BAD_REQUEST);
    assert!(response.body["error"].as_str().unwrap().contains("landsat"));
    assert_eq!(fixture.orchestrator.number_of_schedulers(), 0);
}

#[tokio::test]
async fn test_create_rejects_invalid_descriptor() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post(
            "/api/v1/schedulers",
            json!({
                "name": "amhara",
                "working_dir": fixture.temp_dir.path(),
                "start_date": "2024-01-01",
                "plugins": []
            }),
        )
        .await;

    assert_status!(response, StatusCode::BAD_REQUEST);
    assert_eq!(fixture.orchestrator.number_of_schedulers(), 0);
}

#[tokio::test]
async fn test_unknown_scheduler_is_not_found() {
    let fixture = TestFixture::new().await;

    assert_status!(
        fixture.get("/api/v1/schedulers/nowhere").await,
        StatusCode::NOT_FOUND
    );
    assert_status!(
        fixture.post_empty("/api/v1/schedulers/nowhere/stop").await,
        StatusCode::NOT_FOUND
    );
    assert_status!(
        fixture.post_empty("/api/v1/schedulers/nowhere/update").await,
        StatusCode::NOT_FOUND
    );
    assert_status!(
        fixture.delete("/api/v1/schedulers/nowhere").await,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_stop_and_start() {
    let fixture = TestFixture::new().await;
    fixture
        .post("/api/v1/schedulers", fixture.project("amhara"))
        .await;

    let stopped = fixture.post_empty("/api/v1/schedulers/amhara/stop").await;
    assert_status!(stopped, StatusCode::OK);
    assert_eq!(stopped.body["state"], "stopped");

    let started = fixture.post_empty("/api/v1/schedulers/amhara/start").await;
    assert_status!(started, StatusCode::OK);
    assert_ne!(started.body["state"], "stopped");
}

#[tokio::test]
async fn test_manual_update() {
    let fixture = TestFixture::new().await;
    fixture
        .post("/api/v1/schedulers", fixture.project("amhara"))
        .await;

    let response = fixture.post_empty("/api/v1/schedulers/amhara/update").await;

    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["id"], 0);
    assert!(response.body["loaded"].is_u64());
}

#[tokio::test]
async fn test_delete_releases_scheduler_and_downloader() {
    let fixture = TestFixture::new().await;
    fixture
        .post("/api/v1/schedulers", fixture.project("amhara"))
        .await;

    let response = fixture.delete("/api/v1/schedulers/amhara").await;
    assert_status!(response, StatusCode::OK);

    assert_status!(
        fixture.get("/api/v1/schedulers/amhara").await,
        StatusCode::NOT_FOUND
    );
    let status = fixture.get("/api/v1/status").await;
    assert_eq!(status.body["schedulers"], 0);
    assert_eq!(status.body["shared_downloaders"], 0);
}

#[tokio::test]
async fn test_progress_reported_through_api() {
    let fixture = TestFixture::new().await;
    fixture.factory.lister.set_days(2024, 1..=3);

    let response = fixture
        .post("/api/v1/schedulers", fixture.project("amhara"))
        .await;
    assert_status!(response, StatusCode::CREATED);

    let orchestrator = &fixture.orchestrator;
    assert!(
        fixtures::wait_until(Duration::from_secs(5), || {
            orchestrator
                .get_scheduler_status("amhara")
                .map(|s| s.plugins[0].index.produced == 3)
                .unwrap_or(false)
        })
        .await
    );

    let response = fixture.get("/api/v1/schedulers/amhara").await;
    let plugin = &response.body["plugins"][0];
    assert_eq!(plugin["download"]["data"]["produced"], 3);
    assert_eq!(plugin["process"]["produced"], 3);
    assert_eq!(plugin["index"]["produced"], 3);
}

#[tokio::test]
async fn test_status_batches_reach_websocket_broadcaster() {
    let fixture = TestFixture::new().await;
    let mut rx = fixture.ws_broadcaster.subscribe();

    fixture
        .post("/api/v1/schedulers", fixture.project("amhara"))
        .await;

    let mut seen = false;
    while let Ok(msg) = rx.try_recv() {
        if let WsMessage::StatusBatch { statuses } = msg {
            seen |= statuses.iter().any(|s| s.project_name == "amhara");
        }
    }
    assert!(seen);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let fixture = TestFixture::new().await;
    fixture
        .post("/api/v1/schedulers", fixture.project("amhara"))
        .await;

    let response = fixture.get("/metrics").await;

    assert_status!(response, StatusCode::OK);
    assert!(response.text.contains("terrapipe_schedulers"));
    assert!(response.text.contains("terrapipe_shared_downloaders"));
    assert!(response.text.contains("terrapipe_scheduler_requests_total"));
}
