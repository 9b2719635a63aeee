//! Common test utilities for API testing with mocks.
//!
//! This module provides a test fixture that creates an in-process server
//! around a real orchestrator whose single plugin is backed by mocks.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use terrapipe_core::{
    config::DatabaseConfig,
    testing::{fixtures, MockDownloadFactory, MockUnitProcessor},
    Config, Orchestrator, OrchestratorConfig, SqlitePersistenceStore,
};
use terrapipe_server::api::WsBroadcaster;
use terrapipe_server::state::AppState;

/// Plugin registered in every fixture.
pub const PLUGIN: &str = "modis";

/// Test fixture with an in-process router.
///
/// The orchestrator never polls on its own; every mutating request runs one
/// pass, and tests call [`TestFixture::pass`] for more.
pub struct TestFixture {
    pub router: Router,
    pub orchestrator: Arc<Orchestrator>,
    /// Mock download source for [`PLUGIN`]
    pub factory: Arc<MockDownloadFactory>,
    pub processor: Arc<MockUnitProcessor>,
    pub ws_broadcaster: WsBroadcaster,
    /// Temporary directory for the database, downloads and project output
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
    pub text: String,
}

impl TestFixture {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let factory = Arc::new(MockDownloadFactory::new("modis:data", "data"));
        let processor = Arc::new(MockUnitProcessor::new("process"));
        let registry = fixtures::registry_with_processor(
            PLUGIN,
            Arc::clone(&factory),
            &["ndvi"],
            Arc::clone(&processor),
        );

        let config = Config {
            database: DatabaseConfig {
                path: db_path.clone(),
            },
            orchestrator: OrchestratorConfig {
                poll_interval_ms: 0,
                download_root: temp_dir.path().join("downloads"),
                ..Default::default()
            },
            ..Default::default()
        };

        let store = SqlitePersistenceStore::new(&db_path).expect("Failed to create store");
        let orchestrator = Orchestrator::new(
            config.orchestrator.clone(),
            Arc::new(store),
            Arc::new(registry),
        );
        orchestrator.start().expect("Failed to start orchestrator");

        let ws_broadcaster = WsBroadcaster::default();
        orchestrator.register_ui_observer(Arc::new(ws_broadcaster.clone()));

        let state = Arc::new(AppState::new(
            config,
            Arc::clone(&orchestrator),
            ws_broadcaster.clone(),
        ));
        let router = terrapipe_server::api::create_router(state);

        Self {
            router,
            orchestrator,
            factory,
            processor,
            ws_broadcaster,
            temp_dir,
        }
    }

    /// Descriptor JSON for a project using [`PLUGIN`].
    pub fn project(&self, name: &str) -> Value {
        json!({
            "name": name,
            "working_dir": self.temp_dir.path().join("projects"),
            "start_date": "2024-01-01",
            "plugins": [{ "name": PLUGIN, "indices": ["ndvi"] }]
        })
    }

    /// Run one processing pass.
    pub fn pass(&self) {
        self.orchestrator.update_state();
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a POST request without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None).await
    }

    pub async fn delete(&self, path: &str) -> TestResponse {
        self.request("DELETE", path, None).await
    }

    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        let request = request_builder.body(body).unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let text = String::from_utf8_lossy(&body_bytes).into_owned();
        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body, text }
    }
}

impl Drop for TestFixture {
    fn drop(&mut self) {
        self.orchestrator.close();
    }
}

/// Helper to assert a response has expected status.
#[macro_export]
macro_rules! assert_status {
    ($response:expr, $status:expr) => {
        assert_eq!(
            $response.status, $status,
            "Expected status {:?}, got {:?}. Body: {}",
            $status,
            $response.status,
            serde_json::to_string_pretty(&$response.body).unwrap_or_default()
        );
    };
}
