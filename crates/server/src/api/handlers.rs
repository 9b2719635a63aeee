use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use terrapipe_core::OrchestratorStatus;

use crate::metrics::{collect_dynamic_metrics, encode_metrics};
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<OrchestratorStatus> {
    Json(state.orchestrator().status())
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    collect_dynamic_metrics(&state);
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        encode_metrics(),
    )
}
