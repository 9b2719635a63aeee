//! Scheduler API handlers.
//!
//! Every mutating request runs one processing pass before answering, so the
//! response reflects the new state.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use terrapipe_core::{
    Orchestrator, OrchestratorError, ProjectDescriptor, SchedulerRef, SchedulerStatus,
};
use tracing::{info, warn};

use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Simple message response
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Result of a manual update.
#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    pub id: u32,
    /// Downloads newly loaded into the scheduler's caches.
    pub loaded: usize,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn not_found(name: &str) -> ApiError {
    error(StatusCode::NOT_FOUND, format!("Scheduler not found: {}", name))
}

/// Look a scheduler up by project name, then by numeric ID.
fn resolve(orchestrator: &Orchestrator, name: &str) -> Option<SchedulerStatus> {
    orchestrator
        .get_scheduler_status(name)
        .or_else(|| name.parse::<u32>().ok().and_then(|id| orchestrator.get_scheduler_status(id)))
}

/// Run `f` on a blocking thread; processing passes may take a while.
async fn blocking<T, F>(state: &Arc<AppState>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Orchestrator) -> Result<T, OrchestratorError> + Send + 'static,
{
    let orchestrator = Arc::clone(state.orchestrator());
    match tokio::task::spawn_blocking(move || f(&orchestrator)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(OrchestratorError::Closed)) => Err(error(
            StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Closed.to_string(),
        )),
        Ok(Err(e)) => Err(error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        Err(e) => Err(error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// List every live scheduler, ordered by ID
pub async fn list_schedulers(State(state): State<Arc<AppState>>) -> Json<Vec<SchedulerStatus>> {
    Json(state.orchestrator().get_scheduler_statuses())
}

/// Get one scheduler by name or ID
pub async fn get_scheduler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SchedulerStatus>, ApiError> {
    resolve(state.orchestrator(), &name)
        .map(Json)
        .ok_or_else(|| not_found(&name))
}

/// Create a scheduler from a project descriptor
pub async fn create_scheduler(
    State(state): State<Arc<AppState>>,
    Json(descriptor): Json<ProjectDescriptor>,
) -> Result<(StatusCode, Json<SchedulerStatus>), ApiError> {
    descriptor
        .validate()
        .map_err(|e| error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let unknown = descriptor
        .plugin_names()
        .into_iter()
        .find(|p| !state.orchestrator().registry().contains(p));
    if let Some(plugin) = unknown {
        return Err(error(
            StatusCode::BAD_REQUEST,
            format!("Unknown plugin: {}", plugin),
        ));
    }

    let name = descriptor.name.clone();
    if state.orchestrator().get_scheduler_status(name.as_str()).is_some() {
        return Err(error(
            StatusCode::CONFLICT,
            format!("Scheduler already exists: {}", name),
        ));
    }

    let lookup = name.clone();
    let status = blocking(&state, move |orchestrator| {
        orchestrator.request_new_scheduler(descriptor, true)?;
        Ok(orchestrator.get_scheduler_status(lookup))
    })
    .await?;

    match status {
        Some(status) => {
            info!(project = %name, id = status.id, "Scheduler created via API");
            Ok((StatusCode::CREATED, Json(status)))
        }
        None => {
            warn!(project = %name, "Scheduler could not be constructed");
            Err(error(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Scheduler could not be created: {}", name),
            ))
        }
    }
}

/// Start a stopped scheduler
pub async fn start_scheduler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SchedulerStatus>, ApiError> {
    let id = resolve(state.orchestrator(), &name)
        .ok_or_else(|| not_found(&name))?
        .id;
    let status = blocking(&state, move |orchestrator| {
        orchestrator.request_start(id, true)?;
        Ok(orchestrator.get_scheduler_status(id))
    })
    .await?;
    status.map(Json).ok_or_else(|| not_found(&name))
}

/// Stop a running scheduler, keeping its caches
pub async fn stop_scheduler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SchedulerStatus>, ApiError> {
    let id = resolve(state.orchestrator(), &name)
        .ok_or_else(|| not_found(&name))?
        .id;
    let status = blocking(&state, move |orchestrator| {
        orchestrator.request_stop(id, true)?;
        Ok(orchestrator.get_scheduler_status(id))
    })
    .await?;
    status.map(Json).ok_or_else(|| not_found(&name))
}

/// Run a scheduler's update now
pub async fn update_scheduler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<UpdateResponse>, ApiError> {
    let id = resolve(state.orchestrator(), &name)
        .ok_or_else(|| not_found(&name))?
        .id;
    let loaded = blocking(&state, move |orchestrator| {
        Ok(orchestrator.attempt_update(SchedulerRef::Id(id)))
    })
    .await?;
    loaded
        .map(|loaded| Json(UpdateResponse { id, loaded }))
        .ok_or_else(|| not_found(&name))
}

/// Delete a scheduler and release its resources
pub async fn delete_scheduler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let id = resolve(state.orchestrator(), &name)
        .ok_or_else(|| not_found(&name))?
        .id;
    blocking(&state, move |orchestrator| orchestrator.request_delete(id, true)).await?;
    info!(scheduler = %name, id, "Scheduler deleted via API");
    Ok(Json(MessageResponse {
        message: format!("Scheduler {} deleted", name),
    }))
}
