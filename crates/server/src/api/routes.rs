use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::{handlers, middleware::metrics_middleware, schedulers, ws};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Health and orchestrator status
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::get_status))
        // Schedulers
        .route(
            "/schedulers",
            get(schedulers::list_schedulers).post(schedulers::create_scheduler),
        )
        .route(
            "/schedulers/{name}",
            get(schedulers::get_scheduler).delete(schedulers::delete_scheduler),
        )
        .route("/schedulers/{name}/start", post(schedulers::start_scheduler))
        .route("/schedulers/{name}/stop", post(schedulers::stop_scheduler))
        .route("/schedulers/{name}/update", post(schedulers::update_scheduler))
        // Live status stream
        .route("/ws", get(ws::ws_handler));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
}
