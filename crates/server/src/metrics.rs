//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the terrapipe daemon:
//! - HTTP request metrics (latency, counts)
//! - WebSocket connection metrics
//! - Scheduler, downloader and pool status (collected dynamically)

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use terrapipe_core::RunState;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "terrapipe_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("terrapipe_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "terrapipe_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// WebSocket Metrics
// =============================================================================

pub static WS_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "terrapipe_ws_connections_active",
        "Number of active WebSocket connections",
    )
    .unwrap()
});

pub static WS_CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "terrapipe_ws_connections_total",
        "Total WebSocket connections since startup",
    )
    .unwrap()
});

/// WebSocket messages sent by type.
pub static WS_MESSAGES_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("terrapipe_ws_messages_sent_total", "WebSocket messages sent"),
        &["type"],
    )
    .unwrap()
});

/// WebSocket lag events (when client falls behind).
pub static WS_LAG_EVENTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "terrapipe_ws_lag_events_total",
        "WebSocket lag events (client fell behind)",
    )
    .unwrap()
});

// =============================================================================
// Orchestrator Metrics (collected dynamically)
// =============================================================================

/// Schedulers by lifecycle state.
pub static SCHEDULERS_BY_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("terrapipe_schedulers", "Live schedulers by state"),
        &["state"],
    )
    .unwrap()
});

pub static SHARED_DOWNLOADERS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "terrapipe_shared_downloaders",
        "Number of live shared download resources",
    )
    .unwrap()
});

/// Running tasks per pool ("workers", "downloads").
pub static POOL_ACTIVE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("terrapipe_pool_active_jobs", "Running tasks per pool"),
        &["pool"],
    )
    .unwrap()
});

/// Queued tasks per pool.
pub static POOL_QUEUED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("terrapipe_pool_queued_jobs", "Queued tasks per pool"),
        &["pool"],
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // WebSocket
    registry
        .register(Box::new(WS_CONNECTIONS_ACTIVE.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_CONNECTIONS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_MESSAGES_SENT.clone()))
        .unwrap();
    registry.register(Box::new(WS_LAG_EVENTS.clone())).unwrap();

    // Orchestrator
    registry
        .register(Box::new(SCHEDULERS_BY_STATE.clone()))
        .unwrap();
    registry
        .register(Box::new(SHARED_DOWNLOADERS.clone()))
        .unwrap();
    registry.register(Box::new(POOL_ACTIVE.clone())).unwrap();
    registry.register(Box::new(POOL_QUEUED.clone())).unwrap();

    // Core metrics (stages, caches, downloads, requests)
    for metric in terrapipe_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Refresh gauges from the orchestrator before encoding.
pub fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let orchestrator = state.orchestrator();

    let statuses = orchestrator.get_scheduler_statuses();
    for (label, run_state) in [
        ("stopped", RunState::Stopped),
        ("starting", RunState::Starting),
        ("running", RunState::Running),
    ] {
        let count = statuses.iter().filter(|s| s.state == run_state).count();
        SCHEDULERS_BY_STATE
            .with_label_values(&[label])
            .set(count as i64);
    }

    let status = orchestrator.status();
    SHARED_DOWNLOADERS.set(status.shared_downloaders as i64);
    for pool in [status.workers, status.downloads].into_iter().flatten() {
        POOL_ACTIVE
            .with_label_values(&[&pool.name])
            .set(pool.active_jobs as i64);
        POOL_QUEUED
            .with_label_values(&[&pool.name])
            .set(pool.queued_jobs as i64);
    }
}

static NUMERIC_SEGMENT: Lazy<regex_lite::Regex> =
    Lazy::new(|| regex_lite::Regex::new(r"/\d+(/|$)").unwrap());

/// Normalize a path for metric labels.
///
/// Scheduler names are free-form, so any segment after `/schedulers/`
/// collapses to `{name}`; remaining numeric segments become `{id}`.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = path.split('/').collect();
    for i in 1..segments.len() {
        if segments[i - 1] == "schedulers" && !segments[i].is_empty() {
            segments[i] = "{name}";
        }
    }
    let joined = segments.join("/");
    NUMERIC_SEGMENT.replace_all(&joined, "/{id}$1").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_scheduler_name() {
        assert_eq!(
            normalize_path("/api/v1/schedulers/amhara"),
            "/api/v1/schedulers/{name}"
        );
        assert_eq!(
            normalize_path("/api/v1/schedulers/amhara/start"),
            "/api/v1/schedulers/{name}/start"
        );
    }

    #[test]
    fn test_normalize_path_numeric() {
        assert_eq!(normalize_path("/api/v1/items/42"), "/api/v1/items/{id}");
    }

    #[test]
    fn test_normalize_path_static() {
        assert_eq!(normalize_path("/api/v1/schedulers"), "/api/v1/schedulers");
        assert_eq!(normalize_path("/api/v1/health"), "/api/v1/health");
        assert_eq!(normalize_path("/metrics"), "/metrics");
    }

    #[test]
    fn test_encode_metrics_includes_core_metrics() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/api/v1/health", "200"])
            .inc();
        terrapipe_core::metrics::FILES_DOWNLOADED.inc_by(0);
        let text = encode_metrics();
        assert!(text.contains("terrapipe_http_requests_total"));
        assert!(text.contains("terrapipe_files_downloaded_total"));
    }
}
