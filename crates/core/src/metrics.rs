//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Stage work units (counts, durations)
//! - Cache writes
//! - Shared downloader polls and downloaded files
//! - Orchestrator requests

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Stages
// =============================================================================

/// Work units finished, by stage and result.
pub static STAGE_UNITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("terrapipe_stage_units_total", "Total stage work units"),
        &["stage", "result"], // "success", "failure"
    )
    .unwrap()
});

/// Duration of one collaborator invocation.
pub static STAGE_UNIT_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "terrapipe_stage_unit_duration_seconds",
            "Duration of a single stage work unit",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
        &["stage"],
    )
    .unwrap()
});

// =============================================================================
// Caches
// =============================================================================

/// Rows inserted or changed, by stage.
pub static CACHE_WRITES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("terrapipe_cache_writes_total", "Cache rows inserted or changed"),
        &["stage"],
    )
    .unwrap()
});

// =============================================================================
// Shared downloaders
// =============================================================================

/// Downloader polls, by result.
pub static DOWNLOAD_POLLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("terrapipe_download_polls_total", "Shared downloader polls"),
        &["result"], // "success", "failure", "skipped"
    )
    .unwrap()
});

/// Files fetched by shared downloaders.
pub static FILES_DOWNLOADED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "terrapipe_files_downloaded_total",
        "Files fetched by shared downloaders",
    )
    .unwrap()
});

// =============================================================================
// Orchestrator
// =============================================================================

/// Requests drained by the processing loop, by kind.
pub static SCHEDULER_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "terrapipe_scheduler_requests_total",
            "Scheduler lifecycle requests processed",
        ),
        &["kind"], // "create", "start", "stop", "delete"
    )
    .unwrap()
});

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Stages
        Box::new(STAGE_UNITS.clone()),
        Box::new(STAGE_UNIT_DURATION.clone()),
        // Caches
        Box::new(CACHE_WRITES.clone()),
        // Downloads
        Box::new(DOWNLOAD_POLLS.clone()),
        Box::new(FILES_DOWNLOADED.clone()),
        // Orchestrator
        Box::new(SCHEDULER_REQUESTS.clone()),
    ]
}
