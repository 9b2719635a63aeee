//! Per-project pipeline wiring, progress accounting and status snapshots.

mod progress;
mod runner;
mod status;
mod types;

pub use progress::ProgressTracker;
pub use runner::{DownloaderProvider, ProjectScheduler, SchedulerDeps};
pub use status::StatusBoard;
pub use types::{
    PluginProgress, SchedulerError, SchedulerEvent, SchedulerStatus, StageProgress, StageWorkers,
};
