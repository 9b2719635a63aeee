//! Process-wide manager of worker pools, schedulers and shared downloaders.
//!
//! Every structural change goes through a queue of [`PendingRequest`]s that
//! one processing-loop pass drains at a time:
//! - **Create**: build and start requested schedulers
//! - **Stop / Delete / Start**: FIFO per queue, skipped in create-only passes
//! - **Downloaders**: release, stop or restart shared downloaders by reference
//! - **Observers**: one coalesced status batch per pass

mod config;
mod ids;
mod observer;
mod runner;
mod types;

pub use config::OrchestratorConfig;
pub use ids::IdAllocator;
pub use observer::{ObserverId, UiObserver};
pub use runner::Orchestrator;
pub use types::{OrchestratorError, OrchestratorStatus, PendingRequest, ResourceId, SchedulerRef};
