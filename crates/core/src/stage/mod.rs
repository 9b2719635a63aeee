//! Generic pipeline stage machinery.
//!
//! A [`PipelineStage`] watches its input cache, groups new records by date,
//! and fans each group out to every registered [`StageUnitProcessor`] on the
//! shared [`WorkerPool`]. Results land in the stage's output cache, which in
//! turn signals the next stage.

mod pipeline_stage;
mod pool;
mod traits;
mod types;

pub use pipeline_stage::{PipelineStage, StageImplementation, StageSettings};
pub use pool::{Pools, PoolStatus, WorkerPool};
pub use traits::{StageError, StageEventSink, StageUnitProcessor};
pub use types::{PipelineStageKind, RunState, RunStateCell, StageEvent, UnitContext};
