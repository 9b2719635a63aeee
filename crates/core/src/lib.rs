pub mod builtin;
pub mod cache;
pub mod config;
pub mod download;
pub mod metrics;
pub mod orchestrator;
pub mod project;
pub mod registry;
pub mod scheduler;
pub mod stage;
pub mod testing;

pub use builtin::registry_from_config;
pub use cache::{
    CacheObserver, CachedFileRecord, DateKey, IncrementalCache, PersistenceStore, RecordQuery,
    SqlitePersistenceStore, StoreError,
};
pub use config::{
    config_path, load_config, load_config_from_str, validate_config, Config, ConfigError,
    ConfigProvider,
};
pub use download::{DownloadError, DownloadFactory, SharedDownloadResource, SourceId};
pub use orchestrator::{
    ObserverId, Orchestrator, OrchestratorConfig, OrchestratorError, OrchestratorStatus,
    SchedulerRef, UiObserver,
};
pub use project::{CompositionStrategy, DateRange, ProjectDescriptor, SummaryDefinition};
pub use registry::{PluginDefinition, PluginMetadata, PluginRegistry, RegistryError};
pub use scheduler::{
    PluginProgress, ProjectScheduler, SchedulerError, SchedulerStatus, StageProgress,
};
pub use stage::{PipelineStageKind, RunState, StageError, StageUnitProcessor, UnitContext};
