//! Testing utilities and mock collaborators.
//!
//! The mocks replace upstream sources and external programs so whole
//! pipelines can run inside a temporary directory.
//!
//! # Example
//!
//! ```rust,ignore
//! use terrapipe_core::testing::{fixtures, MockDownloadFactory};
//!
//! let factory = Arc::new(MockDownloadFactory::new("modis:data", "data"));
//! factory.lister.set_days(2024, 1..=10);
//!
//! let registry = fixtures::registry("modis", factory.clone(), &["ndvi"]);
//! let descriptor = fixtures::descriptor("amhara", tmp.path(), "modis", &["ndvi"]);
//! ```

mod mock_download;
mod mock_observer;
mod mock_processor;

pub use mock_download::{MockDownloadFactory, MockDownloader, MockLister};
pub use mock_observer::RecordingObserver;
pub use mock_processor::MockUnitProcessor;

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::NaiveDate;

    use super::{MockDownloadFactory, MockUnitProcessor};
    use crate::cache::{CachedFileRecord, DateKey};
    use crate::project::{DateRange, ProjectDescriptor};
    use crate::registry::{PluginDefinition, PluginMetadata, PluginRegistry};
    use crate::stage::{PipelineStageKind, StageUnitProcessor};

    /// Create a record with a path derived from its identity.
    pub fn record(data_name: &str, date: DateKey, stage: PipelineStageKind) -> CachedFileRecord {
        CachedFileRecord::new(
            data_name,
            format!("/data/{}/{}/{}.tif", stage, date, data_name),
            date,
            stage,
        )
    }

    /// A project starting 2024-01-01 with one plugin.
    pub fn descriptor(name: &str, working_dir: &Path, plugin: &str, indices: &[&str]) -> ProjectDescriptor {
        ProjectDescriptor::new(name, working_dir, start_date())
            .with_plugin(plugin, indices.iter().copied())
    }

    pub fn start_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    /// Open-ended range starting on the given day.
    pub fn open_range(year: i32, day_of_year: u32) -> DateRange {
        DateRange {
            start: DateKey::new(year, day_of_year),
            end: None,
        }
    }

    /// A registry with one plugin backed by mocks: one download source, a
    /// `process` processor, one index processor per name and a summary.
    pub fn registry(plugin: &str, factory: Arc<MockDownloadFactory>, indices: &[&str]) -> PluginRegistry {
        registry_with_processor(
            plugin,
            factory,
            indices,
            Arc::new(MockUnitProcessor::new("process")),
        )
    }

    /// Like [`registry`], with a processor the caller keeps a handle to.
    pub fn registry_with_processor(
        plugin: &str,
        factory: Arc<MockDownloadFactory>,
        indices: &[&str],
        processor: Arc<MockUnitProcessor>,
    ) -> PluginRegistry {
        let process_name = processor.name().to_string();
        let mut definition = PluginDefinition::new(PluginMetadata::new(plugin))
            .with_download(factory)
            .with_processor(process_name, move |_ctx| {
                Ok(Arc::clone(&processor) as Arc<dyn StageUnitProcessor>)
            })
            .with_summary(|_ctx| {
                Ok(Arc::new(MockUnitProcessor::new("summary")) as Arc<dyn StageUnitProcessor>)
            });
        for index in indices {
            let name = index.to_string();
            definition = definition.with_index(*index, move |_ctx| {
                Ok(Arc::new(MockUnitProcessor::new(name.clone())) as Arc<dyn StageUnitProcessor>)
            });
        }

        let mut registry = PluginRegistry::new();
        registry
            .register(definition)
            .expect("fresh registry accepts the plugin");
        registry
    }

    /// Poll `condition` until it holds or `timeout` elapses.
    pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
