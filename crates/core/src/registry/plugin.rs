use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::download::DownloadFactory;
use crate::project::{ProjectDescriptor, ProjectLayout, ProjectPlugin};
use crate::stage::{PipelineStageKind, StageImplementation, StageUnitProcessor};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("plugin {plugin} has no index named {index}")]
    UnknownIndex { plugin: String, index: String },

    #[error("plugin {plugin} has no {stage} collaborator")]
    MissingCollaborator {
        plugin: String,
        stage: PipelineStageKind,
    },

    #[error("plugin {0} is already registered")]
    Duplicate(String),

    #[error("failed to build collaborator: {0}")]
    Factory(String),
}

/// Static facts about a plugin used for progress estimates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    /// Days covered by one upstream input (1 for daily products).
    #[serde(default = "default_one")]
    pub days_per_input: u32,
    /// Files per date produced by the process stage.
    #[serde(default = "default_one")]
    pub process_outputs_per_day: u32,
}

fn default_one() -> u32 {
    1
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            days_per_input: 1,
            process_outputs_per_day: 1,
        }
    }

    pub fn with_days_per_input(mut self, days: u32) -> Self {
        self.days_per_input = days.max(1);
        self
    }

    pub fn with_process_outputs_per_day(mut self, outputs: u32) -> Self {
        self.process_outputs_per_day = outputs;
        self
    }
}

/// What a factory sees when building a collaborator for one project.
pub struct FactoryContext<'a> {
    pub project: &'a ProjectDescriptor,
    pub plugin: &'a ProjectPlugin,
    pub layout: &'a ProjectLayout,
}

/// Builds one stage collaborator for a project.
pub type ProcessorFactory = Arc<
    dyn Fn(&FactoryContext<'_>) -> Result<Arc<dyn StageUnitProcessor>, RegistryError> + Send + Sync,
>;

/// Everything the registry knows about one plugin.
#[derive(Clone)]
pub struct PluginDefinition {
    pub metadata: PluginMetadata,
    downloads: Vec<Arc<dyn DownloadFactory>>,
    processors: Vec<(String, ProcessorFactory)>,
    indices: BTreeMap<String, ProcessorFactory>,
    summary: Option<ProcessorFactory>,
}

impl fmt::Debug for PluginDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDefinition")
            .field("metadata", &self.metadata)
            .field(
                "downloads",
                &self.downloads.iter().map(|d| d.source_id()).collect::<Vec<_>>(),
            )
            .field(
                "processors",
                &self.processors.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .field("indices", &self.indices.keys().collect::<Vec<_>>())
            .field("summary", &self.summary.is_some())
            .finish()
    }
}

impl PluginDefinition {
    pub fn new(metadata: PluginMetadata) -> Self {
        Self {
            metadata,
            downloads: Vec::new(),
            processors: Vec::new(),
            indices: BTreeMap::new(),
            summary: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Add an upstream source. The first one is the primary `data` source.
    pub fn with_download(mut self, factory: Arc<dyn DownloadFactory>) -> Self {
        self.downloads.push(factory);
        self
    }

    pub fn with_processor<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&FactoryContext<'_>) -> Result<Arc<dyn StageUnitProcessor>, RegistryError>
            + Send
            + Sync
            + 'static,
    {
        self.processors.push((name.into(), Arc::new(factory)));
        self
    }

    pub fn with_index<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&FactoryContext<'_>) -> Result<Arc<dyn StageUnitProcessor>, RegistryError>
            + Send
            + Sync
            + 'static,
    {
        self.indices.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn with_summary<F>(mut self, factory: F) -> Self
    where
        F: Fn(&FactoryContext<'_>) -> Result<Arc<dyn StageUnitProcessor>, RegistryError>
            + Send
            + Sync
            + 'static,
    {
        self.summary = Some(Arc::new(factory));
        self
    }

    pub fn downloads(&self) -> &[Arc<dyn DownloadFactory>] {
        &self.downloads
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indices.keys().cloned().collect()
    }

    /// Data names a date needs before the process stage may run it.
    pub fn required_data_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .downloads
            .iter()
            .map(|d| d.data_name().to_string())
            .collect();
        names.dedup();
        names
    }

    pub fn build_processors(
        &self,
        ctx: &FactoryContext<'_>,
    ) -> Result<Vec<StageImplementation>, RegistryError> {
        if self.processors.is_empty() {
            return Err(RegistryError::MissingCollaborator {
                plugin: self.metadata.name.clone(),
                stage: PipelineStageKind::Process,
            });
        }
        self.processors
            .iter()
            .map(|(name, factory)| Ok(StageImplementation::new(name.clone(), factory(ctx)?)))
            .collect()
    }

    /// One implementation per index the project selected for this plugin.
    pub fn build_indices(
        &self,
        ctx: &FactoryContext<'_>,
    ) -> Result<Vec<StageImplementation>, RegistryError> {
        ctx.plugin
            .indices
            .iter()
            .map(|index| {
                let factory =
                    self.indices
                        .get(index)
                        .ok_or_else(|| RegistryError::UnknownIndex {
                            plugin: self.metadata.name.clone(),
                            index: index.clone(),
                        })?;
                Ok(StageImplementation::new(index.clone(), factory(ctx)?))
            })
            .collect()
    }

    /// One implementation per summary the project defines.
    pub fn build_summaries(
        &self,
        ctx: &FactoryContext<'_>,
    ) -> Result<Vec<StageImplementation>, RegistryError> {
        if ctx.project.summaries.is_empty() {
            return Ok(Vec::new());
        }
        let factory = self
            .summary
            .as_ref()
            .ok_or_else(|| RegistryError::MissingCollaborator {
                plugin: self.metadata.name.clone(),
                stage: PipelineStageKind::Summarize,
            })?;
        ctx.project
            .summaries
            .iter()
            .map(|summary| Ok(StageImplementation::for_summary(summary.clone(), factory(ctx)?)))
            .collect()
    }
}

/// Plugin definitions by name, populated once at startup.
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<PluginDefinition>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: PluginDefinition) -> Result<(), RegistryError> {
        let name = definition.name().to_string();
        if self.plugins.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.plugins.insert(name, Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<PluginDefinition>, RegistryError> {
        self.plugins
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownPlugin(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::SummaryDefinition;
    use crate::testing::{fixtures, MockDownloadFactory, MockUnitProcessor};
    use std::path::Path;

    fn mock(name: &'static str) -> impl Fn(&FactoryContext<'_>) -> Result<Arc<dyn StageUnitProcessor>, RegistryError> {
        move |_ctx| Ok(Arc::new(MockUnitProcessor::new(name)) as Arc<dyn StageUnitProcessor>)
    }

    fn definition() -> PluginDefinition {
        PluginDefinition::new(PluginMetadata::new("modis"))
            .with_download(Arc::new(MockDownloadFactory::new("modis:data", "data")))
            .with_download(Arc::new(MockDownloadFactory::new("modis:qc", "qc")))
            .with_processor("mosaic", mock("mosaic"))
            .with_index("ndvi", mock("ndvi"))
            .with_index("evi", mock("evi"))
            .with_summary(mock("zonal"))
    }

    #[test]
    fn test_required_data_names_follow_downloads() {
        assert_eq!(definition().required_data_names(), vec!["data", "qc"]);
    }

    #[test]
    fn test_build_indices_for_selected_names() {
        let project = fixtures::descriptor("p", Path::new("/work"), "modis", &["ndvi"]);
        let layout = ProjectLayout::new(Path::new("/work"), "p");
        let ctx = FactoryContext {
            project: &project,
            plugin: &project.plugins[0],
            layout: &layout,
        };

        let built = definition().build_indices(&ctx).unwrap();
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].name, "ndvi");
    }

    #[test]
    fn test_unknown_index_is_rejected() {
        let project = fixtures::descriptor("p", Path::new("/work"), "modis", &["lst"]);
        let layout = ProjectLayout::new(Path::new("/work"), "p");
        let ctx = FactoryContext {
            project: &project,
            plugin: &project.plugins[0],
            layout: &layout,
        };

        let err = definition().build_indices(&ctx).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownIndex { index, .. } if index == "lst"));
    }

    #[test]
    fn test_summaries_need_a_factory() {
        let project = fixtures::descriptor("p", Path::new("/work"), "modis", &["ndvi"])
            .with_summary(SummaryDefinition::new("zones"));
        let layout = ProjectLayout::new(Path::new("/work"), "p");
        let ctx = FactoryContext {
            project: &project,
            plugin: &project.plugins[0],
            layout: &layout,
        };

        assert_eq!(definition().build_summaries(&ctx).unwrap().len(), 1);

        let bare = PluginDefinition::new(PluginMetadata::new("modis"));
        assert!(matches!(
            bare.build_summaries(&ctx),
            Err(RegistryError::MissingCollaborator { stage: PipelineStageKind::Summarize, .. })
        ));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = PluginRegistry::new();
        registry.register(definition()).unwrap();
        assert!(registry.contains("modis"));
        assert!(registry.get("modis").is_ok());
        assert!(matches!(registry.get("chirps"), Err(RegistryError::UnknownPlugin(_))));
        assert!(matches!(registry.register(definition()), Err(RegistryError::Duplicate(_))));
        assert_eq!(registry.names(), vec!["modis"]);
    }
}
