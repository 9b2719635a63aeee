use crate::project::ProjectDescriptor;
use crate::registry::PluginMetadata;

use super::types::Config;

/// Source of project descriptors and plugin metadata, read once when
/// schedulers are built.
pub trait ConfigProvider {
    fn project_descriptors(&self) -> Vec<ProjectDescriptor>;

    fn plugin_metadata(&self, name: &str) -> Option<PluginMetadata>;
}

impl ConfigProvider for Config {
    fn project_descriptors(&self) -> Vec<ProjectDescriptor> {
        self.projects.clone()
    }

    fn plugin_metadata(&self, name: &str) -> Option<PluginMetadata> {
        self.plugins
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.metadata())
    }
}
