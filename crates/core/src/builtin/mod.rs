//! Collaborators driven entirely by configuration: date-pattern HTTP
//! sources, local directory sources and external commands.

mod command;
mod downloaders;
mod factory;
mod listers;
mod template;

pub use command::CommandProcessor;
pub use downloaders::{HttpFileDownloader, LocalCopyDownloader};
pub use factory::SourceDownloadFactory;
pub use listers::{DatePatternLister, LocalDirectoryLister};
pub use template::render_date;

use std::sync::Arc;

use tracing::debug;

use crate::config::{CommandConfig, Config, PluginConfig};
use crate::registry::{PluginDefinition, PluginRegistry, RegistryError};
use crate::stage::StageUnitProcessor;

/// Build a registry with one plugin per `[[plugins]]` entry.
pub fn registry_from_config(config: &Config) -> Result<PluginRegistry, RegistryError> {
    let mut registry = PluginRegistry::new();
    for plugin in &config.plugins {
        registry.register(plugin_definition(plugin))?;
        debug!(plugin = %plugin.name, "Registered configured plugin");
    }
    Ok(registry)
}

fn plugin_definition(plugin: &PluginConfig) -> PluginDefinition {
    let mut definition = PluginDefinition::new(plugin.metadata());

    for source in &plugin.downloads {
        let factory = SourceDownloadFactory::new(&plugin.name, source.clone())
            .with_step_days(plugin.days_per_input);
        definition = definition.with_download(Arc::new(factory));
    }
    for command in &plugin.process {
        let name = command.implementation_name();
        definition = definition.with_processor(name.clone(), command_factory(name, command.clone()));
    }
    for (index, command) in &plugin.indices {
        definition = definition.with_index(index.clone(), command_factory(index.clone(), command.clone()));
    }
    if let Some(command) = &plugin.summary {
        let name = command.implementation_name();
        definition = definition.with_summary(command_factory(name, command.clone()));
    }
    definition
}

fn command_factory(
    name: String,
    command: CommandConfig,
) -> impl Fn(&crate::registry::FactoryContext<'_>) -> Result<Arc<dyn StageUnitProcessor>, RegistryError>
       + Send
       + Sync
       + 'static {
    move |_ctx| {
        Ok(Arc::new(CommandProcessor::new(name.clone(), command.clone())) as Arc<dyn StageUnitProcessor>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    #[test]
    fn test_registry_from_config() {
        let config = load_config_from_str(
            r#"
[[plugins]]
name = "modis"

[[plugins.downloads]]
kind = "local"
directory = "/mnt/modis"
pattern = 'MOD_(?P<year>\d{4})(?P<doy>\d{3})\.hdf'

[[plugins.process]]
name = "mosaic"
program = "gdal_merge.py"
output = "mosaic.tif"

[plugins.indices.ndvi]
program = "ndvi"
output = "ndvi.tif"

[plugins.indices.evi]
program = "evi"
output = "evi.tif"

[[plugins]]
name = "chirps"
"#,
        )
        .unwrap();

        let registry = registry_from_config(&config).unwrap();
        assert_eq!(registry.names(), vec!["chirps", "modis"]);

        let modis = registry.get("modis").unwrap();
        assert_eq!(modis.required_data_names(), vec!["data"]);
        assert_eq!(modis.index_names(), vec!["evi", "ndvi"]);
        assert_eq!(modis.downloads()[0].source_id().as_str(), "modis:data");
    }

    #[test]
    fn test_duplicate_plugins_are_rejected() {
        let config = load_config_from_str(
            r#"
[[plugins]]
name = "modis"

[[plugins]]
name = "modis"
"#,
        )
        .unwrap();
        assert!(matches!(
            registry_from_config(&config),
            Err(RegistryError::Duplicate(_))
        ));
    }
}
