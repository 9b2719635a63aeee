//! Explicit plugin-name × stage-kind mapping to collaborator factories.

mod plugin;

pub use plugin::{
    FactoryContext, PluginDefinition, PluginMetadata, PluginRegistry, ProcessorFactory,
    RegistryError,
};
