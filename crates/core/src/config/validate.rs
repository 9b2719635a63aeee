use std::collections::HashSet;

use super::{types::Config, ConfigError, DownloadKind};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - At least one downloader slot
/// - Plugin names are unique and download sources are complete
/// - Project names are unique and every project descriptor is well formed
/// - Projects only reference defined plugins
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    // Server validation
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    if config.orchestrator.max_concurrent_downloaders == 0 {
        return Err(ConfigError::ValidationError(
            "orchestrator.max_concurrent_downloaders cannot be 0".to_string(),
        ));
    }

    let mut plugins = HashSet::new();
    for plugin in &config.plugins {
        if !plugins.insert(plugin.name.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "plugin '{}' is defined twice",
                plugin.name
            )));
        }
        for source in &plugin.downloads {
            let complete = match source.kind {
                DownloadKind::Http => source.url_template.is_some() && source.origin_date.is_some(),
                DownloadKind::Local => source.directory.is_some() && source.pattern.is_some(),
            };
            if !complete {
                return Err(ConfigError::ValidationError(format!(
                    "plugin '{}': download '{}' is missing required settings",
                    plugin.name, source.data_name
                )));
            }
        }
    }

    let mut projects = HashSet::new();
    for project in &config.projects {
        if !projects.insert(project.name.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "project '{}' is defined twice",
                project.name
            )));
        }
        project
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        for plugin in &project.plugins {
            if !plugins.contains(plugin.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "project '{}' references undefined plugin '{}'",
                    project.name, plugin.name
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    const PLUGIN: &str = r#"
[[plugins]]
name = "modis"

[[plugins.downloads]]
kind = "http"
url_template = "https://example.org/{year}/{doy}.hdf"
origin_date = "2024-01-01"
"#;

    fn project(name: &str, plugin: &str) -> String {
        format!(
            r#"
[[projects]]
name = "{}"
working_dir = "/work"
start_date = "2024-01-01"
plugins = [{{ name = "{}", indices = ["ndvi"] }}]
"#,
            name, plugin
        )
    }

    #[test]
    fn test_validate_valid_config() {
        let config = load_config_from_str(&format!("{}{}", PLUGIN, project("p", "modis"))).unwrap();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let config = load_config_from_str("[server]\nport = 0").unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_zero_downloaders_fails() {
        let config =
            load_config_from_str("[orchestrator]\nmax_concurrent_downloaders = 0").unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_duplicate_project_fails() {
        let toml = format!("{}{}{}", PLUGIN, project("p", "modis"), project("p", "modis"));
        let config = load_config_from_str(&toml).unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn test_validate_undefined_plugin_fails() {
        let config = load_config_from_str(&format!("{}{}", PLUGIN, project("p", "chirps"))).unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("undefined plugin 'chirps'"));
    }

    #[test]
    fn test_validate_incomplete_download_fails() {
        let toml = r#"
[[plugins]]
name = "modis"

[[plugins.downloads]]
kind = "local"
directory = "/mnt/data"
"#;
        let config = load_config_from_str(toml).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_end_before_start_fails() {
        let toml = format!(
            "{}{}end_date = \"2023-01-01\"\n",
            PLUGIN,
            project("p", "modis")
        );
        let config = load_config_from_str(&toml).unwrap();
        assert!(validate_config(&config).is_err());
    }
}
