use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::{Path, PathBuf};

use super::{types::Config, ConfigError};

/// Environment variable naming the config file.
pub const CONFIG_PATH_VAR: &str = "TERRAPIPE_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "terrapipe.toml";

/// Nested keys use a double underscore: `TERRAPIPE_ORCHESTRATOR__POLL_INTERVAL_MS`.
fn env_overrides() -> Env {
    Env::prefixed("TERRAPIPE_")
        .ignore(&["CONFIG"])
        .split("__")
}

/// Config file location: `$TERRAPIPE_CONFIG`, else `terrapipe.toml`.
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load configuration from file with environment variable overrides
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    Figment::new()
        .merge(Toml::file(path))
        .merge(env_overrides())
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Load configuration from a TOML string, without environment overrides.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    Figment::from(Toml::string(toml_str))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))
}
