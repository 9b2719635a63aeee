use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::orchestrator::OrchestratorConfig;
use crate::project::ProjectDescriptor;
use crate::registry::PluginMetadata;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    #[serde(default)]
    pub projects: Vec<ProjectDescriptor>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("terrapipe.db")
}

/// A plugin assembled from the built-in collaborators.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default = "default_one")]
    pub days_per_input: u32,
    #[serde(default = "default_one")]
    pub process_outputs_per_day: u32,
    /// Upstream sources. The first one is the primary source.
    #[serde(default)]
    pub downloads: Vec<DownloadSourceConfig>,
    #[serde(default)]
    pub process: Vec<CommandConfig>,
    /// Index name to the command computing it.
    #[serde(default)]
    pub indices: BTreeMap<String, CommandConfig>,
    #[serde(default)]
    pub summary: Option<CommandConfig>,
}

fn default_one() -> u32 {
    1
}

impl PluginConfig {
    pub fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(&self.name)
            .with_days_per_input(self.days_per_input)
            .with_process_outputs_per_day(self.process_outputs_per_day)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadKind {
    /// Dates enumerated from `origin_date`, fetched over HTTP.
    Http,
    /// Files found in a local directory, copied into the download root.
    Local,
}

/// One upstream source of a plugin.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadSourceConfig {
    #[serde(default = "default_data_name")]
    pub data_name: String,
    pub kind: DownloadKind,
    /// Identity shared across projects. Defaults to `<plugin>:<data_name>`.
    #[serde(default)]
    pub source_id: Option<String>,
    /// `http`: URL with `{year}`, `{doy}`, `{month}`, `{day}`, `{yyyymmdd}` tokens.
    #[serde(default)]
    pub url_template: Option<String>,
    /// `http`: local file name, same tokens. Defaults to the URL's last segment.
    #[serde(default)]
    pub file_template: Option<String>,
    /// `http`: first date the source publishes.
    #[serde(default)]
    pub origin_date: Option<NaiveDate>,
    /// `local`: directory to scan.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// `local`: regex with `year` and `doy` (or `year`, `month`, `day`) groups.
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

fn default_data_name() -> String {
    "data".to_string()
}

impl DownloadSourceConfig {
    pub fn source_id(&self, plugin: &str) -> String {
        self.source_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", plugin, self.data_name))
    }
}

/// An external program run once per work unit.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandConfig {
    /// Implementation name. Defaults to the program's file name.
    #[serde(default)]
    pub name: Option<String>,
    pub program: String,
    /// Argument templates: `{inputs}`, `{input:<data_name>}`, `{output}`,
    /// `{output_dir}`, `{year}`, `{doy}`, `{index}`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Output file name template, relative to the unit's output directory.
    pub output: String,
    /// Data name of the cached output. Defaults to the implementation name.
    #[serde(default)]
    pub output_data_name: Option<String>,
}

impl CommandConfig {
    pub fn implementation_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            std::path::Path::new(&self.program)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.program.clone())
        })
    }
}
