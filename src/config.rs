use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audit_log::DEFAULT_RETENTION_DAYS;
use crate::errors::DeployError;
use crate::progress::OverflowPolicy;

pub const APP_DIR_NAME: &str = "remote-deployer";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Runtime settings, loaded from `config.toml`. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployerConfig {
    pub database_path: PathBuf,
    pub audit_log_dir: PathBuf,
    /// Daily rolling application log; unset logs to stdout only.
    pub app_log_dir: Option<PathBuf>,
    pub audit_retention_days: u32,
    pub connect_timeout_secs: u64,
    pub progress_capacity: usize,
    pub progress_overflow: OverflowPolicy,
    /// Unset means no cap on concurrently running tasks.
    pub max_concurrent_tasks: Option<usize>,
    pub log_level: String,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self::with_data_dir(&Self::default_data_dir())
    }
}

impl DeployerConfig {
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME)
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Defaults with every path placed under `data_dir`.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            database_path: data_dir.join("deployer.db"),
            audit_log_dir: data_dir.join("logs"),
            app_log_dir: None,
            audit_retention_days: DEFAULT_RETENTION_DAYS,
            connect_timeout_secs: 30,
            progress_capacity: 256,
            progress_overflow: OverflowPolicy::Block,
            max_concurrent_tasks: None,
            log_level: "info".to_string(),
        }
    }

    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, DeployError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|error| {
            DeployError::Config(format!("Failed to read `{}`: {error}", path.display()))
        })?;
        Self::from_toml_str(&content).map_err(|error| {
            DeployError::Config(format!("Failed to parse `{}`: {error}", path.display()))
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}
