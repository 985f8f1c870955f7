//! Pipetrace configuration
//!
//! Stored in `~/.config/pipetrace/config.toml`.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Environment variables (`PIPETRACE_DIR`, `PIPETRACE_RETENTION_DAYS`, `PIPETRACE_LOG`)
//! 2. Config file
//! 3. Defaults

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipetraceError, Result};
use crate::storage::DEFAULT_RETENTION_DAYS;

pub const ENV_DIR: &str = "PIPETRACE_DIR";
pub const ENV_RETENTION_DAYS: &str = "PIPETRACE_RETENTION_DAYS";
pub const ENV_LOG: &str = "PIPETRACE_LOG";

const DEFAULT_LOG_FILTER: &str = "info";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipetraceConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Root directory of the file adapter
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    /// Days of history kept by `purge`
    #[serde(default = "default_days")]
    pub days: u32,
}

fn default_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: DEFAULT_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// tracing EnvFilter directive (e.g. "pipetrace=debug")
    pub filter: Option<String>,
}

impl PipetraceConfig {
    /// Returns `~/.config/pipetrace/` on Unix, `%APPDATA%/pipetrace/` on Windows
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pipetrace")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Returns defaults if the file doesn't exist, an error if it is malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| PipetraceError::ConfigError {
            reason: format!("Failed to read config file: {}", e),
        })?;

        toml::from_str(&content).map_err(|e| PipetraceError::ConfigError {
            reason: format!("Failed to parse config file: {}", e),
        })
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Creates the parent directory if it doesn't exist.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| PipetraceError::ConfigError {
                reason: format!("Failed to create config directory: {}", e),
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| PipetraceError::ConfigError {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, content).map_err(|e| PipetraceError::ConfigError {
            reason: format!("Failed to write config file: {}", e),
        })?;

        Ok(())
    }

    /// Merge process environment variables over file values
    pub fn with_env(self) -> Result<Self> {
        self.with_vars(|name| std::env::var(name).ok())
    }

    /// Merge variables from `lookup`; empty values are ignored
    pub fn with_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(dir) = var(ENV_DIR) {
            self.storage.dir = Some(PathBuf::from(dir));
        }

        if let Some(days) = var(ENV_RETENTION_DAYS) {
            self.retention.days = days
                .trim()
                .parse()
                .map_err(|_| PipetraceError::InvalidEnvValue {
                    var: ENV_RETENTION_DAYS.to_string(),
                    value: days.clone(),
                })?;
        }

        if let Some(filter) = var(ENV_LOG) {
            self.logging.filter = Some(filter);
        }

        Ok(self)
    }

    /// Storage root: configured dir, else the platform data dir
    pub fn storage_dir(&self) -> PathBuf {
        self.storage.dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pipetrace")
        })
    }

    pub fn log_filter(&self) -> &str {
        self.logging.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}
