//! Process-wide configuration.

use std::path::{Path, PathBuf};

use herald_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default data directory, relative to the working directory.
const DEFAULT_DATA_DIR: &str = "herald-data";

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Herald configuration, loaded once at startup and passed explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeraldConfig {
    /// Root for job documents and attempt logs.
    pub data_dir: PathBuf,
    /// Connections file; defaults to `{data_dir}/connections.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections_path: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
}

impl Default for HeraldConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            connections_path: None,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl HeraldConfig {
    /// Load from a JSON file, or use defaults when no path is given.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let scheduler = &self.scheduler;
        if scheduler.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if scheduler.retry.base_delay_secs > scheduler.retry.max_delay_secs {
            return Err(ConfigError::Invalid(format!(
                "retry.base_delay_secs ({}) exceeds retry.max_delay_secs ({})",
                scheduler.retry.base_delay_secs, scheduler.retry.max_delay_secs
            )));
        }
        if scheduler.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if scheduler.enabled_platforms.is_empty() {
            return Err(ConfigError::Invalid("no platforms are enabled".to_string()));
        }
        Ok(())
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    pub fn attempts_dir(&self) -> PathBuf {
        self.data_dir.join("attempts")
    }

    pub fn connections_path(&self) -> PathBuf {
        self.connections_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("connections.json"))
    }
}
