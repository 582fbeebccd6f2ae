//! FaultLens configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FaultLensError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultLensConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FaultLensConfig {
    /// Load config from the default path (~/.faultlens/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FaultLensError::config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| FaultLensError::config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        tracing::debug!("📄 Config loaded from {}", path.display());
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| FaultLensError::config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.queue_capacity == 0 {
            return Err(FaultLensError::config("scheduler.queue_capacity must be > 0"));
        }
        if s.max_parallelism == 0 {
            return Err(FaultLensError::config("scheduler.max_parallelism must be > 0"));
        }
        if !(1..=3).contains(&s.max_attempts) {
            return Err(FaultLensError::config(format!(
                "scheduler.max_attempts must be in [1, 3], got {}",
                s.max_attempts
            )));
        }
        if s.activation_interval_ms == 0 {
            return Err(FaultLensError::config(
                "scheduler.activation_interval_ms must be > 0",
            ));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the FaultLens home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".faultlens")
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Activation loop poll interval.
    #[serde(default = "default_activation_interval_ms")]
    pub activation_interval_ms: u64,
    /// Submissions buffered ahead of the workers.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Steps executing at the same time.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Attempts a workflow gets across interrupted runs, in [1, 3].
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_activation_interval_ms() -> u64 { 1000 }
fn default_queue_capacity() -> usize { 10 }
fn default_max_parallelism() -> usize { 3 }
fn default_max_attempts() -> u32 { 2 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            activation_interval_ms: default_activation_interval_ms(),
            queue_capacity: default_queue_capacity(),
            max_parallelism: default_max_parallelism(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl SchedulerConfig {
    pub fn activation_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.activation_interval_ms)
    }
}

/// Which store backend holds scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Memory,
    Json,
    #[default]
    Sqlite,
}

/// Persistent state configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,
    /// Directory holding the state files / database.
    #[serde(default = "default_state_path")]
    pub path: String,
    /// Workflow bodies older than this are pruned.
    #[serde(default)]
    pub retention_days: Option<u32>,
}

fn default_state_path() -> String {
    FaultLensConfig::home_dir()
        .join("state")
        .to_string_lossy()
        .into_owned()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            path: default_state_path(),
            retention_days: None,
        }
    }
}

impl StorageConfig {
    pub fn retention(&self) -> Option<chrono::Duration> {
        self.retention_days
            .map(|days| chrono::Duration::days(i64::from(days)))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
