//! Configuration management for export-queue
//!
//! This module handles loading, parsing, and managing configuration from various sources:
//! - Configuration files (TOML format)
//! - Environment variables
//! - Command-line arguments
//!
//! Configuration precedence (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file
//! 4. Default values

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Export queue and worker pool configuration
    #[serde(default)]
    pub export: ExportConfig,

    /// Hit source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Export queue, worker pool and retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Directory where export files are written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Maximum number of distinct queued jobs
    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,

    /// Number of worker slots
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Days a finished export (file and archive entry) is kept
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// Number of hits per batch pulled from a source
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Interval between dispatch passes in milliseconds
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,

    /// Interval between retention sweeps in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Number of batches buffered between producer and consumer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Hit source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory holding `<name>.jsonl` files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// Enable timestamps in logs
    #[serde(default = "default_log_timestamps")]
    pub timestamps: bool,
}

/// Log level options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// Default value functions
fn default_output_dir() -> PathBuf {
    PathBuf::from("./exports")
}

fn default_queue_max_size() -> usize {
    10
}

fn default_pool_size() -> usize {
    2
}

fn default_retention_days() -> u64 {
    7
}

fn default_batch_size() -> usize {
    500
}

fn default_dispatch_interval_ms() -> u64 {
    500
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_channel_capacity() -> usize {
    4
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_level() -> LogLevel {
    LogLevel::Warn
}

fn default_log_timestamps() -> bool {
    true
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            queue_max_size: default_queue_max_size(),
            pool_size: default_pool_size(),
            retention_days: default_retention_days(),
            batch_size: default_batch_size(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            timestamps: default_log_timestamps(),
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a file
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file (TOML format)
    ///
    /// # Returns
    /// * `Result<Config>` - Loaded configuration or error
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.display().to_string())
            } else {
                ConfigError::InvalidFormat(format!("{}: {}", path.display(), e))
            }
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::InvalidFormat(e.to_string()).into())
    }

    /// Load configuration from a file, environment and defaults
    ///
    /// An explicit path must exist. Without one, the default path is used
    /// when present, otherwise defaults apply.
    ///
    /// # Arguments
    /// * `path` - Optional explicit configuration file
    pub fn load_from_file(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = Self::default_path();
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `EXPORT_QUEUE_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("EXPORT_QUEUE_OUTPUT_DIR") {
            self.export.output_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("EXPORT_QUEUE_DATA_DIR") {
            self.source.data_dir = PathBuf::from(dir);
        }
        if let Some(n) = lookup("EXPORT_QUEUE_POOL_SIZE").and_then(|v| v.parse().ok()) {
            self.export.pool_size = n;
        }
        if let Some(n) = lookup("EXPORT_QUEUE_QUEUE_MAX_SIZE").and_then(|v| v.parse().ok()) {
            self.export.queue_max_size = n;
        }
    }

    /// Get the default configuration file path
    ///
    /// # Returns
    /// * `PathBuf` - Path to default configuration file
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".export-queue")
            .join("config.toml")
    }

    /// Serialize the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidFormat(e.to_string()).into())
    }

    /// Validate the configuration
    ///
    /// # Returns
    /// * `Result<()>` - Ok if valid, error otherwise
    pub fn validate(&self) -> Result<()> {
        self.export.validate()
    }
}

impl ExportConfig {
    /// Build a configuration for the given output directory and sizes.
    ///
    /// Remaining fields take their defaults.
    pub fn new<P: Into<PathBuf>>(
        output_dir: P,
        queue_max_size: usize,
        pool_size: usize,
        retention_days: u64,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            queue_max_size,
            pool_size,
            retention_days,
            ..Self::default()
        }
    }

    /// Reject sizes that would make the pool or pipeline unusable
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("export.queue_max_size", self.queue_max_size),
            ("export.pool_size", self.pool_size),
            ("export.batch_size", self.batch_size),
            ("export.channel_capacity", self.channel_capacity),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Retention window as Duration, saturating for absurd day counts
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 60 * 60))
    }

    /// Dispatch tick as Duration
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms.max(1))
    }

    /// Retention sweep tick as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}
