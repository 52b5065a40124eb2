/*!
 * Configuration types for the transfer engine
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::download::{DEFAULT_BUFFER_COUNT, DEFAULT_INITIAL_BUFFER_SIZE, DEFAULT_MAX_BUFFER_SIZE};
use crate::upload::{DEFAULT_PARALLELISM, DEFAULT_PART_SIZE, MAX_PART_SIZE};

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine-wide transfer configuration
///
/// Every field has a default, so a TOML file only needs the values it
/// changes:
///
/// ```toml
/// part_size = 8388608
/// parallelism = 8
///
/// [log]
/// level = "debug"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Scheme used when naming objects in errors (`scheme://bucket/key`)
    pub scheme: String,

    /// Multipart part size in bytes (0 = default 5 MiB)
    pub part_size: u64,

    /// Concurrent part uploads (0 = default 3)
    pub parallelism: usize,

    /// Keep uploaded parts on failure instead of aborting the upload
    pub leave_parts_on_error: bool,

    /// Compare client CRC64 with the value echoed by the service
    pub verify_crc64: bool,

    /// In-flight buffers per range reader
    pub prefetch_buffers: usize,

    /// First prefetch buffer size (soft start)
    pub initial_buffer_size: usize,

    /// Prefetch buffer size cap
    pub max_buffer_size: usize,

    /// Logging configuration
    pub log: LogConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            scheme: "oss".to_string(),
            part_size: DEFAULT_PART_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            leave_parts_on_error: false,
            verify_crc64: true,
            prefetch_buffers: DEFAULT_BUFFER_COUNT,
            initial_buffer_size: DEFAULT_INITIAL_BUFFER_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            log: LogConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: TransferConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheme.is_empty() {
            return Err(ConfigError::Invalid("scheme cannot be empty".to_string()));
        }

        if self.part_size > MAX_PART_SIZE {
            return Err(ConfigError::Invalid(format!(
                "part size {} exceeds maximum {}",
                self.part_size, MAX_PART_SIZE
            )));
        }

        if self.prefetch_buffers == 0 {
            return Err(ConfigError::Invalid(
                "prefetch_buffers must be at least 1".to_string(),
            ));
        }

        if self.initial_buffer_size == 0 || self.max_buffer_size < self.initial_buffer_size {
            return Err(ConfigError::Invalid(format!(
                "buffer sizes must satisfy 0 < initial ({}) <= max ({})",
                self.initial_buffer_size, self.max_buffer_size
            )));
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Minimum level when `RUST_LOG` is not set
    pub level: LogLevel,

    /// Write JSON logs to this file instead of stdout
    pub file: Option<PathBuf>,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
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
