///
/// # Runtime Configuration
///
/// Parses `tether.toml`. Every table and every field is optional; a missing
/// file section falls back to the defaults below, so an empty file is a
/// valid configuration.
///
/// ## Example tether.toml
///
/// ```toml
/// [threads]
/// stack_size = 2097152
/// free_list_limit = 16
///
/// [mutex]
/// spin_limit = 100
///
/// [signals]
/// strict_mask = false
///
/// [logging]
/// level = "warn"
/// ansi = false
/// ```
///

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "tether.toml";
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_FREE_LIST_LIMIT: usize = 16;
/// Largest number of dead records the registry keeps for recycling.
pub const MAX_FREE_LIST_LIMIT: usize = 4096;
pub const DEFAULT_SPIN_LIMIT: u32 = 100;

/// Smallest stack accepted for runtime-created threads.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub threads: ThreadsConfig,
    pub mutex: MutexConfig,
    pub signals: SignalConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ThreadsConfig {
    /// Stack size of the native memory block given to runtime-created threads
    pub stack_size: usize,
    /// How many dead thread records are kept for recycling
    pub free_list_limit: usize,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            free_list_limit: DEFAULT_FREE_LIST_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MutexConfig {
    /// Busy-wait iterations before a contended acquire blocks
    pub spin_limit: u32,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            spin_limit: DEFAULT_SPIN_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SignalConfig {
    /// Route asynchronous signals to dedicated threads instead of relying on
    /// per-thread masking. Signal-handling threads exist only in this mode.
    pub strict_mask: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            ansi: false,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "threads.stack_size",
                reason: format!("must be at least {} bytes", MIN_STACK_SIZE),
            });
        }
        if self.threads.free_list_limit > MAX_FREE_LIST_LIMIT {
            return Err(ConfigError::InvalidValue {
                field: "threads.free_list_limit",
                reason: format!("must be at most {}", MAX_FREE_LIST_LIMIT),
            });
        }
        if crate::logging::parse_level(&self.logging.level).is_none() {
            return Err(ConfigError::InvalidValue {
                field: "logging.level",
                reason: format!("unknown level '{}'", self.logging.level),
            });
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config_str(&content)
}

pub fn parse_config_str(content: &str) -> Result<RuntimeConfig, ConfigError> {
    let config: RuntimeConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}
