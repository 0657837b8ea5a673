//! TOML configuration for the sequencer.
//!
//! `[shared]` names the process and its log level, `[engine]` tunes every
//! instance a registry launches. Any `DeserializeOwned` type gains
//! [`ConfigLoader::load`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use seq_common::config::{ConfigLoader, ConfigError, EngineConfig, SharedConfig};
//! use serde::Deserialize;
//! use std::path::Path;
//!
//! #[derive(Debug, Deserialize)]
//! struct RunnerConfig {
//!     shared: SharedConfig,
//!     #[serde(default)]
//!     engine: EngineConfig,
//! }
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = RunnerConfig::load(Path::new("seq.toml"))?;
//!     config.engine.validate()?;
//!     assert!(!config.shared.service_name.is_empty());
//!     Ok(())
//! }
//! ```

use crate::consts::{
    CONNECT_BACKOFF_FACTOR, CONNECT_BACKOFF_FIRST_SECS, CONNECT_BACKOFF_MAX_SECS,
    DEFAULT_PRIORITY, DEFAULT_PV_SYSTEM, DEFAULT_STACK_SIZE, IO_TIMEOUT_SECS, MIN_STACK_SIZE,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration load or validation failure.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// No file at the given path.
    #[error("config file not found")]
    FileNotFound,

    /// Unreadable file or malformed TOML.
    #[error("config parse error: {0}")]
    ParseError(String),

    /// Well-formed but out-of-range values.
    #[error("invalid config: {0}")]
    ValidationError(String),
}

/// Default `tracing` filter level (`"trace"` … `"error"` in TOML).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Filter directive spelling of this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Common configuration fields shared by every sequencer process.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "seq-ioc-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Used when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Process name shown in the startup banner.
    pub service_name: String,
}

impl SharedConfig {
    /// # Errors
    ///
    /// `ConfigError::ValidationError` for a blank `service_name`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::ValidationError("shared.service_name is empty".into()));
        }
        Ok(())
    }
}

/// Engine tuning shared by all instances launched from one registry.
///
/// Every field has a default, so an absent `[engine]` table is valid.
///
/// # TOML Example
///
/// ```toml
/// [engine]
/// pv_system = "sim"
/// io_timeout_secs = 10.0
/// connect_backoff_first_secs = 2.0
/// connect_backoff_factor = 1.71
/// connect_backoff_max_secs = 3600.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// PV system used when no `pvsys` macro is given.
    pub pv_system: String,
    /// Bound for synchronous get/put waits [s].
    pub io_timeout_secs: f64,
    /// First connect-wait interval [s].
    pub connect_backoff_first_secs: f64,
    /// Connect-wait growth factor.
    pub connect_backoff_factor: f64,
    /// Connect-wait interval cap [s].
    pub connect_backoff_max_secs: f64,
    /// Stack size for state set threads when neither launch argument nor macro sets one.
    pub default_stack_size: usize,
    /// Thread priority when no `priority` macro is given; also the upper bound.
    pub default_priority: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pv_system: DEFAULT_PV_SYSTEM.to_string(),
            io_timeout_secs: IO_TIMEOUT_SECS,
            connect_backoff_first_secs: CONNECT_BACKOFF_FIRST_SECS,
            connect_backoff_factor: CONNECT_BACKOFF_FACTOR,
            connect_backoff_max_secs: CONNECT_BACKOFF_MAX_SECS,
            default_stack_size: DEFAULT_STACK_SIZE,
            default_priority: DEFAULT_PRIORITY,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `pv_system` is empty
    /// - `io_timeout_secs` or `connect_backoff_first_secs` is not positive
    /// - `connect_backoff_factor` is below 1.0
    /// - `connect_backoff_max_secs` is below `connect_backoff_first_secs`
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pv_system.is_empty() {
            return Err(ConfigError::ValidationError(
                "pv_system cannot be empty".to_string(),
            ));
        }
        if !(self.io_timeout_secs > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "io_timeout_secs must be positive, got {}",
                self.io_timeout_secs
            )));
        }
        if !(self.connect_backoff_first_secs > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "connect_backoff_first_secs must be positive, got {}",
                self.connect_backoff_first_secs
            )));
        }
        if !(self.connect_backoff_factor >= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "connect_backoff_factor must be >= 1.0, got {}",
                self.connect_backoff_factor
            )));
        }
        if self.connect_backoff_max_secs < self.connect_backoff_first_secs {
            return Err(ConfigError::ValidationError(format!(
                "connect_backoff_max_secs ({}) < connect_backoff_first_secs ({})",
                self.connect_backoff_max_secs, self.connect_backoff_first_secs
            )));
        }
        Ok(())
    }

    /// Synchronous I/O bound as a `Duration`.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.io_timeout_secs)
    }

    /// Resolve the stack size for a launch: explicit request, else the
    /// configured default; never below [`MIN_STACK_SIZE`].
    pub fn stack_size(&self, requested: Option<usize>) -> usize {
        let size = requested
            .filter(|s| *s > 0)
            .unwrap_or(self.default_stack_size);
        if size < MIN_STACK_SIZE {
            tracing::debug!(size, min = MIN_STACK_SIZE, "stack size raised to minimum");
            MIN_STACK_SIZE
        } else {
            size
        }
    }

    /// Resolve the thread priority for a launch, clamped to the default.
    pub fn priority(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_priority)
            .min(self.default_priority)
    }
}

/// TOML loading for any deserializable config type.
///
/// A missing file is `ConfigError::FileNotFound`; every other read or
/// syntax failure is `ConfigError::ParseError`.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => ConfigError::FileNotFound,
            _ => ConfigError::ParseError(format!("{}: {err}", path.display())),
        })?;
        Self::from_toml(&text)
    }

    fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|err| ConfigError::ParseError(err.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
