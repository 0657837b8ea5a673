//! Runner configuration (`seq.toml`).
//!
//! # TOML Example
//!
//! ```toml
//! [shared]
//! service_name = "seq-demo"
//! log_level = "info"
//!
//! [engine]
//! io_timeout_secs = 5.0
//!
//! [[programs]]
//! name = "level"
//! macros = "unit=tank1, high=8, low=2"
//!
//! [[sim.records]]
//! name = "tank1:level"
//! value = { type = "double", value = [0.0] }
//! ```

use seq_common::config::{ConfigError, EngineConfig, SharedConfig};
use seq_pv::sim::SimConfig;
use serde::Deserialize;

/// One `[[programs]]` entry: a program to launch at startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgramConfig {
    /// Registered program name.
    pub name: String,
    /// Launch macros, `"a=1, b=2"`.
    #[serde(default)]
    pub macros: String,
    /// Stack size in bytes; the `stack` macro takes precedence.
    #[serde(default)]
    pub stack_size: Option<usize>,
}

/// Complete runner configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    pub shared: SharedConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub programs: Vec<ProgramConfig>,
    #[serde(default)]
    pub sim: SimConfig,
}

impl RunnerConfig {
    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an invalid `[shared]` or
    /// `[engine]` section, or a `[[programs]]` entry without a name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.engine.validate()?;
        if let Some(index) = self.programs.iter().position(|p| p.name.trim().is_empty()) {
            return Err(ConfigError::ValidationError(format!(
                "programs[{index}]: name cannot be empty"
            )));
        }
        Ok(())
    }
}
