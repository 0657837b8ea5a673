//! Prelude module for common re-exports.
//!
//! ```rust
//! use seq_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, EngineConfig, LogLevel, SharedConfig};

// ─── Options ────────────────────────────────────────────────────────
pub use crate::options::{ProgramOptions, StateOptions};

// ─── Process Variables ──────────────────────────────────────────────
pub use crate::pv::{
    PvConnection, PvError, PvEvent, PvMeta, PvSeverity, PvStatus, PvSystem, PvType, PvValue,
    PvVariable,
};

// ─── Constants ──────────────────────────────────────────────────────
pub use crate::consts::{IO_TIMEOUT_SECS, SEQ_MAGIC};
