//! Sequencer Common Library
//!
//! This crate provides the shared vocabulary of the state program
//! sequencer: constants, configuration loading, option bit sets, process
//! variable value/metadata types and the contract every process variable
//! backend implements.
//!
//! # Module Structure
//!
//! - [`consts`] - Limits, protocol constants and defaults
//! - [`config`] - Configuration loading traits and types
//! - [`options`] - Program and state option bit sets
//! - [`pv`] - Process variable types and the backend contract
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```toml
//! [dependencies]
//! seq_common = { path = "../seq_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use seq_common::prelude::*;
//! use seq_common::config::{ConfigLoader, EngineConfig};
//! ```

pub mod config;
pub mod consts;
pub mod options;
pub mod prelude;
pub mod pv;
