//! # Sequencer Runner
//!
//! Library half of the `seq` binary: runner configuration and the built-in
//! demo programs.
//!
//! # Module Structure
//!
//! - [`config`] - `seq.toml` layout and validation
//! - [`demo`] - Demo state programs registered by the runner

pub mod config;
pub mod demo;
