//! # Sequencer PV Backends
//!
//! Process variable systems implementing the `PvSystem` / `PvVariable`
//! contract from `seq_common::pv`.
//!
//! # Module Structure
//!
//! - [`sim`] - In-memory simulated PV system for development and testing
//!
//! # Adding New Backends
//!
//! 1. Create a new submodule
//! 2. Implement `PvSystem` and `PvVariable` from `seq_common::pv`
//! 3. Add it to [`create_system`] and [`builtin_systems`]

pub mod sim;

use seq_common::pv::PvSystem;
use std::sync::Arc;

/// Create the built-in PV system called `name`.
pub fn create_system(name: &str) -> Option<Arc<dyn PvSystem>> {
    match name {
        sim::SIM_SYSTEM_NAME => Some(sim::create_system()),
        _ => None,
    }
}

/// Names of all built-in PV systems.
pub fn builtin_systems() -> &'static [&'static str] {
    &[sim::SIM_SYSTEM_NAME]
}
