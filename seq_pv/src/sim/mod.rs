//! Simulated PV system.
//!
//! Records live in memory. Tests and the demo runner drive them through
//! [`SimPvSystem`]: write values, raise alarms, disconnect and reconnect
//! records, and hold get/put completions to exercise timeouts.
//!
//! All handlers are invoked on the calling thread after the simulator's
//! own lock has been released, so a handler may call back into the system.

mod record;
mod system;

pub use record::{SimConfig, SimRecordConfig};
pub use system::{SimPvSystem, SimVariable};

use seq_common::pv::PvSystem;
use std::sync::Arc;

/// Name under which the simulator registers.
pub const SIM_SYSTEM_NAME: &str = "sim";

/// Factory function for an empty simulator.
pub fn create_system() -> Arc<dyn PvSystem> {
    Arc::new(SimPvSystem::new())
}
