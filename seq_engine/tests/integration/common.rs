//! Shared helpers for the integration tests.

use seq_common::config::EngineConfig;
use seq_engine::prelude::*;
use seq_pv::sim::SimPvSystem;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Generous bound for anything the tests wait on.
pub const WAIT: Duration = Duration::from_secs(3);

/// Registry whose only PV system is `sim`, with a short I/O timeout.
pub fn registry_with(sim: &SimPvSystem, io_timeout_secs: f64) -> Arc<Registry> {
    let mut systems = PvSystemRegistry::new();
    systems
        .register(Arc::new(sim.clone()))
        .expect("register sim");
    let config = EngineConfig {
        io_timeout_secs,
        ..EngineConfig::default()
    };
    Registry::new(config, systems)
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Wait until state set `ss` of `instance` is in `state`.
pub fn wait_state(instance: &Instance, ss: usize, state: &str) -> bool {
    wait_for(WAIT, || instance.current_state(ss).as_deref() == Some(state))
}

/// State that never fires.
pub fn idle() -> FnState {
    FnState::new(|_| None)
}
