//! PV system registry.
//!
//! Maps PV system names (the `pvsys` launch macro) to backends. Built at
//! startup, populated via `register()` and handed to the instance
//! [`Registry`](crate::registry::Registry). No global state.

use crate::error::{SeqError, SeqResult};
use seq_common::pv::PvSystem;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available PV systems.
#[derive(Default)]
pub struct PvSystemRegistry {
    systems: HashMap<&'static str, Arc<dyn PvSystem>>,
}

impl PvSystemRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `system` under its own name.
    ///
    /// # Errors
    /// Returns `SeqError::DuplicatePvSystem` if the name is taken.
    pub fn register(&mut self, system: Arc<dyn PvSystem>) -> SeqResult<()> {
        let name = system.name();
        if self.systems.contains_key(name) {
            return Err(SeqError::DuplicatePvSystem(name.to_string()));
        }
        self.systems.insert(name, system);
        Ok(())
    }

    /// Look up a PV system by name.
    ///
    /// # Errors
    /// Returns `SeqError::UnknownPvSystem` if nothing is registered under `name`.
    pub fn get(&self, name: &str) -> SeqResult<Arc<dyn PvSystem>> {
        self.systems
            .get(name)
            .cloned()
            .ok_or_else(|| SeqError::UnknownPvSystem(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.systems.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
