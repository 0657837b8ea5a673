//! Simulated records and their configuration.

use seq_common::pv::{PvMeta, PvSeverity, PvStatus, PvType, PvValue};
use serde::Deserialize;
use std::time::SystemTime;

/// `[[sim.records]]` entry of the runner configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimRecordConfig {
    pub name: String,
    /// Initial value, e.g. `{ type = "double", value = [1.5] }`.
    pub value: PvValue,
    #[serde(default = "default_connected")]
    pub connected: bool,
}

fn default_connected() -> bool {
    true
}

/// `[sim]` section of the runner configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub records: Vec<SimRecordConfig>,
}

#[derive(Debug, Clone)]
pub(crate) struct Record {
    pub(crate) value: PvValue,
    pub(crate) connected: bool,
    pub(crate) meta: PvMeta,
    pub(crate) puts: u64,
}

impl Record {
    pub(crate) fn new(value: PvValue, connected: bool) -> Self {
        Self {
            value,
            connected,
            meta: PvMeta {
                timestamp: SystemTime::now(),
                ..PvMeta::default()
            },
            puts: 0,
        }
    }

    /// Current value in the requested type and element count.
    pub(crate) fn read(&self, ty: PvType, count: usize) -> PvValue {
        self.value.convert(ty).truncated(count)
    }

    /// Overwrite the first `count` elements, keeping the record's type and size.
    pub(crate) fn write(&mut self, value: &PvValue, count: usize) {
        self.value.copy_prefix_from(value, count);
        self.meta.timestamp = SystemTime::now();
    }

    pub(crate) fn set_alarm(&mut self, status: PvStatus, severity: PvSeverity, message: Option<String>) {
        self.meta.status = status;
        self.meta.severity = severity;
        self.meta.message = message;
        self.meta.timestamp = SystemTime::now();
    }
}
