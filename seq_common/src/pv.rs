//! Process variable types and backend contract.
//!
//! This module contains:
//! - [`types`] - values, alarm status/severity and metadata
//! - [`system`] - the `PvSystem` / `PvVariable` traits every backend implements

pub mod system;
pub mod types;

pub use system::{
    CompletionHandler, ConnectionHandler, MonitorHandler, MonitorId, PvConnection, PvError,
    PvEvent, PvSystem, PvVariable,
};
pub use types::{PvMeta, PvSeverity, PvStatus, PvString, PvType, PvValue, pv_string};
