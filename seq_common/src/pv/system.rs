//! Process variable backend contract.
//!
//! This module defines:
//! - `PvSystem` trait - a named PV transport that creates variables
//! - `PvVariable` trait - one connection to an external process variable
//! - `PvError` enum - backend failures
//! - handler type aliases for connection, completion and monitor callbacks

use crate::pv::types::{PvSeverity, PvStatus, PvType, PvValue};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

/// Error types for PV backend operations.
#[derive(Debug, Clone, Error)]
pub enum PvError {
    /// No such process variable.
    #[error("PV not found: {0}")]
    NotFound(String),

    /// Operation requires a connected variable.
    #[error("PV disconnected: {0}")]
    Disconnected(String),

    /// Operation not supported by this backend.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Backend-specific failure.
    #[error("Backend failure: {0}")]
    Backend(String),
}

/// Connection state change delivered to a [`ConnectionHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PvConnection {
    /// New connection state.
    pub connected: bool,
    /// Element count reported by the server (meaningful when connected).
    pub element_count: usize,
}

/// Get/put completion or monitor update.
#[derive(Debug, Clone, PartialEq)]
pub struct PvEvent {
    /// Value in the requested type; `None` for put completions.
    pub value: Option<PvValue>,
    /// Status of the request itself.
    pub status: PvStatus,
    /// Alarm condition of the value.
    pub alarm: PvStatus,
    /// Alarm severity of the value.
    pub severity: PvSeverity,
    /// Source time stamp of the value.
    pub timestamp: SystemTime,
}

impl PvEvent {
    /// Event carrying a value with no alarm.
    pub fn value(value: PvValue) -> Self {
        Self {
            value: Some(value),
            status: PvStatus::Ok,
            alarm: PvStatus::Ok,
            severity: PvSeverity::None,
            timestamp: SystemTime::now(),
        }
    }

    /// Value-less completion (put callbacks).
    pub fn completion(status: PvStatus) -> Self {
        Self {
            value: None,
            status,
            alarm: PvStatus::Ok,
            severity: PvSeverity::None,
            timestamp: SystemTime::now(),
        }
    }
}

/// Called on every connect/disconnect of a variable.
pub type ConnectionHandler = Arc<dyn Fn(PvConnection) + Send + Sync>;

/// Called exactly once when a get/put request completes.
pub type CompletionHandler = Box<dyn FnOnce(PvEvent) + Send>;

/// Called for every monitor update.
pub type MonitorHandler = Arc<dyn Fn(PvEvent) + Send + Sync>;

/// Identifies an active monitor subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorId(pub u64);

/// A PV transport (Channel Access, simulation, ...).
///
/// The engine resolves a `PvSystem` by name (the `pvsys` macro or the
/// configured default) and creates one [`PvVariable`] per assigned channel.
///
/// # Callback contract
///
/// | Handler | When | Thread |
/// |---------|------|--------|
/// | connection | every state change, possibly before `create` returns | any |
/// | completion | once per accepted get/put request | any |
/// | monitor | every value update while subscribed | any |
///
/// Handlers may be invoked synchronously from inside any trait method.
/// The engine never holds its own locks while calling into a backend.
pub trait PvSystem: Send + Sync {
    /// Backend identifier (e.g. "sim").
    fn name(&self) -> &'static str;

    /// Create a variable connected to `pv_name`.
    ///
    /// The connection handler fires whenever the variable (dis)connects.
    /// A variable that does not exist yet stays disconnected until it does.
    ///
    /// # Errors
    /// Return `PvError::Backend` if the request cannot be issued at all.
    fn create(
        &self,
        pv_name: &str,
        on_connection: ConnectionHandler,
    ) -> Result<Arc<dyn PvVariable>, PvError>;

    /// Flush outstanding requests to the transport.
    fn flush(&self) {}
}

/// One connection to an external process variable.
pub trait PvVariable: Send + Sync {
    /// Name of the external variable.
    fn name(&self) -> &str;

    /// Element count reported by the server (0 while disconnected).
    fn element_count(&self) -> usize;

    /// Request the current value; `handler` receives it once.
    fn get_callback(
        &self,
        ty: PvType,
        count: usize,
        handler: CompletionHandler,
    ) -> Result<(), PvError>;

    /// Write `count` elements of `value`; `handler` fires on completion.
    fn put_callback(
        &self,
        value: &PvValue,
        count: usize,
        handler: CompletionHandler,
    ) -> Result<(), PvError>;

    /// Write without completion notification.
    fn put_no_block(&self, value: &PvValue, count: usize) -> Result<(), PvError>;

    /// Subscribe to value updates. The first update carries the current value.
    fn monitor_on(
        &self,
        ty: PvType,
        count: usize,
        handler: MonitorHandler,
    ) -> Result<MonitorId, PvError>;

    /// Cancel a subscription.
    fn monitor_off(&self, id: MonitorId) -> Result<(), PvError>;

    /// Last error text of this variable, if any.
    fn message(&self) -> Option<String> {
        None
    }

    /// Release the connection. No handler of this variable fires afterwards.
    fn destroy(&self) -> Result<(), PvError>;
}
