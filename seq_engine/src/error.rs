//! Engine error types.
//!
//! Channel-level failures are not Rust errors: they are [`PvStatus`] values
//! recorded in the channel metadata. The types here cover descriptor
//! validation, queue construction and instance administration.
//!
//! [`PvStatus`]: seq_common::pv::PvStatus

use thiserror::Error;

/// Bounded queue construction failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue capacity must be at least 1")]
    ZeroCapacity,

    #[error("queue element size must be at least 1 byte")]
    ZeroElementSize,

    #[error("queue capacity {requested} exceeds maximum {max}")]
    CapacityTooLarge { requested: usize, max: usize },
}

/// Program descriptor validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    #[error("program {program}: bad magic {found:#x} (expected {expected:#x})")]
    BadMagic {
        program: String,
        found: u32,
        expected: u32,
    },

    #[error("program {0}: no state sets")]
    NoStateSets(String),

    #[error("program {program}: state set {state_set} has no states")]
    EmptyStateSet { program: String, state_set: String },

    #[error("program {program}: event flag {flag} out of range (1..={max})")]
    UnknownEventFlag {
        program: String,
        flag: usize,
        max: usize,
    },

    #[error("program {program}: channel index {index} out of range")]
    UnknownChannel { program: String, index: usize },

    #[error("program {program}: invalid queue for variable {var}: {reason}")]
    InvalidQueue {
        program: String,
        var: String,
        reason: String,
    },

    #[error("program {0} is already registered")]
    DuplicateProgram(String),
}

/// Launch and administration failures.
#[derive(Debug, Error)]
pub enum SeqError {
    #[error(transparent)]
    Program(#[from] ProgramError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("unknown PV system: {0}")]
    UnknownPvSystem(String),

    #[error("PV system already registered: {0}")]
    DuplicatePvSystem(String),

    #[error("unknown program: {0}")]
    UnknownProgram(String),

    #[error("failed to spawn thread: {0}")]
    Spawn(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("instance thread panicked: {0}")]
    Panicked(String),
}

/// Result alias for engine administration.
pub type SeqResult<T> = Result<T, SeqError>;
