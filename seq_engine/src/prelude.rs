//! Prelude module for common re-exports.
//!
//! ```rust
//! use seq_engine::prelude::*;
//! ```

// ─── Programs ───────────────────────────────────────────────────────
pub use crate::program::{
    ChannelId, ChannelSpec, EventFlag, EventRef, FnState, ProgramBuilder, ProgramDescriptor,
    StateBehavior, StateSetSpec, StateSpec, Transition,
};

// ─── Runtime ────────────────────────────────────────────────────────
pub use crate::channel::Completion;
pub use crate::context::StateSetContext;
pub use crate::instance::{Instance, InstanceHandle};
pub use crate::pv_registry::PvSystemRegistry;
pub use crate::registry::Registry;
pub use crate::show::{ShowQuery, ShowReport};

// ─── Errors ─────────────────────────────────────────────────────────
pub use crate::error::{ProgramError, SeqError, SeqResult};
