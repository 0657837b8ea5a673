//! # Sequencer Engine
//!
//! Runtime engine for compiled state programs. A program is a set of state
//! machines (state sets) that share variables bound to external process
//! variables (channels) and coordinate through event flags.
//!
//! # Module Structure
//!
//! - [`program`] - Program descriptor, builder and the `StateBehavior` trait
//! - [`registry`] - Program registration, instance launch and lookup
//! - [`instance`] - Instance handles and life cycle
//! - [`context`] - `StateSetContext`, the API seen by state program code
//! - [`queue`] - Bounded overwrite queue
//! - [`macros`] - Launch macro table
//! - [`show`] - Admin reports
//! - [`pv_registry`] - PV system registration
//! - [`backoff`] - Connect-wait backoff schedule
//! - [`sync`] - Binary semaphore
//! - [`error`] - Engine error types
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Registry                               │
//! │   programs ──► instances            PvSystemRegistry             │
//! └───────────────────┬──────────────────────────┬───────────────────┘
//!                     ▼                          │
//! ┌──────────────────────────────────────────────┼───────────────────┐
//! │ Instance                                     ▼                   │
//! │  ┌────────────┐   ┌──────────────┐   ┌──────────────────────┐    │
//! │  │ state set 0│   │ event flags  │   │ channel coordinator  │◄───┼── PV backend
//! │  │ state set 1│◄─►│ + wakeup     │◄──│ buffers, queues,     │    │   callbacks
//! │  │    ...     │   └──────────────┘   │ get/put/monitor      │    │
//! │  └─────┬──────┘                      └──────────▲───────────┘    │
//! │        └──────── StateSetContext ───────────────┘                │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

mod buffer;
mod channel;
mod event_flags;
mod log;
mod state_set;

pub mod backoff;
pub mod context;
pub mod error;
pub mod instance;
pub mod macros;
pub mod program;
pub mod pv_registry;
pub mod queue;
pub mod registry;
pub mod show;
pub mod sync;

pub mod prelude;

pub use crate::channel::Completion;
pub use crate::error::{ProgramError, QueueError, SeqError, SeqResult};
pub use crate::event_flags::EventSet;
pub use crate::instance::{ChannelCounts, Instance, InstanceHandle};
pub use crate::registry::Registry;

static_assertions::assert_impl_all!(Instance: Send, Sync, Clone);
static_assertions::assert_impl_all!(queue::BoundedQueue<u64>: Send, Sync);
static_assertions::assert_impl_all!(program::ProgramDescriptor: Send, Sync);
