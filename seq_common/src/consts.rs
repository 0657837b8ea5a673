//! System-wide constants for the sequencer workspace.
//!
//! Single source of truth for protocol constants, limits and defaults.

use static_assertions::const_assert;

/// Magic tag a program descriptor must carry to be accepted by the engine.
///
/// Date-style (yyyymmdd) like the descriptor format revision it names.
pub const SEQ_MAGIC: u32 = 2012_03_15;

/// Capacity of a string element, in bytes.
pub const MAX_STRING_SIZE: usize = 40;

/// Bound for synchronous get/put completion waits [s].
pub const IO_TIMEOUT_SECS: f64 = 10.0;

/// First wait of the connect-wait backoff [s].
pub const CONNECT_BACKOFF_FIRST_SECS: f64 = 2.0;

/// Growth factor of the connect-wait backoff.
pub const CONNECT_BACKOFF_FACTOR: f64 = 1.71;

/// Cap of the connect-wait backoff [s].
pub const CONNECT_BACKOFF_MAX_SECS: f64 = 3600.0;

/// A delay counts as expired this much before its nominal time [s].
pub const DELAY_TOLERANCE_SECS: f64 = 0.000_001;

/// Largest capacity a bounded queue may be created with.
pub const QUEUE_MAX_ELEMENTS: usize = usize::MAX >> 1;

/// Default stack size for state set threads [bytes].
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Smallest stack size a state set thread is given [bytes].
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Default (and maximum) thread priority of an instance.
pub const DEFAULT_PRIORITY: u32 = 50;

/// PV system used when neither config nor the `pvsys` macro name one.
pub const DEFAULT_PV_SYSTEM: &str = "sim";

/// Default runner configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/seq/seq.toml";

const_assert!(MIN_STACK_SIZE <= DEFAULT_STACK_SIZE);
const_assert!(MAX_STRING_SIZE > 0);
const_assert!(QUEUE_MAX_ELEMENTS > 0);
