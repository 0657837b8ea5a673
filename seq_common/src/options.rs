//! Program and state option bit sets.
//!
//! Program options are fixed when a program is compiled and apply to every
//! instance; state options tune self-transition behavior of a single state.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Program-wide options.
    ///
    /// Each option has a one-letter name used by `opt_get` (`+a`, `+c`, ...).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ProgramOptions: u32 {
        /// `d`: debug output.
        const DEBUG = 0x0001;
        /// `a`: default get completion is asynchronous.
        const ASYNC = 0x0002;
        /// `c`: wait for all channels to connect before starting state sets.
        const CONN  = 0x0004;
        /// `r`: reentrant program (one variable block per instance).
        const REENT = 0x0008;
        /// `e`: new event flag mode (no implicit clearing on transitions).
        const NEWEF = 0x0010;
        /// `m`: program generates its own main.
        const MAIN  = 0x0020;
        /// `s`: safe mode (per state set variable copies).
        const SAFE  = 0x0040;
    }
}

impl ProgramOptions {
    /// Option named by its one-letter code.
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'a' => Some(Self::ASYNC),
            'c' => Some(Self::CONN),
            'd' => Some(Self::DEBUG),
            'e' => Some(Self::NEWEF),
            'm' => Some(Self::MAIN),
            'r' => Some(Self::REENT),
            's' => Some(Self::SAFE),
            _ => None,
        }
    }

    /// Whether the option named by `letter` is set. Unknown letters read as unset.
    pub fn test_letter(&self, letter: char) -> bool {
        Self::from_letter(letter).is_some_and(|opt| self.contains(opt))
    }

    /// Option string in `+x-y` form, in letter order `a c d e m r s`.
    pub fn to_option_string(&self) -> String {
        ['a', 'c', 'd', 'e', 'm', 'r', 's']
            .iter()
            .map(|&c| format!("{}{c}", if self.test_letter(c) { '+' } else { '-' }))
            .collect()
    }
}

impl Default for ProgramOptions {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Per-state options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct StateOptions: u8 {
        /// `-t`: don't reset delay timers on a self-transition.
        const NO_RESET_TIMERS   = 0x01;
        /// `+e`: run the entry action on a self-transition.
        const DO_ENTRY_FROM_SELF = 0x02;
        /// `+x`: run the exit action on a self-transition.
        const DO_EXIT_TO_SELF   = 0x04;
    }
}

impl Default for StateOptions {
    fn default() -> Self {
        Self::empty()
    }
}
