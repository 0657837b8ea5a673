//! Event flags and wakeup.
//!
//! One bit set per instance covers every event number:
//!
//! ```text
//!   0            reserved ("wake everybody")
//!   1 ..= N      user event flags
//!   N+1 ..       one per channel, in declaration order
//! ```
//!
//! Each state set publishes the event mask of its current state. A change
//! of event `e` signals the wake semaphore of every state set whose mask
//! contains `e`. All bit set and mask mutations happen under the instance
//! lock.

use crate::buffer::LocalView;
use crate::instance::{InstanceShared, InstanceState};
use serde::Serialize;
use std::sync::atomic::Ordering;
use tracing::{debug, error};

const WORD_BITS: usize = u64::BITS as usize;

/// Growable bit set over event numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventSet {
    words: Vec<u64>,
}

impl EventSet {
    /// Empty set able to hold bits `0..num_bits` without reallocating.
    pub fn with_capacity(num_bits: usize) -> Self {
        Self {
            words: vec![0; num_bits.div_ceil(WORD_BITS)],
        }
    }

    /// Set bit `bit`, growing as needed.
    pub fn set(&mut self, bit: usize) {
        let word = bit / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (bit % WORD_BITS);
    }

    /// Clear bit `bit`.
    pub fn clear(&mut self, bit: usize) {
        if let Some(w) = self.words.get_mut(bit / WORD_BITS) {
            *w &= !(1 << (bit % WORD_BITS));
        }
    }

    /// Whether bit `bit` is set.
    pub fn test(&self, bit: usize) -> bool {
        self.words
            .get(bit / WORD_BITS)
            .is_some_and(|w| w & (1 << (bit % WORD_BITS)) != 0)
    }

    /// Clear every bit that is set in `mask`.
    pub fn clear_all(&mut self, mask: &EventSet) {
        for (w, m) in self.words.iter_mut().zip(&mask.words) {
            *w &= !m;
        }
    }

    /// True if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..WORD_BITS)
                .filter(move |b| w & (1 << b) != 0)
                .map(move |b| i * WORD_BITS + b)
        })
    }
}

impl FromIterator<usize> for EventSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = EventSet::default();
        for bit in iter {
            set.set(bit);
        }
        set
    }
}

impl InstanceShared {
    fn valid_flag(&self, flag: usize, op: &str) -> bool {
        let max = self.program.num_event_flags();
        if flag == 0 || flag > max {
            error!(
                program = %self.program.name(),
                instance = self.instance,
                "{op}({flag}): user error (event flag out of range 1..={max})"
            );
            return false;
        }
        true
    }

    /// Signal every state set waiting for `event`; `0` wakes all.
    pub(crate) fn wakeup(&self, event: usize) {
        let state = self.state.lock();
        self.wakeup_locked(&state, event);
    }

    pub(crate) fn wakeup_locked(&self, state: &InstanceState, event: usize) {
        for (ss, shared) in self.state_sets.iter().enumerate() {
            if event == 0 || state.masks[ss].test(event) {
                shared.wake.signal();
            }
        }
    }

    /// Set event flag `flag` and wake interested state sets.
    pub(crate) fn ef_set(&self, flag: usize) {
        if !self.valid_flag(flag, "efSet") {
            return;
        }
        let mut state = self.state.lock();
        state.event_flags.set(flag);
        debug!(flag, "event flag set");
        self.wakeup_locked(&state, flag);
    }

    /// Test event flag `flag`. In safe mode the channels synced to it are
    /// refreshed in `view`.
    pub(crate) fn ef_test(&self, ss: usize, view: Option<&mut LocalView>, flag: usize) -> bool {
        if !self.valid_flag(flag, "efTest") {
            return false;
        }
        let state = self.state.lock();
        let is_set = state.event_flags.test(flag);
        if let Some(view) = view.filter(|_| self.is_safe()) {
            self.read_synced_buffers(&state, ss, view, flag);
        }
        is_set
    }

    /// Clear event flag `flag`; returns its previous value.
    pub(crate) fn ef_clear(&self, flag: usize) -> bool {
        if !self.valid_flag(flag, "efClear") {
            return false;
        }
        let mut state = self.state.lock();
        let was_set = state.event_flags.test(flag);
        state.event_flags.clear(flag);
        self.wakeup_locked(&state, flag);
        was_set
    }

    /// Atomically test and clear `flag`. In safe mode the channels synced
    /// to it are refreshed in `view`.
    pub(crate) fn ef_test_and_clear(
        &self,
        ss: usize,
        view: Option<&mut LocalView>,
        flag: usize,
    ) -> bool {
        if !self.valid_flag(flag, "efTestAndClear") {
            return false;
        }
        let mut state = self.state.lock();
        let was_set = state.event_flags.test(flag);
        state.event_flags.clear(flag);
        if let Some(view) = view.filter(|_| self.is_safe()) {
            self.read_synced_buffers(&state, ss, view, flag);
        }
        was_set
    }

    /// Publish the event mask of state set `ss`'s current state.
    pub(crate) fn set_event_mask(&self, ss: usize, mask: &EventSet) {
        let mut state = self.state.lock();
        state.masks[ss].clone_from(mask);
    }

    /// Legacy event flag mode: a triggered state set consumes every event
    /// in its own mask.
    pub(crate) fn consume_masked_events(&self, ss: usize) {
        let mut state = self.state.lock();
        let InstanceState {
            event_flags, masks, ..
        } = &mut *state;
        event_flags.clear_all(&masks[ss]);
    }

    /// Ask every thread of the instance to terminate.
    pub(crate) fn request_exit(&self) {
        self.die.store(true, Ordering::SeqCst);
        self.ready.signal();
        self.wakeup(0);
    }

    pub(crate) fn is_dying(&self) -> bool {
        self.die.load(Ordering::SeqCst)
    }
}
