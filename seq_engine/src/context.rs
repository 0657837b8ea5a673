//! Execution context of state program code.
//!
//! Every entry/exit/delay/event/action function and every program hook
//! receives a [`StateSetContext`]. It resolves variable access to the right
//! copy (the state set's private view in safe mode, the shared buffer
//! otherwise) and carries the identity of the calling state set into the
//! channel, event flag and delay operations.
//!
//! # Operations
//!
//! | Group | Methods |
//! |-------|---------|
//! | variables | `value`, `set_value`, `get_f64`, `set_f64`, `get_str`, `set_str`, `meta` |
//! | channel I/O | `pv_assign`, `pv_get`, `pv_get_complete`, `pv_put`, `pv_put_complete`, `pv_monitor`, `pv_stop_monitor`, `pv_sync`, `pv_get_q`, `pv_flush_q`, `pv_flush` |
//! | channel info | `pv_channel_count`, `pv_assign_count`, `pv_connect_count`, `pv_monitor_count`, `pv_connected`, `pv_assigned`, `pv_count`, `pv_name`, `pv_status`, `pv_severity`, `pv_message`, `pv_time_stamp`, `pv_index` |
//! | event flags | `ef_set`, `ef_test`, `ef_clear`, `ef_test_and_clear` |
//! | delays | `delay_init`, `delay` |
//! | misc | `opt_get`, `mac_value_get`, `exit`, `log` |

use crate::channel::Completion;
use crate::instance::InstanceShared;
use crate::program::{ChannelId, EventFlag};
use crate::state_set::StateSetLocal;
use seq_common::pv::{PvMeta, PvSeverity, PvStatus, PvValue};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::error;

/// Handle passed to state program code.
pub struct StateSetContext<'a> {
    shared: &'a Arc<InstanceShared>,
    ss: usize,
    local: &'a mut StateSetLocal,
}

impl<'a> StateSetContext<'a> {
    pub(crate) fn new(
        shared: &'a Arc<InstanceShared>,
        ss: usize,
        local: &'a mut StateSetLocal,
    ) -> Self {
        Self { shared, ss, local }
    }

    fn check(&self, ch: ChannelId, op: &str) -> Option<usize> {
        if ch.0 < self.shared.channels.len() {
            Some(ch.0)
        } else {
            error!(
                program = %self.shared.program.name(),
                "{op}: channel index {} out of range",
                ch.0
            );
            None
        }
    }

    // ─── Identity ───────────────────────────────────────────────────

    pub fn program_name(&self) -> &str {
        self.shared.program.name()
    }

    pub fn instance_number(&self) -> u32 {
        self.shared.instance
    }

    /// Name of the calling state set.
    pub fn state_set_name(&self) -> &str {
        &self.shared.state_sets[self.ss].name
    }

    pub fn state_set_index(&self) -> usize {
        self.ss
    }

    /// Time since the current state was entered (or its timers reset).
    pub fn time_in_state(&self) -> Duration {
        self.local.time_entered.elapsed()
    }

    // ─── Variables ──────────────────────────────────────────────────

    /// Current value of the variable behind `ch`.
    pub fn value(&self, ch: ChannelId) -> PvValue {
        let Some(ch) = self.check(ch, "value") else {
            return PvValue::double(0.0);
        };
        match &self.local.view {
            Some(view) => view.values[ch].clone(),
            None => self.shared.channels[ch].buffer.lock().value.clone(),
        }
    }

    /// Overwrite the variable. The value is converted to the declared type
    /// and cut to the declared element count.
    pub fn set_value(&mut self, ch: ChannelId, value: &PvValue) {
        let Some(ch) = self.check(ch, "set_value") else {
            return;
        };
        let count = self.shared.channels[ch].count;
        match self.local.view.as_mut() {
            Some(view) => view.values[ch].copy_prefix_from(value, count),
            None => self.shared.channels[ch]
                .buffer
                .lock()
                .value
                .copy_prefix_from(value, count),
        }
    }

    /// First element as a number (0 for non-numeric strings).
    pub fn get_f64(&self, ch: ChannelId) -> f64 {
        self.value(ch).as_f64()
    }

    /// Set element 0 from a number.
    pub fn set_f64(&mut self, ch: ChannelId, value: f64) {
        self.set_element(ch, 0, value);
    }

    /// Set element `index` from a number. Out-of-range indices are ignored.
    pub fn set_element(&mut self, ch: ChannelId, index: usize, value: f64) {
        let Some(ch) = self.check(ch, "set_element") else {
            return;
        };
        match self.local.view.as_mut() {
            Some(view) => {
                view.values[ch].set_f64(index, value);
            }
            None => {
                self.shared.channels[ch].buffer.lock().value.set_f64(index, value);
            }
        }
    }

    /// First element as text.
    pub fn get_str(&self, ch: ChannelId) -> String {
        self.value(ch).get_string(0).unwrap_or_default()
    }

    pub fn set_str(&mut self, ch: ChannelId, value: &str) {
        self.set_value(ch, &PvValue::string(value));
    }

    /// Metadata seen by the calling state set.
    pub fn meta(&self, ch: ChannelId) -> PvMeta {
        let Some(ch) = self.check(ch, "meta") else {
            return PvMeta::default();
        };
        match &self.local.view {
            Some(view) => view.metas[ch].clone(),
            None => self.shared.channels[ch].buffer.lock().meta.clone(),
        }
    }

    // ─── Channel I/O ────────────────────────────────────────────────

    /// Bind `ch` to `pv_name` (macros are not expanded). An empty name
    /// makes the channel anonymous.
    pub fn pv_assign(&mut self, ch: ChannelId, pv_name: &str) -> PvStatus {
        match self.check(ch, "pvAssign") {
            Some(ch) => self.shared.pv_assign(ch, pv_name),
            None => PvStatus::Error,
        }
    }

    pub fn pv_get(&mut self, ch: ChannelId, completion: Completion) -> PvStatus {
        match self.check(ch, "pvGet") {
            Some(ch) => self
                .shared
                .pv_get(self.ss, self.local.view.as_mut(), ch, completion),
            None => PvStatus::Error,
        }
    }

    pub fn pv_get_complete(&mut self, ch: ChannelId) -> bool {
        match self.check(ch, "pvGetComplete") {
            Some(ch) => self
                .shared
                .pv_get_complete(self.ss, self.local.view.as_mut(), ch),
            None => false,
        }
    }

    pub fn pv_put(&mut self, ch: ChannelId, completion: Completion) -> PvStatus {
        match self.check(ch, "pvPut") {
            Some(ch) => self
                .shared
                .pv_put(self.ss, self.local.view.as_mut(), ch, completion),
            None => PvStatus::Error,
        }
    }

    /// Completion of the puts on `length` channels starting at `ch`.
    /// See [`pv_put_complete_into`](Self::pv_put_complete_into) for the
    /// per-channel form.
    pub fn pv_put_complete(&mut self, ch: ChannelId, length: usize, any: bool) -> bool {
        match self.check(ch, "pvPutComplete") {
            Some(first) => self.shared.pv_put_complete(
                self.ss,
                self.local.view.as_mut(),
                first,
                length,
                any,
                None,
            ),
            None => false,
        }
    }

    /// Like [`pv_put_complete`](Self::pv_put_complete), additionally writing
    /// each channel's completion into `complete`.
    pub fn pv_put_complete_into(
        &mut self,
        ch: ChannelId,
        length: usize,
        any: bool,
        complete: &mut [bool],
    ) -> bool {
        match self.check(ch, "pvPutComplete") {
            Some(first) => self.shared.pv_put_complete(
                self.ss,
                self.local.view.as_mut(),
                first,
                length,
                any,
                Some(complete),
            ),
            None => false,
        }
    }

    pub fn pv_monitor(&mut self, ch: ChannelId) -> PvStatus {
        match self.check(ch, "pvMonitor") {
            Some(ch) => self.shared.pv_monitor(ch),
            None => PvStatus::Error,
        }
    }

    pub fn pv_stop_monitor(&mut self, ch: ChannelId) -> PvStatus {
        match self.check(ch, "pvStopMonitor") {
            Some(ch) => self.shared.pv_stop_monitor(ch),
            None => PvStatus::Error,
        }
    }

    /// Sync `ch` to `flag`; `None` removes the sync.
    pub fn pv_sync(&mut self, ch: ChannelId, flag: Option<EventFlag>) {
        if let Some(ch) = self.check(ch, "pvSync") {
            self.shared.pv_sync(ch, flag.map(|f| f.0));
        }
    }

    /// Take the oldest queued element into the variable.
    pub fn pv_get_q(&mut self, ch: ChannelId) -> bool {
        match self.check(ch, "pvGetQ") {
            Some(ch) => self.shared.pv_get_q(self.local.view.as_mut(), ch),
            None => false,
        }
    }

    pub fn pv_flush_q(&mut self, ch: ChannelId) {
        if let Some(ch) = self.check(ch, "pvFlushQ") {
            self.shared.pv_flush_q(ch);
        }
    }

    /// Flush outstanding requests of the PV system.
    pub fn pv_flush(&self) {
        self.shared.pv_system.flush();
    }

    // ─── Channel info ───────────────────────────────────────────────

    pub fn pv_channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    pub fn pv_assign_count(&self) -> usize {
        self.shared.state.lock().assign_count
    }

    pub fn pv_connect_count(&self) -> usize {
        self.shared.state.lock().connect_count
    }

    pub fn pv_monitor_count(&self) -> usize {
        self.shared.state.lock().monitor_count
    }

    pub fn pv_connected(&self, ch: ChannelId) -> bool {
        self.check(ch, "pvConnected").is_some_and(|ch| {
            self.shared.state.lock().bindings[ch]
                .as_ref()
                .is_some_and(|b| b.connected)
        })
    }

    pub fn pv_assigned(&self, ch: ChannelId) -> bool {
        self.check(ch, "pvAssigned")
            .is_some_and(|ch| self.shared.channels[ch].is_assigned())
    }

    /// Elements transferred per request.
    pub fn pv_count(&self, ch: ChannelId) -> usize {
        self.check(ch, "pvCount")
            .map_or(0, |ch| self.shared.channels[ch].transfer_count())
    }

    /// PV name bound to `ch`, empty if anonymous.
    pub fn pv_name(&self, ch: ChannelId) -> String {
        self.check(ch, "pvName")
            .and_then(|ch| {
                self.shared.state.lock().bindings[ch]
                    .as_ref()
                    .map(|b| b.pv_name.clone())
            })
            .unwrap_or_default()
    }

    pub fn pv_status(&self, ch: ChannelId) -> PvStatus {
        self.meta(ch).status
    }

    pub fn pv_severity(&self, ch: ChannelId) -> PvSeverity {
        self.meta(ch).severity
    }

    pub fn pv_message(&self, ch: ChannelId) -> Option<String> {
        self.meta(ch).message
    }

    pub fn pv_time_stamp(&self, ch: ChannelId) -> SystemTime {
        self.meta(ch).timestamp
    }

    /// Index of `ch` in the instance's channel table.
    pub fn pv_index(&self, ch: ChannelId) -> usize {
        ch.0
    }

    // ─── Event flags ────────────────────────────────────────────────

    pub fn ef_set(&mut self, flag: EventFlag) {
        self.shared.ef_set(flag.0);
    }

    pub fn ef_test(&mut self, flag: EventFlag) -> bool {
        self.shared.ef_test(self.ss, self.local.view.as_mut(), flag.0)
    }

    /// Clear `flag`, returning whether it was set.
    pub fn ef_clear(&mut self, flag: EventFlag) -> bool {
        self.shared.ef_clear(flag.0)
    }

    pub fn ef_test_and_clear(&mut self, flag: EventFlag) -> bool {
        self.shared
            .ef_test_and_clear(self.ss, self.local.view.as_mut(), flag.0)
    }

    // ─── Delays ─────────────────────────────────────────────────────

    /// Register delay `id`. Only meaningful from a state's delay function.
    pub fn delay_init(&mut self, id: usize, secs: f64) {
        if !self.local.delays.init(id, secs) {
            error!(
                state_set = %self.state_set_name(),
                "delay_init({id}): user error (delay id out of range)"
            );
        }
    }

    /// Whether delay `id` has expired since the state was entered.
    pub fn delay(&mut self, id: usize) -> bool {
        let elapsed = self.local.elapsed();
        match self.local.delays.test(id, elapsed) {
            Some(expired) => expired,
            None => {
                error!(
                    state_set = %self.state_set_name(),
                    "delay({id}): user error (delay not registered)"
                );
                false
            }
        }
    }

    // ─── Misc ───────────────────────────────────────────────────────

    /// Test a program option by its letter (`a c d e m r s`).
    pub fn opt_get(&self, letter: char) -> bool {
        self.shared.options.test_letter(letter)
    }

    /// Value of launch macro `name`.
    pub fn mac_value_get(&self, name: &str) -> Option<String> {
        self.shared.macros.get(name).map(str::to_string)
    }

    /// Ask the whole instance to terminate.
    pub fn exit(&self) {
        self.shared.request_exit();
    }

    /// Write a line to the instance's user log.
    pub fn log(&self, message: &str) {
        let thread = std::thread::current();
        let name = thread.name().unwrap_or(&self.shared.thread_name);
        self.shared.user_log.write(name, message);
    }
}
