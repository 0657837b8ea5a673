//! Shared buffer protocol.
//!
//! Every channel owns one canonical value + metadata, guarded by the
//! channel's own mutex. In safe mode each state set additionally keeps a
//! private [`LocalView`] and the canonical buffer carries one dirty flag per
//! state set: writers set the flags, a state set copies the canonical value
//! into its view only while its flag is set (or when forced) and clears it.
//!
//! Without safe mode the state sets share the canonical buffer directly and
//! dirty flags are never consulted.
//!
//! The channel mutex is always the innermost lock.

use crate::instance::{InstanceShared, InstanceState};
use seq_common::pv::{PvMeta, PvValue};
use tracing::trace;

/// Canonical value of one channel.
#[derive(Debug, Clone)]
pub(crate) struct ChannelBuffer {
    pub(crate) value: PvValue,
    pub(crate) meta: PvMeta,
    /// One flag per state set (safe mode only).
    pub(crate) dirty: Vec<bool>,
}

impl ChannelBuffer {
    pub(crate) fn new(value: PvValue, num_state_sets: usize) -> Self {
        Self {
            value,
            meta: PvMeta::default(),
            dirty: vec![false; num_state_sets],
        }
    }
}

/// A state set's private copy of every channel (safe mode).
#[derive(Debug, Clone, Default)]
pub(crate) struct LocalView {
    pub(crate) values: Vec<PvValue>,
    pub(crate) metas: Vec<PvMeta>,
}

impl InstanceShared {
    /// Copy of all canonical values and metadata.
    pub(crate) fn snapshot_view(&self) -> LocalView {
        let mut view = LocalView {
            values: Vec::with_capacity(self.channels.len()),
            metas: Vec::with_capacity(self.channels.len()),
        };
        for channel in &self.channels {
            let buf = channel.buffer.lock();
            view.values.push(buf.value.clone());
            view.metas.push(buf.meta.clone());
        }
        view
    }

    /// Write into the canonical buffer of `ch`.
    ///
    /// `meta` is stored only for bound channels. With `dirtify` set (safe
    /// mode) every state set's dirty flag is raised.
    pub(crate) fn write_buffer(
        &self,
        ch: usize,
        value: Option<&PvValue>,
        meta: Option<PvMeta>,
        dirtify: bool,
    ) {
        let channel = &self.channels[ch];
        let count = channel.transfer_count();
        let assigned = channel.is_assigned();
        let mut buf = channel.buffer.lock();

        if let Some(value) = value {
            buf.value.copy_prefix_from(value, count);
        }
        if let Some(meta) = meta.filter(|_| assigned) {
            buf.meta = meta;
        }
        if dirtify && self.is_safe() {
            buf.dirty.iter_mut().for_each(|d| *d = true);
        }
        trace!(var = %channel.var_name, value = %buf.value, "buffer written");
    }

    /// Copy the canonical buffer of `ch` into state set `ss`'s view.
    /// With `dirty_only` the copy is skipped unless the dirty flag is set.
    pub(crate) fn read_buffer(&self, ss: usize, ch: usize, view: &mut LocalView, dirty_only: bool) {
        let channel = &self.channels[ch];
        let count = channel.transfer_count();
        let assigned = channel.is_assigned();
        let mut buf = channel.buffer.lock();

        if dirty_only && !buf.dirty[ss] {
            return;
        }
        view.values[ch].copy_prefix_from(&buf.value, count);
        if assigned {
            view.metas[ch] = buf.meta.clone();
        }
        buf.dirty[ss] = false;
    }

    /// Refresh every dirty channel in `view`.
    pub(crate) fn read_all_buffers(&self, ss: usize, view: &mut LocalView) {
        for ch in 0..self.channels.len() {
            self.read_buffer(ss, ch, view, true);
        }
    }

    /// Refresh the dirty channels synced to event flag `flag`.
    /// Called with the instance lock held.
    pub(crate) fn read_synced_buffers(
        &self,
        state: &InstanceState,
        ss: usize,
        view: &mut LocalView,
        flag: usize,
    ) {
        if let Some(channels) = state.synced.get(flag) {
            for &ch in channels {
                self.read_buffer(ss, ch, view, true);
            }
        }
    }
}
