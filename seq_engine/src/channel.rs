//! Channel I/O coordinator.
//!
//! Owns the life cycle of each channel's binding to an external variable
//! and every get/put request issued against it.
//!
//! # Binding life cycle
//!
//! ```text
//!   Unassigned ──assign──► Connecting ──connected──► Connected
//!       ▲                      ▲                      │    ▲
//!       │                      └──────reassign────────┤    │ connected
//!       └────────assign("")───────────────────────────┤    │
//!                                                     ▼    │
//!                                                 Disconnected
//! ```
//!
//! # Locking
//!
//! Bindings, counters, monitored/synced flags live in [`InstanceState`]
//! under the instance lock. Values live in the channel buffers. No lock is
//! held while calling into the PV backend, so a backend may invoke any
//! handler synchronously. Handlers carry the binding generation (connection,
//! monitor) or a request id (get, put) and are ignored once stale.
//!
//! A disconnect force-signals the get/put completion semaphores of every
//! state set, so no waiter outlives its binding.

use crate::buffer::{ChannelBuffer, LocalView};
use crate::instance::{InstanceShared, InstanceState};
use crate::program::ChannelSpec;
use crate::error::QueueError;
use crate::queue::BoundedQueue;
use parking_lot::Mutex;
use seq_common::options::ProgramOptions;
use seq_common::pv::{
    CompletionHandler, ConnectionHandler, MonitorHandler, MonitorId, PvConnection, PvEvent,
    PvMeta, PvSeverity, PvStatus, PvType, PvValue, PvVariable,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

// ─── Types ──────────────────────────────────────────────────────────

/// Completion mode of a get or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    /// Get: synchronous unless the program has the `+a` option.
    /// Put: fire and forget.
    #[default]
    Default,
    /// Block until the request completes (bounded by the I/O timeout).
    Sync,
    /// Return at once; poll with `pv_get_complete` / `pv_put_complete`.
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Get,
    Put,
    Monitor,
}

/// One element of a channel queue: a monitor update or an anonymous put.
#[derive(Debug, Clone, Default)]
pub(crate) struct QueueEntry {
    pub(crate) value: Option<PvValue>,
    pub(crate) meta: PvMeta,
}

/// Queue of a `syncQ` channel.
#[derive(Debug)]
pub(crate) struct ChannelQueue {
    pub(crate) number: usize,
    pub(crate) entries: BoundedQueue<QueueEntry>,
    /// Serializes consumers (`pv_get_q`, `pv_flush_q`).
    reader: Mutex<()>,
}

impl ChannelQueue {
    fn new(number: usize, size: usize) -> Result<Self, QueueError> {
        Ok(Self {
            number,
            entries: BoundedQueue::new(size)?,
            reader: Mutex::new(()),
        })
    }
}

/// Runtime part of a declared channel.
#[derive(Debug)]
pub(crate) struct Channel {
    pub(crate) var_name: String,
    pub(crate) ty: PvType,
    pub(crate) count: usize,
    pub(crate) event_number: usize,
    pub(crate) queue: Option<ChannelQueue>,
    pub(crate) buffer: Mutex<ChannelBuffer>,
    /// Mirrors of the binding state readable without the instance lock.
    assigned: AtomicBool,
    db_count: AtomicUsize,
}

impl Channel {
    pub(crate) fn new(
        spec: &ChannelSpec,
        event_number: usize,
        num_state_sets: usize,
    ) -> Result<Self, QueueError> {
        let queue = spec
            .queue
            .map(|q| ChannelQueue::new(q.index, q.size))
            .transpose()?;
        Ok(Self {
            var_name: spec.var_name.clone(),
            ty: spec.ty,
            count: spec.count,
            event_number,
            queue,
            buffer: Mutex::new(ChannelBuffer::new(spec.initial_value(), num_state_sets)),
            assigned: AtomicBool::new(false),
            db_count: AtomicUsize::new(spec.count),
        })
    }

    pub(crate) fn is_assigned(&self) -> bool {
        self.assigned.load(Ordering::Acquire)
    }

    /// Elements moved per transfer: negotiated count when bound.
    pub(crate) fn transfer_count(&self) -> usize {
        if self.is_assigned() {
            self.db_count.load(Ordering::Acquire)
        } else {
            self.count
        }
    }
}

/// Live connection record of a bound channel.
pub(crate) struct Binding {
    pub(crate) pv_name: String,
    pub(crate) generation: u64,
    /// `None` while `create` is still running.
    pub(crate) variable: Option<Arc<dyn PvVariable>>,
    pub(crate) connected: bool,
    pub(crate) monitor: Option<MonitorId>,
    pub(crate) monitor_pending: bool,
    pub(crate) got_first_monitor: bool,
}

impl Binding {
    fn new(pv_name: &str, generation: u64) -> Self {
        Self {
            pv_name: pv_name.to_string(),
            generation,
            variable: None,
            connected: false,
            monitor: None,
            monitor_pending: false,
            got_first_monitor: false,
        }
    }
}

fn binding_mut(state: &mut InstanceState, ch: usize, generation: u64) -> Option<&mut Binding> {
    state.bindings[ch]
        .as_mut()
        .filter(|b| b.generation == generation)
}

enum MonitorAction {
    None,
    On(Arc<dyn PvVariable>, u64),
    Off(Arc<dyn PvVariable>, MonitorId),
}

// ─── Binding life cycle ─────────────────────────────────────────────

impl InstanceShared {
    fn connection_handler(self: &Arc<Self>, ch: usize, generation: u64) -> ConnectionHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |conn| {
            if let Some(shared) = weak.upgrade() {
                shared.on_connection(ch, generation, conn);
            }
        })
    }

    fn monitor_handler(self: &Arc<Self>, ch: usize, generation: u64) -> MonitorHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_monitor(ch, generation, event);
            }
        })
    }

    fn completion_handler(
        self: &Arc<Self>,
        ss: usize,
        ch: usize,
        kind: EventKind,
        request: u64,
    ) -> CompletionHandler {
        let weak = Arc::downgrade(self);
        Box::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_completion(ss, ch, kind, request, event);
            }
        })
    }

    /// Bind every channel that declares a PV name, then optionally wait
    /// until all of them are connected and monitored. Returns false if the
    /// instance was told to exit while waiting.
    pub(crate) fn connect_all(self: &Arc<Self>, wait: bool) -> bool {
        for (ch, spec) in self.program.channels().iter().enumerate() {
            if spec.pv_name.is_empty() {
                continue;
            }
            let pv_name = self.macros.eval(&spec.pv_name);
            if pv_name.is_empty() {
                continue;
            }
            debug!(var = %spec.var_name, pv = %pv_name, "connect");
            self.bind(ch, &pv_name);
        }
        self.pv_system.flush();

        if wait { self.wait_connected() } else { true }
    }

    fn wait_connected(&self) -> bool {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            if self.is_dying() {
                return false;
            }
            let (ac, cc, mc, gmc) = {
                let state = self.state.lock();
                (
                    state.assign_count,
                    state.connect_count,
                    state.monitor_count,
                    state.first_monitor_count,
                )
            };
            if ac == cc && mc == gmc {
                break;
            }
            if attempt > 0 {
                warn!(
                    program = %self.program.name(),
                    instance = self.instance,
                    "after {} sec: assigned={ac}, connected={cc}, monitored={mc}, got monitor={gmc}",
                    started.elapsed().as_secs()
                );
            }
            self.ready.wait_timeout(self.backoff.next(attempt));
            attempt = attempt.saturating_add(1);
        }
        info!(
            program = %self.program.name(),
            instance = self.instance,
            "all channels connected & received 1st monitor"
        );
        true
    }

    /// Create a binding of `ch` to `pv_name`. The channel must be unbound.
    fn bind(self: &Arc<Self>, ch: usize, pv_name: &str) -> PvStatus {
        let channel = &self.channels[ch];
        let generation = {
            let mut state = self.state.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.bindings[ch] = Some(Binding::new(pv_name, generation));
            state.assign_count += 1;
            if state.monitored[ch] {
                state.monitor_count += 1;
            }
            channel.db_count.store(channel.count, Ordering::Release);
            channel.assigned.store(true, Ordering::Release);
            generation
        };

        let variable = match self
            .pv_system
            .create(pv_name, self.connection_handler(ch, generation))
        {
            Ok(variable) => variable,
            Err(e) => {
                error!(var = %channel.var_name, pv = pv_name, "pvVarCreate() failure: {e}");
                if let Some(binding) = self.remove_binding(ch, Some(generation)) {
                    self.release_binding(ch, binding);
                }
                return PvStatus::Error;
            }
        };

        let current = {
            let mut state = self.state.lock();
            match binding_mut(&mut state, ch, generation) {
                Some(binding) => {
                    binding.variable = Some(Arc::clone(&variable));
                    true
                }
                None => false,
            }
        };
        if !current {
            // reassigned while create was running
            if let Err(e) = variable.destroy() {
                error!(var = %channel.var_name, pv = pv_name, "pvVarDestroy() failure: {e}");
            }
            return PvStatus::Ok;
        }
        self.reconcile_monitor(ch);
        PvStatus::Ok
    }

    /// Detach the binding of `ch` (if `generation` matches) and fix up the
    /// counters. The returned binding still has to be released.
    fn remove_binding(&self, ch: usize, generation: Option<u64>) -> Option<Binding> {
        let mut state = self.state.lock();
        let matches = state.bindings[ch]
            .as_ref()
            .is_some_and(|b| generation.is_none_or(|g| b.generation == g));
        if !matches {
            return None;
        }
        let binding = state.bindings[ch].take()?;
        state.assign_count -= 1;
        if binding.connected {
            state.connect_count -= 1;
        }
        if state.monitored[ch] {
            state.monitor_count -= 1;
            if binding.got_first_monitor {
                state.first_monitor_count -= 1;
            }
        }
        self.channels[ch].assigned.store(false, Ordering::Release);
        self.check_ready(&state);
        Some(binding)
    }

    /// Tear down a detached binding and unblock its waiters.
    fn release_binding(&self, ch: usize, binding: Binding) {
        let var_name = &self.channels[ch].var_name;
        if let Some(variable) = binding.variable {
            if let Some(id) = binding.monitor {
                if let Err(e) = variable.monitor_off(id) {
                    error!(var = %var_name, pv = %binding.pv_name, "pvVarMonitorOff() failure: {e}");
                }
            }
            if let Err(e) = variable.destroy() {
                error!(var = %var_name, pv = %binding.pv_name, "pvVarDestroy() failure: {e}");
            }
        }
        self.complete_pending(ch);
        self.wakeup(0);
    }

    /// Force-signal every state set's get/put semaphore of `ch`.
    fn complete_pending(&self, ch: usize) {
        for ss in &self.state_sets {
            ss.get_sems[ch].signal();
            ss.put_sems[ch].signal();
        }
    }

    fn check_ready(&self, state: &InstanceState) {
        if state.first_monitor_count == state.monitor_count
            && state.connect_count == state.assign_count
        {
            self.ready.signal();
        }
    }

    /// Destroy every binding (instance shutdown).
    pub(crate) fn disconnect_all(&self) {
        for ch in 0..self.channels.len() {
            if let Some(binding) = self.remove_binding(ch, None) {
                debug!(var = %self.channels[ch].var_name, pv = %binding.pv_name, "disconnect");
                self.release_binding(ch, binding);
            }
        }
        self.pv_system.flush();
    }

    fn on_connection(self: &Arc<Self>, ch: usize, generation: u64, conn: PvConnection) {
        let channel = &self.channels[ch];
        let mut disconnected = false;
        {
            let mut state = self.state.lock();
            let Some(binding) = binding_mut(&mut state, ch, generation) else {
                return;
            };
            if conn.connected {
                if binding.connected {
                    warn!(
                        var = %channel.var_name, pv = %binding.pv_name,
                        "connect event but already connected"
                    );
                } else {
                    binding.connected = true;
                    debug!(var = %channel.var_name, pv = %binding.pv_name, "connected");
                    let count = channel.count.min(conn.element_count).max(1);
                    channel.db_count.store(count, Ordering::Release);
                    state.connect_count += 1;
                    self.check_ready(&state);
                }
            } else if binding.connected {
                binding.connected = false;
                debug!(var = %channel.var_name, pv = %binding.pv_name, "disconnected");
                state.connect_count -= 1;
                disconnected = true;
            } else {
                warn!(
                    var = %channel.var_name, pv = %binding.pv_name,
                    "disconnect event but already disconnected"
                );
            }
        }
        if disconnected {
            self.complete_pending(ch);
        }
        self.reconcile_monitor(ch);
        self.wakeup(0);
    }

    /// Bring the backend subscription of `ch` in line with
    /// `monitored && connected`.
    pub(crate) fn reconcile_monitor(self: &Arc<Self>, ch: usize) {
        let action = {
            let mut state = self.state.lock();
            let monitored = state.monitored[ch];
            let mut lost_first = false;
            let action = match state.bindings[ch].as_mut() {
                Some(binding) => match binding.variable.clone() {
                    Some(variable) => {
                        let wanted = monitored && binding.connected;
                        match (wanted, binding.monitor) {
                            (true, None) if !binding.monitor_pending => {
                                binding.monitor_pending = true;
                                lost_first = std::mem::take(&mut binding.got_first_monitor);
                                MonitorAction::On(variable, binding.generation)
                            }
                            (false, Some(id)) => {
                                binding.monitor = None;
                                lost_first = std::mem::take(&mut binding.got_first_monitor);
                                MonitorAction::Off(variable, id)
                            }
                            _ => MonitorAction::None,
                        }
                    }
                    None => MonitorAction::None,
                },
                None => MonitorAction::None,
            };
            if lost_first && monitored {
                state.first_monitor_count -= 1;
            }
            action
        };

        let channel = &self.channels[ch];
        match action {
            MonitorAction::None => {}
            MonitorAction::Off(variable, id) => {
                if let Err(e) = variable.monitor_off(id) {
                    error!(var = %channel.var_name, pv = %variable.name(), "pvVarMonitorOff() failure: {e}");
                }
            }
            MonitorAction::On(variable, generation) => {
                let result = variable.monitor_on(
                    channel.ty,
                    channel.count,
                    self.monitor_handler(ch, generation),
                );
                let surplus = {
                    let mut state = self.state.lock();
                    let monitored = state.monitored[ch];
                    match (binding_mut(&mut state, ch, generation), result) {
                        (Some(binding), Ok(id)) => {
                            binding.monitor_pending = false;
                            if monitored && binding.connected {
                                binding.monitor = Some(id);
                                None
                            } else {
                                Some(id)
                            }
                        }
                        (Some(binding), Err(e)) => {
                            binding.monitor_pending = false;
                            error!(var = %channel.var_name, pv = %binding.pv_name, "pvVarMonitorOn() failure: {e}");
                            None
                        }
                        (None, Ok(id)) => Some(id),
                        (None, Err(_)) => None,
                    }
                };
                if let Some(id) = surplus {
                    if let Err(e) = variable.monitor_off(id) {
                        error!(var = %channel.var_name, pv = %variable.name(), "pvVarMonitorOff() failure: {e}");
                    }
                }
            }
        }
    }

    fn on_monitor(&self, ch: usize, generation: u64, event: PvEvent) {
        if self.state.lock().bindings[ch]
            .as_ref()
            .is_none_or(|b| b.generation != generation)
        {
            return;
        }
        self.process_event(ch, None, EventKind::Monitor, event);

        let mut state = self.state.lock();
        let monitored = state.monitored[ch];
        let first = match binding_mut(&mut state, ch, generation) {
            Some(binding) if monitored && !binding.got_first_monitor => {
                binding.got_first_monitor = true;
                true
            }
            _ => false,
        };
        if first {
            state.first_monitor_count += 1;
            self.check_ready(&state);
        }
    }

    fn on_completion(&self, ss: usize, ch: usize, kind: EventKind, request: u64, event: PvEvent) {
        let shared = &self.state_sets[ss];
        let pending = match kind {
            EventKind::Get => &shared.get_requests[ch],
            EventKind::Put => &shared.put_requests[ch],
            EventKind::Monitor => return,
        };
        if pending
            .compare_exchange(request, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(var = %self.channels[ch].var_name, request, "ignoring stale completion");
            return;
        }
        self.process_event(ch, Some(ss), kind, event);
    }

    fn event_meta(&self, ch: usize, event: &PvEvent) -> PvMeta {
        let message = if event.severity == PvSeverity::None {
            None
        } else {
            let variable = self.state.lock().bindings[ch]
                .as_ref()
                .and_then(|b| b.variable.clone());
            Some(
                variable
                    .and_then(|v| v.message())
                    .unwrap_or_else(|| "unknown".to_string()),
            )
        };
        PvMeta {
            timestamp: event.timestamp,
            status: event.alarm,
            severity: event.severity,
            message,
        }
    }

    /// Common tail of get/put completions and monitor updates.
    fn process_event(&self, ch: usize, origin: Option<usize>, kind: EventKind, event: PvEvent) {
        let channel = &self.channels[ch];

        if kind == EventKind::Monitor {
            if let Some(queue) = &channel.queue {
                self.push_queued(ch, queue, event);
                return;
            }
        }

        if event.value.is_some() {
            let meta = self.event_meta(ch, &event);
            self.write_buffer(ch, event.value.as_ref(), Some(meta), kind == EventKind::Monitor);
        } else if !event.status.is_ok() {
            let what = if kind == EventKind::Get { "get" } else { "put" };
            channel.buffer.lock().meta.set_failure(
                event.status,
                PvSeverity::Major,
                &format!("{what} completed with {}", event.status),
            );
        }

        match (kind, origin) {
            (EventKind::Get, Some(ss)) => self.state_sets[ss].get_sems[ch].signal(),
            (EventKind::Put, Some(ss)) => self.state_sets[ss].put_sems[ch].signal(),
            _ => {}
        }

        let synced = self.state.lock().synced_to[ch];
        if let Some(flag) = synced {
            self.ef_set(flag);
        }
        self.wakeup(channel.event_number);
    }

    fn push_queued(&self, ch: usize, queue: &ChannelQueue, event: PvEvent) {
        let channel = &self.channels[ch];
        let meta = self.event_meta(ch, &event);
        let overwritten = {
            let _producer = channel.buffer.lock();
            queue.entries.put(QueueEntry {
                value: event.value,
                meta,
            })
        };
        if overwritten {
            warn!(
                var = %channel.var_name,
                "monitor event: last queue element overwritten (queue is full)"
            );
        }
        let synced = self.state.lock().synced_to[ch];
        if let Some(flag) = synced {
            self.ef_set(flag);
        }
        self.wakeup(channel.event_number);
    }
}

// ─── Channel operations ─────────────────────────────────────────────

impl InstanceShared {
    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a failure in the caller's metadata: the state set's view in
    /// safe mode, the shared buffer otherwise.
    fn fail_meta(
        &self,
        view: Option<&mut LocalView>,
        ch: usize,
        status: PvStatus,
        severity: PvSeverity,
        message: &str,
    ) {
        match view {
            Some(view) => view.metas[ch].set_failure(status, severity, message),
            None => self.channels[ch]
                .buffer
                .lock()
                .meta
                .set_failure(status, severity, message),
        }
    }

    /// `Some(Disconnected)` (recorded in the caller's metadata) unless the
    /// channel is connected.
    fn check_connected(&self, view: Option<&mut LocalView>, ch: usize) -> Option<PvStatus> {
        let connected = self.state.lock().bindings[ch]
            .as_ref()
            .is_some_and(|b| b.connected);
        if connected {
            return None;
        }
        self.fail_meta(view, ch, PvStatus::Disconnected, PvSeverity::Invalid, "disconnected");
        Some(PvStatus::Disconnected)
    }

    fn bound_variable(&self, ch: usize) -> Option<Arc<dyn PvVariable>> {
        self.state.lock().bindings[ch]
            .as_ref()
            .and_then(|b| b.variable.clone())
    }

    fn current_value(&self, view: Option<&LocalView>, ch: usize) -> PvValue {
        match view {
            Some(view) => view.values[ch].clone(),
            None => self.channels[ch].buffer.lock().value.clone(),
        }
    }

    fn user_error(&self, op: &str, ch: usize, what: &str) {
        error!(
            program = %self.program.name(),
            instance = self.instance,
            var = %self.channels[ch].var_name,
            "{op}({}): user error ({what})",
            self.channels[ch].var_name
        );
    }

    /// (Re)bind `ch` to `pv_name`; an empty name leaves it anonymous.
    pub(crate) fn pv_assign(self: &Arc<Self>, ch: usize, pv_name: &str) -> PvStatus {
        debug!(var = %self.channels[ch].var_name, pv = pv_name, "assign");
        if let Some(old) = self.remove_binding(ch, None) {
            self.release_binding(ch, old);
        }
        if pv_name.is_empty() {
            return PvStatus::Ok;
        }
        let status = self.bind(ch, pv_name);
        self.pv_system.flush();
        status
    }

    pub(crate) fn pv_get(
        self: &Arc<Self>,
        ss: usize,
        mut view: Option<&mut LocalView>,
        ch: usize,
        completion: Completion,
    ) -> PvStatus {
        let channel = &self.channels[ch];
        let shared = &self.state_sets[ss];
        let sem = &shared.get_sems[ch];

        if !channel.is_assigned() {
            if self.is_safe() {
                if let Some(view) = view {
                    self.read_buffer(ss, ch, view, false);
                }
                return PvStatus::Ok;
            }
            self.user_error("pvGet", ch, "variable not assigned");
            return PvStatus::Error;
        }

        let completion = match completion {
            Completion::Default if self.options.contains(ProgramOptions::ASYNC) => Completion::Async,
            Completion::Default => Completion::Sync,
            other => other,
        };

        let mut timeout = self.io_timeout;
        if completion == Completion::Sync {
            let started = Instant::now();
            if !sem.wait_timeout(timeout) {
                error!(
                    state_set = %shared.name, var = %channel.var_name,
                    "pvGet: failed (timeout waiting for other get requests to finish)"
                );
                return PvStatus::Error;
            }
            timeout = timeout.saturating_sub(started.elapsed());
        } else if !sem.try_wait() {
            error!(
                state_set = %shared.name, var = %channel.var_name,
                "pvGet: user error (there is already a get pending for this variable/state set combination)"
            );
            return PvStatus::Error;
        }

        if let Some(status) = self.check_connected(view.as_deref_mut(), ch) {
            sem.signal();
            return status;
        }
        let Some(variable) = self.bound_variable(ch) else {
            sem.signal();
            return self
                .check_connected(view.as_deref_mut(), ch)
                .unwrap_or(PvStatus::Error);
        };

        let request = self.next_request_id();
        shared.get_requests[ch].store(request, Ordering::Release);
        let handler = self.completion_handler(ss, ch, EventKind::Get, request);
        if let Err(e) = variable.get_callback(channel.ty, channel.transfer_count(), handler) {
            shared.get_requests[ch].store(0, Ordering::Release);
            error!(state_set = %shared.name, var = %channel.var_name, "pvGet: pvVarGetCallback() failure: {e}");
            self.fail_meta(view.as_deref_mut(), ch, PvStatus::Error, PvSeverity::Major, "get failure");
            sem.signal();
            return self
                .check_connected(view.as_deref_mut(), ch)
                .unwrap_or(PvStatus::Error);
        }

        if completion == Completion::Sync {
            self.pv_system.flush();
            self.await_completion(ss, view, ch, EventKind::Get, timeout)
        } else {
            PvStatus::Ok
        }
    }

    /// Block on the completion of a synchronous get/put.
    fn await_completion(
        &self,
        ss: usize,
        mut view: Option<&mut LocalView>,
        ch: usize,
        kind: EventKind,
        timeout: Duration,
    ) -> PvStatus {
        let shared = &self.state_sets[ss];
        let (sem, pending, what) = match kind {
            EventKind::Put => (&shared.put_sems[ch], &shared.put_requests[ch], "put"),
            _ => (&shared.get_sems[ch], &shared.get_requests[ch], "get"),
        };
        if sem.wait_timeout(timeout) {
            sem.signal();
            pending.store(0, Ordering::Release);
            if let Some(status) = self.check_connected(view.as_deref_mut(), ch) {
                return status;
            }
            if kind == EventKind::Get {
                if let Some(view) = view.filter(|_| self.is_safe()) {
                    self.read_buffer(ss, ch, view, false);
                }
            }
            PvStatus::Ok
        } else {
            pending.store(0, Ordering::Release);
            sem.signal();
            warn!(
                state_set = %shared.name, var = %self.channels[ch].var_name,
                "{what} completion timeout"
            );
            self.fail_meta(
                view,
                ch,
                PvStatus::Timeout,
                PvSeverity::Major,
                &format!("{what} completion timeout"),
            );
            PvStatus::Timeout
        }
    }

    /// Whether the last asynchronous get on `ch` has completed. A
    /// disconnected channel counts as complete; its status says why.
    pub(crate) fn pv_get_complete(
        &self,
        ss: usize,
        mut view: Option<&mut LocalView>,
        ch: usize,
    ) -> bool {
        if !self.channels[ch].is_assigned() {
            if self.is_safe() {
                return true;
            }
            self.user_error("pvGetComplete", ch, "variable not assigned");
            return false;
        }
        let sem = &self.state_sets[ss].get_sems[ch];
        if !sem.try_wait() {
            return false;
        }
        sem.signal();
        if self.check_connected(view.as_deref_mut(), ch).is_none() {
            if let Some(view) = view.filter(|_| self.is_safe()) {
                self.read_buffer(ss, ch, view, false);
            }
        }
        true
    }

    pub(crate) fn pv_put(
        self: &Arc<Self>,
        ss: usize,
        mut view: Option<&mut LocalView>,
        ch: usize,
        completion: Completion,
    ) -> PvStatus {
        let channel = &self.channels[ch];
        let shared = &self.state_sets[ss];
        let sem = &shared.put_sems[ch];

        if !channel.is_assigned() {
            if self.is_safe() {
                self.anonymous_put(ch, view.as_deref());
                return PvStatus::Ok;
            }
            self.user_error("pvPut", ch, "variable not assigned");
            return PvStatus::Error;
        }
        if let Some(status) = self.check_connected(view.as_deref_mut(), ch) {
            return status;
        }

        let mut timeout = self.io_timeout;
        match completion {
            Completion::Sync => {
                let started = Instant::now();
                if !sem.wait_timeout(timeout) {
                    error!(
                        state_set = %shared.name, var = %channel.var_name,
                        "pvPut: failed (timeout waiting for other put requests to finish)"
                    );
                    return PvStatus::Error;
                }
                timeout = timeout.saturating_sub(started.elapsed());
            }
            Completion::Async => {
                if !sem.try_wait() {
                    self.fail_meta(
                        view.as_deref_mut(),
                        ch,
                        PvStatus::Error,
                        PvSeverity::Major,
                        "already one put pending",
                    );
                    error!(
                        state_set = %shared.name, var = %channel.var_name,
                        "pvPut: user error (there is already a put pending for this variable/state set combination)"
                    );
                    return PvStatus::Error;
                }
            }
            Completion::Default => {}
        }

        let value = self.current_value(view.as_deref(), ch);
        let count = channel.transfer_count();
        let Some(variable) = self.bound_variable(ch) else {
            if completion != Completion::Default {
                sem.signal();
            }
            return self
                .check_connected(view.as_deref_mut(), ch)
                .unwrap_or(PvStatus::Error);
        };

        if completion == Completion::Default {
            if let Err(e) = variable.put_no_block(&value, count) {
                error!(state_set = %shared.name, var = %channel.var_name, "pvPut: pvVarPutNoBlock() failure: {e}");
                return PvStatus::Error;
            }
            return PvStatus::Ok;
        }

        let request = self.next_request_id();
        shared.put_requests[ch].store(request, Ordering::Release);
        let handler = self.completion_handler(ss, ch, EventKind::Put, request);
        if let Err(e) = variable.put_callback(&value, count, handler) {
            shared.put_requests[ch].store(0, Ordering::Release);
            error!(state_set = %shared.name, var = %channel.var_name, "pvPut: pvVarPutCallback() failure: {e}");
            sem.signal();
            return self
                .check_connected(view.as_deref_mut(), ch)
                .unwrap_or(PvStatus::Error);
        }

        if completion == Completion::Sync {
            self.pv_system.flush();
            self.await_completion(ss, view, ch, EventKind::Put, timeout)
        } else {
            PvStatus::Ok
        }
    }

    /// Put to an anonymous channel (safe mode): write the shared buffer (or
    /// queue) and notify like a monitor update would.
    fn anonymous_put(&self, ch: usize, view: Option<&LocalView>) {
        let channel = &self.channels[ch];
        let value = self.current_value(view, ch);

        if let Some(queue) = &channel.queue {
            let overwritten = {
                let _producer = channel.buffer.lock();
                queue.entries.put(QueueEntry {
                    value: Some(value),
                    meta: PvMeta::default(),
                })
            };
            if overwritten {
                warn!(
                    var = %channel.var_name,
                    "pvPut on queued anonymous variable: last queue element overwritten (queue is full)"
                );
            }
        } else {
            let monitored = self.state.lock().monitored[ch];
            self.write_buffer(ch, Some(&value), None, monitored);
        }

        let synced = self.state.lock().synced_to[ch];
        if let Some(flag) = synced {
            self.ef_set(flag);
        }
        self.wakeup(channel.event_number);
    }

    /// Completion test over `length` channels starting at `first`.
    ///
    /// With `any` the result is true once one put has completed, otherwise
    /// once all have. When `complete` is given every channel's state is
    /// written to it and no early exit happens.
    pub(crate) fn pv_put_complete(
        &self,
        ss: usize,
        mut view: Option<&mut LocalView>,
        first: usize,
        length: usize,
        any: bool,
        mut complete: Option<&mut [bool]>,
    ) -> bool {
        let mut any_done = false;
        let mut all_done = true;
        let end = (first + length).min(self.channels.len());

        for (n, ch) in (first..end).enumerate() {
            let sem = &self.state_sets[ss].put_sems[ch];
            let done = sem.try_wait();
            if done {
                sem.signal();
                // a disconnected channel still counts as done
                let _ = self.check_connected(view.as_deref_mut(), ch);
            }
            any_done |= done;
            all_done &= done;

            match complete.as_deref_mut() {
                Some(out) => {
                    if let Some(slot) = out.get_mut(n) {
                        *slot = done;
                    }
                }
                None if any && done => break,
                None if !any && !done => break,
                None => {}
            }
        }
        if any { any_done } else { all_done }
    }

    pub(crate) fn pv_monitor(self: &Arc<Self>, ch: usize) -> PvStatus {
        {
            let mut state = self.state.lock();
            if state.bindings[ch].is_none() {
                if self.is_safe() {
                    state.monitored[ch] = true;
                    return PvStatus::Ok;
                }
                drop(state);
                self.user_error("pvMonitor", ch, "variable not assigned");
                return PvStatus::Error;
            }
            if !state.monitored[ch] {
                state.monitored[ch] = true;
                state.monitor_count += 1;
            }
        }
        self.reconcile_monitor(ch);
        PvStatus::Ok
    }

    pub(crate) fn pv_stop_monitor(self: &Arc<Self>, ch: usize) -> PvStatus {
        {
            let mut state = self.state.lock();
            let Some(got_first) = state.bindings[ch].as_mut().map(|b| b.got_first_monitor) else {
                if self.is_safe() {
                    state.monitored[ch] = false;
                    return PvStatus::Ok;
                }
                drop(state);
                self.user_error("pvStopMonitor", ch, "variable not assigned");
                return PvStatus::Error;
            };
            if state.monitored[ch] {
                state.monitored[ch] = false;
                state.monitor_count -= 1;
                if got_first {
                    state.first_monitor_count -= 1;
                    if let Some(binding) = state.bindings[ch].as_mut() {
                        binding.got_first_monitor = false;
                    }
                }
            }
        }
        self.reconcile_monitor(ch);
        PvStatus::Ok
    }

    /// Sync `ch` to event flag `flag`; `None` removes the sync.
    pub(crate) fn pv_sync(&self, ch: usize, flag: Option<usize>) {
        if let Some(f) = flag {
            if f == 0 || f > self.program.num_event_flags() {
                self.user_error("pvSync", ch, "event flag out of range");
                return;
            }
        }
        let mut state = self.state.lock();
        let old = state.synced_to[ch];
        if old == flag {
            return;
        }
        if let Some(old) = old {
            state.synced[old].retain(|&c| c != ch);
        }
        if let Some(new) = flag {
            state.synced[new].push(ch);
        }
        state.synced_to[ch] = flag;
    }

    /// Take the oldest queued update of `ch` into the caller's variable.
    /// Returns false if the queue was empty.
    pub(crate) fn pv_get_q(&self, mut view: Option<&mut LocalView>, ch: usize) -> bool {
        let channel = &self.channels[ch];
        let Some(queue) = &channel.queue else {
            self.user_error("pvGetQ", ch, "variable not queued");
            return false;
        };

        let (entry, now_empty) = {
            let _reader = queue.reader.lock();
            let entry = queue.entries.get();
            (entry, queue.entries.is_empty())
        };

        if let Some(entry) = &entry {
            let count = channel.transfer_count();
            let assigned = channel.is_assigned();
            let store = |value: &mut PvValue, meta: &mut PvMeta| {
                if let Some(v) = &entry.value {
                    value.copy_prefix_from(v, count);
                }
                if assigned {
                    meta.status = entry.meta.status;
                    meta.severity = entry.meta.severity;
                    meta.timestamp = entry.meta.timestamp;
                }
            };
            match view.as_deref_mut() {
                Some(view) => store(&mut view.values[ch], &mut view.metas[ch]),
                None => {
                    let mut buf = channel.buffer.lock();
                    let ChannelBuffer { value, meta, .. } = &mut *buf;
                    store(value, meta);
                }
            }
        }

        let mut state = self.state.lock();
        if let Some(flag) = state.synced_to[ch] {
            if now_empty && queue.entries.is_empty() {
                state.event_flags.clear(flag);
            }
        }
        entry.is_some()
    }

    /// Discard the queue of `ch` and clear its synced flag.
    pub(crate) fn pv_flush_q(&self, ch: usize) {
        let Some(queue) = &self.channels[ch].queue else {
            self.user_error("pvFlushQ", ch, "variable not queued");
            return;
        };
        {
            let _reader = queue.reader.lock();
            debug!(var = %self.channels[ch].var_name, used = queue.entries.used(), "flush queue");
            queue.entries.flush();
        }
        let mut state = self.state.lock();
        if let Some(flag) = state.synced_to[ch] {
            state.event_flags.clear(flag);
        }
    }
}
