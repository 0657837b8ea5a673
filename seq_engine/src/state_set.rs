//! State set scheduler.
//!
//! Every state set runs [`run_state_set`] on its own thread:
//!
//! ```text
//!   ┌──► publish event mask of current state
//!   │    entry action (new state, or self with DO_ENTRY_FROM_SELF)
//!   │    reset timers (new state, or self without NO_RESET_TIMERS)
//!   │    clear delays, run the state's delay registration
//!   │    ┌──► wait for wakeup (bounded by the nearest unexpired delay)
//!   │    │    exit requested? ──► return
//!   │    │    refresh dirty channels (safe mode)
//!   │    └─── evaluate event conditions until a transition fires
//!   │    action of the transition (may redirect the next state)
//!   │    exit action (other state, or self with DO_EXIT_TO_SELF)
//!   └─── previous = current, current = next
//! ```
//!
//! The loop holds no lock while running user code. What the admin reports
//! show about a state set is published into [`StateSetStatus`].

use crate::buffer::LocalView;
use crate::context::StateSetContext;
use crate::instance::InstanceShared;
use crate::sync::Semaphore;
use parking_lot::Mutex;
use seq_common::consts::DELAY_TOLERANCE_SECS;
use seq_common::options::{ProgramOptions, StateOptions};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

// ─── Delays ─────────────────────────────────────────────────────────

/// Delays registered by the current state.
#[derive(Debug, Clone, Default)]
pub(crate) struct DelayList {
    delays: Vec<f64>,
    expired: Vec<bool>,
    active: usize,
}

impl DelayList {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            delays: vec![0.0; capacity],
            expired: vec![false; capacity],
            active: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.active = 0;
        self.delays.iter_mut().for_each(|d| *d = 0.0);
        self.expired.iter_mut().for_each(|e| *e = false);
    }

    /// Register delay `id` of `secs` seconds. False if `id` is out of range.
    pub(crate) fn init(&mut self, id: usize, secs: f64) -> bool {
        if id >= self.delays.len() {
            return false;
        }
        self.delays[id] = secs;
        self.expired[id] = false;
        self.active = self.active.max(id + 1);
        true
    }

    /// Whether delay `id` has expired `elapsed` seconds after state entry.
    pub(crate) fn test(&mut self, id: usize, elapsed: f64) -> Option<bool> {
        if id >= self.active {
            return None;
        }
        if self.expired[id] || elapsed > self.delays[id] - DELAY_TOLERANCE_SECS {
            self.expired[id] = true;
        }
        Some(self.expired[id])
    }

    /// Time until the nearest unexpired delay, `None` without delays.
    /// A delay found to be due is marked expired and yields zero.
    pub(crate) fn timeout(&mut self, elapsed: f64) -> Option<Duration> {
        if self.active == 0 {
            return None;
        }
        let mut nearest: Option<f64> = None;
        for id in 0..self.active {
            if self.expired[id] {
                continue;
            }
            let delay = self.delays[id];
            if elapsed >= delay {
                self.expired[id] = true;
                return Some(Duration::ZERO);
            }
            nearest = Some(nearest.map_or(delay, |n: f64| n.min(delay)));
        }
        nearest.map(|delay| Duration::from_secs_f64((delay - elapsed).max(0.0)))
    }

    /// Registered delays in seconds.
    pub(crate) fn active(&self) -> &[f64] {
        &self.delays[..self.active]
    }
}

// ─── State set data ─────────────────────────────────────────────────

/// Published view of a running state set.
#[derive(Debug, Clone)]
pub(crate) struct StateSetStatus {
    pub(crate) current: usize,
    pub(crate) previous: Option<usize>,
    pub(crate) time_entered: Instant,
    pub(crate) delays: Vec<f64>,
    pub(crate) thread_name: Option<String>,
    pub(crate) thread_id: Option<ThreadId>,
    pub(crate) os_tid: Option<i64>,
    pub(crate) transitions: u64,
}

impl Default for StateSetStatus {
    fn default() -> Self {
        Self {
            current: 0,
            previous: None,
            time_entered: Instant::now(),
            delays: Vec::new(),
            thread_name: None,
            thread_id: None,
            os_tid: None,
            transitions: 0,
        }
    }
}

/// Part of a state set visible to other threads.
#[derive(Debug)]
pub(crate) struct StateSetShared {
    pub(crate) name: String,
    pub(crate) wake: Semaphore,
    /// Full while no get is pending on the channel.
    pub(crate) get_sems: Vec<Semaphore>,
    pub(crate) put_sems: Vec<Semaphore>,
    /// Id of the outstanding request per channel, 0 if none.
    pub(crate) get_requests: Vec<AtomicU64>,
    pub(crate) put_requests: Vec<AtomicU64>,
    pub(crate) status: Mutex<StateSetStatus>,
}

impl StateSetShared {
    pub(crate) fn new(name: &str, num_channels: usize) -> Self {
        Self {
            name: name.to_string(),
            wake: Semaphore::new(false),
            get_sems: (0..num_channels).map(|_| Semaphore::new(true)).collect(),
            put_sems: (0..num_channels).map(|_| Semaphore::new(true)).collect(),
            get_requests: (0..num_channels).map(|_| AtomicU64::new(0)).collect(),
            put_requests: (0..num_channels).map(|_| AtomicU64::new(0)).collect(),
            status: Mutex::new(StateSetStatus::default()),
        }
    }

    /// Record the calling thread as this state set's thread.
    pub(crate) fn attach_current_thread(&self) {
        let thread = std::thread::current();
        let mut status = self.status.lock();
        status.thread_name = thread.name().map(str::to_string);
        status.thread_id = Some(thread.id());
        status.os_tid = os_tid();
    }
}

#[cfg(target_os = "linux")]
fn os_tid() -> Option<i64> {
    Some(i64::from(nix::unistd::gettid().as_raw()))
}

#[cfg(not(target_os = "linux"))]
fn os_tid() -> Option<i64> {
    None
}

/// Thread-owned part of a state set.
#[derive(Debug)]
pub(crate) struct StateSetLocal {
    /// Private variable copies (safe mode only).
    pub(crate) view: Option<LocalView>,
    pub(crate) delays: DelayList,
    pub(crate) time_entered: Instant,
    pub(crate) current: usize,
    pub(crate) previous: Option<usize>,
}

impl StateSetLocal {
    pub(crate) fn new(num_delays: usize, view: Option<LocalView>) -> Self {
        Self {
            view,
            delays: DelayList::new(num_delays),
            time_entered: Instant::now(),
            current: 0,
            previous: None,
        }
    }

    pub(crate) fn elapsed(&self) -> f64 {
        self.time_entered.elapsed().as_secs_f64()
    }
}

// ─── Scheduler ──────────────────────────────────────────────────────

fn publish(shared: &InstanceShared, ss: usize, local: &StateSetLocal, transitioned: bool) {
    let mut status = shared.state_sets[ss].status.lock();
    status.current = local.current;
    status.previous = local.previous;
    status.time_entered = local.time_entered;
    status.delays.clear();
    status.delays.extend_from_slice(local.delays.active());
    if transitioned {
        status.transitions += 1;
    }
}

/// Run state set `ss` until the instance is told to exit.
pub(crate) fn run_state_set(shared: &Arc<InstanceShared>, ss: usize, local: &mut StateSetLocal) {
    let spec = &shared.program.state_sets()[ss];
    let states = spec.states();
    let wake = &shared.state_sets[ss].wake;
    let new_ef = shared.options.contains(ProgramOptions::NEWEF);

    debug!(program = %shared.program.name(), state_set = %spec.name(), "state set started");

    if let Some(view) = local.view.as_mut() {
        shared.read_all_buffers(ss, view);
    }
    local.current = 0;
    local.previous = None;

    loop {
        let state = &states[local.current];
        let behavior = state.behavior();
        let options = state.state_options();
        let entering = local.previous != Some(local.current);

        shared.set_event_mask(ss, state.mask());

        if entering || options.contains(StateOptions::DO_ENTRY_FROM_SELF) {
            behavior.entry(&mut StateSetContext::new(shared, ss, local));
        }
        shared.pv_system.flush();

        if entering || !options.contains(StateOptions::NO_RESET_TIMERS) {
            local.time_entered = Instant::now();
        }
        local.delays.reset();
        behavior.delays(&mut StateSetContext::new(shared, ss, local));
        publish(shared, ss, local, false);

        // evaluate the conditions once before the first wait
        wake.signal();

        let transition = loop {
            match local.delays.timeout(local.elapsed()) {
                Some(timeout) => {
                    wake.wait_timeout(timeout);
                }
                None => wake.wait(),
            }
            if shared.is_dying() {
                debug!(state_set = %spec.name(), "state set exiting");
                return;
            }
            if let Some(view) = local.view.as_mut() {
                shared.read_all_buffers(ss, view);
            }
            let fired = behavior.event(&mut StateSetContext::new(shared, ss, local));
            if fired.is_some() && !new_ef {
                shared.consume_masked_events(ss);
            }
            if let Some(transition) = fired {
                break transition;
            }
        };

        let mut next = transition.next_state;
        behavior.action(
            &mut StateSetContext::new(shared, ss, local),
            transition.number,
            &mut next,
        );
        if shared.is_dying() {
            debug!(state_set = %spec.name(), "state set exiting");
            return;
        }

        if next >= states.len() {
            error!(
                program = %shared.program.name(),
                state_set = %spec.name(),
                state = %state.name(),
                "transition {} to invalid state {next}: user error (staying in current state)",
                transition.number
            );
            next = local.current;
        }

        if next != local.current || options.contains(StateOptions::DO_EXIT_TO_SELF) {
            behavior.exit(&mut StateSetContext::new(shared, ss, local));
        }

        trace!(
            state_set = %spec.name(),
            from = %state.name(),
            to = %states[next].name(),
            "transition"
        );
        local.previous = Some(local.current);
        local.current = next;
        publish(shared, ss, local, true);
    }
}
