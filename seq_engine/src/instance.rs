//! Program instances.
//!
//! An instance is one running copy of a program descriptor: its channels,
//! event flags, state sets and threads. [`InstanceShared`] is the state all
//! of its threads (and PV backend callbacks) share; [`Instance`] is the
//! public handle to it.
//!
//! # Instance life cycle
//!
//! ```text
//!   launch ──► main thread: priority, init hook (shared variables)
//!              safe mode: copy variables into every state set's view
//!              connect channels (wait with backoff if +c)
//!              safe mode: set flags synced to anonymous channels
//!              entry hook
//!              spawn state sets 1..n ("<name>_<n>"), run state set 0 inline
//!              join state sets, exit hook
//!              disconnect, leave the registry
//! ```
//!
//! An exit request during the connect wait skips the entry and exit hooks.

use crate::backoff::ConnectBackoff;
use crate::channel::{Binding, Channel};
use crate::context::StateSetContext;
use crate::error::{ProgramError, SeqError, SeqResult};
use crate::event_flags::EventSet;
use crate::log::UserLog;
use crate::macros::MacroTable;
use crate::program::{EventFlag, ProgramDescriptor};
use crate::pv_registry::PvSystemRegistry;
use crate::state_set::{StateSetLocal, StateSetShared, run_state_set};
use crate::sync::Semaphore;
use parking_lot::Mutex;
use seq_common::config::EngineConfig;
use seq_common::consts::SEQ_MAGIC;
use seq_common::options::ProgramOptions;
use seq_common::pv::{PvMeta, PvSystem, PvValue};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info};

// ─── Shared state ───────────────────────────────────────────────────

/// Everything guarded by the instance lock.
pub(crate) struct InstanceState {
    pub(crate) event_flags: EventSet,
    /// Event mask of each state set's current state.
    pub(crate) masks: Vec<EventSet>,
    pub(crate) assign_count: usize,
    pub(crate) connect_count: usize,
    pub(crate) monitor_count: usize,
    pub(crate) first_monitor_count: usize,
    pub(crate) bindings: Vec<Option<Binding>>,
    pub(crate) monitored: Vec<bool>,
    pub(crate) synced_to: Vec<Option<usize>>,
    /// Channels synced to each flag, indexed by flag number.
    pub(crate) synced: Vec<Vec<usize>>,
    pub(crate) next_generation: u64,
}

impl InstanceState {
    fn new(program: &ProgramDescriptor) -> Self {
        let channels = program.channels();
        let mut synced = vec![Vec::new(); program.num_event_flags() + 1];
        for (ch, spec) in channels.iter().enumerate() {
            if let Some(EventFlag(flag)) = spec.sync {
                synced[flag].push(ch);
            }
        }
        Self {
            event_flags: EventSet::with_capacity(program.num_events()),
            masks: vec![EventSet::default(); program.state_sets().len()],
            assign_count: 0,
            connect_count: 0,
            monitor_count: 0,
            first_monitor_count: 0,
            bindings: channels.iter().map(|_| None).collect(),
            monitored: channels.iter().map(|c| c.monitored).collect(),
            synced_to: channels.iter().map(|c| c.sync.map(|f| f.0)).collect(),
            synced,
            next_generation: 0,
        }
    }
}

/// State shared by the threads of one instance.
pub(crate) struct InstanceShared {
    pub(crate) program: Arc<ProgramDescriptor>,
    pub(crate) instance: u32,
    pub(crate) thread_name: String,
    pub(crate) options: ProgramOptions,
    pub(crate) priority: u32,
    pub(crate) stack_size: usize,
    pub(crate) debug: u32,
    pub(crate) macros: MacroTable,
    pub(crate) pv_system: Arc<dyn PvSystem>,
    pub(crate) io_timeout: Duration,
    pub(crate) backoff: ConnectBackoff,
    pub(crate) state: Mutex<InstanceState>,
    pub(crate) channels: Vec<Channel>,
    pub(crate) state_sets: Vec<StateSetShared>,
    pub(crate) die: AtomicBool,
    /// Signalled when all channels are connected and monitored.
    pub(crate) ready: Semaphore,
    pub(crate) next_request: AtomicU64,
    pub(crate) user_log: UserLog,
}

/// An instance built from its launch parameters that has not been given
/// its instance number yet.
pub(crate) struct PreparedInstance(InstanceShared);

impl PreparedInstance {
    pub(crate) fn numbered(mut self, instance: u32) -> InstanceShared {
        self.0.instance = instance;
        self.0
    }
}

impl InstanceShared {
    /// Resolve the launch parameters of a new instance of `program`. Opens
    /// the `logfile`, so the registry calls this outside its lock.
    ///
    /// # Errors
    ///
    /// - `ProgramError::BadMagic` for a descriptor of another engine version
    /// - `SeqError::UnknownPvSystem` if the `pvsys` macro names no registered system
    /// - `SeqError::Queue` if a channel queue cannot be created
    pub(crate) fn prepare(
        program: Arc<ProgramDescriptor>,
        launch_macros: &str,
        stack_size: Option<usize>,
        config: &EngineConfig,
        pv_systems: &PvSystemRegistry,
    ) -> SeqResult<PreparedInstance> {
        if program.magic() != SEQ_MAGIC {
            return Err(ProgramError::BadMagic {
                program: program.name().to_string(),
                found: program.magic(),
                expected: SEQ_MAGIC,
            }
            .into());
        }

        let mut macros = MacroTable::parse(program.params());
        if let Err(e) = macros.extend_from(launch_macros) {
            error!(program = %program.name(), "{e}");
        }

        let thread_name = macros
            .get("name")
            .filter(|n| !n.is_empty())
            .unwrap_or(program.name())
            .to_string();
        let stack_size = config.stack_size(macros.get_parsed("stack").or(stack_size));
        let priority = config.priority(macros.get_parsed("priority"));
        let debug = macros.get_parsed::<u32>("debug").unwrap_or(0);
        let pv_system = pv_systems.get(macros.get("pvsys").unwrap_or(config.pv_system.as_str()))?;
        let user_log = UserLog::open(macros.get("logfile"));

        let num_state_sets = program.state_sets().len();
        let channels = program
            .channels()
            .iter()
            .enumerate()
            .map(|(ch, spec)| Channel::new(spec, program.event_number(ch), num_state_sets))
            .collect::<Result<Vec<_>, _>>()?;
        let state_sets = program
            .state_sets()
            .iter()
            .map(|ss| StateSetShared::new(ss.name(), channels.len()))
            .collect();

        Ok(PreparedInstance(Self {
            options: program.options(),
            state: Mutex::new(InstanceState::new(&program)),
            program,
            instance: 0,
            thread_name,
            priority,
            stack_size,
            debug,
            macros,
            pv_system,
            io_timeout: config.io_timeout(),
            backoff: ConnectBackoff::from_config(config),
            channels,
            state_sets,
            die: AtomicBool::new(false),
            ready: Semaphore::new(false),
            next_request: AtomicU64::new(0),
            user_log,
        }))
    }

    pub(crate) fn is_safe(&self) -> bool {
        self.options.contains(ProgramOptions::SAFE)
    }

    fn local_for(&self, ss: usize) -> StateSetLocal {
        let view = self.is_safe().then(|| self.snapshot_view());
        StateSetLocal::new(self.program.state_sets()[ss].num_delays(), view)
    }

    fn run_hook(self: &Arc<Self>, hook: Option<&crate::program::Hook>, local: &mut StateSetLocal) {
        if let Some(hook) = hook {
            hook(&mut StateSetContext::new(self, 0, local));
        }
    }
}

// ─── Threads ────────────────────────────────────────────────────────

/// Set SCHED_FIFO with the instance priority.
///
/// No-op when the `rt` feature is not enabled.
#[cfg(feature = "rt")]
fn rt_set_scheduler(priority: u32) {
    let priority = priority.clamp(1, 99) as i32;
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        tracing::warn!("sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}");
    }
}

#[cfg(not(feature = "rt"))]
fn rt_set_scheduler(_priority: u32) {}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run state set `ss` on the calling thread. A panic in state program code
/// takes the whole instance down.
fn run_guarded(shared: &Arc<InstanceShared>, ss: usize, local: &mut StateSetLocal) {
    shared.state_sets[ss].attach_current_thread();
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| run_state_set(shared, ss, local))) {
        error!(
            program = %shared.program.name(),
            instance = shared.instance,
            state_set = %shared.state_sets[ss].name,
            "state set panicked: {}",
            panic_message(payload.as_ref())
        );
        shared.request_exit();
    }
}

/// Body of the instance main thread.
pub(crate) fn run_instance(shared: Arc<InstanceShared>, on_exit: impl FnOnce(&Arc<InstanceShared>)) {
    rt_set_scheduler(shared.priority);
    let program = Arc::clone(&shared.program);
    debug!(
        program = %program.name(),
        instance = shared.instance,
        thread = %shared.thread_name,
        priority = shared.priority,
        stack_size = shared.stack_size,
        debug = shared.debug,
        "instance starting"
    );

    let mut init = StateSetLocal::new(0, None);
    shared.run_hook(program.init_hook(), &mut init);

    let wait = shared.options.contains(ProgramOptions::CONN);
    if shared.connect_all(wait) {
        if shared.is_safe() {
            for (ch, channel) in shared.channels.iter().enumerate() {
                let synced = shared.state.lock().synced_to[ch];
                if let Some(flag) = synced.filter(|_| !channel.is_assigned()) {
                    shared.ef_set(flag);
                }
            }
        }

        let mut first = shared.local_for(0);
        shared.run_hook(program.entry_hook(), &mut first);

        let mut workers = Vec::new();
        for ss in 1..shared.state_sets.len() {
            let mut local = shared.local_for(ss);
            let worker = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}_{ss}", shared.thread_name))
                .stack_size(shared.stack_size)
                .spawn(move || {
                    rt_set_scheduler(worker.priority);
                    run_guarded(&worker, ss, &mut local);
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!(
                        program = %program.name(),
                        state_set = %shared.state_sets[ss].name,
                        "failed to spawn state set thread: {e}"
                    );
                    shared.request_exit();
                }
            }
        }

        run_guarded(&shared, 0, &mut first);
        for worker in workers {
            if worker.join().is_err() {
                error!(program = %program.name(), "state set thread panicked");
            }
        }

        shared.run_hook(program.exit_hook(), &mut first);
    }

    shared.disconnect_all();
    on_exit(&shared);
    info!(
        "Instance {} of sequencer program \"{}\" terminated",
        shared.instance,
        program.name()
    );
}

// ─── Public handles ─────────────────────────────────────────────────

/// Channel counters of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ChannelCounts {
    pub channels: usize,
    pub assigned: usize,
    pub connected: usize,
    pub monitored: usize,
    pub first_monitors: usize,
}

/// Handle to a running (or finished) program instance.
#[derive(Clone)]
pub struct Instance {
    pub(crate) shared: Arc<InstanceShared>,
}

impl Instance {
    pub(crate) fn new(shared: Arc<InstanceShared>) -> Self {
        Self { shared }
    }

    pub fn program_name(&self) -> &str {
        self.shared.program.name()
    }

    pub fn program(&self) -> &Arc<ProgramDescriptor> {
        &self.shared.program
    }

    pub fn instance_number(&self) -> u32 {
        self.shared.instance
    }

    /// Name of the main thread (`name` macro or program name).
    pub fn thread_name(&self) -> &str {
        &self.shared.thread_name
    }

    pub fn options(&self) -> ProgramOptions {
        self.shared.options
    }

    pub fn priority(&self) -> u32 {
        self.shared.priority
    }

    pub fn stack_size(&self) -> usize {
        self.shared.stack_size
    }

    pub fn pv_system_name(&self) -> &'static str {
        self.shared.pv_system.name()
    }

    /// Value of launch macro `name`.
    pub fn macro_value(&self, name: &str) -> Option<String> {
        self.shared.macros.get(name).map(str::to_string)
    }

    /// Ask every thread of the instance to terminate.
    pub fn request_exit(&self) {
        self.shared.request_exit();
    }

    pub fn is_exiting(&self) -> bool {
        self.shared.is_dying()
    }

    pub fn state_set_names(&self) -> Vec<String> {
        self.shared.state_sets.iter().map(|ss| ss.name.clone()).collect()
    }

    /// Name of the current state of state set `ss`.
    pub fn current_state(&self, ss: usize) -> Option<String> {
        let shared = self.shared.state_sets.get(ss)?;
        let current = shared.status.lock().current;
        self.shared.program.state_sets()[ss]
            .states()
            .get(current)
            .map(|s| s.name().to_string())
    }

    /// Time state set `ss` has spent in its current state.
    pub fn time_in_state(&self, ss: usize) -> Option<Duration> {
        let shared = self.shared.state_sets.get(ss)?;
        Some(shared.status.lock().time_entered.elapsed())
    }

    /// Number of transitions state set `ss` has taken.
    pub fn transitions(&self, ss: usize) -> Option<u64> {
        let shared = self.shared.state_sets.get(ss)?;
        Some(shared.status.lock().transitions)
    }

    fn channel_index(&self, var_name: &str) -> Option<usize> {
        self.shared
            .channels
            .iter()
            .position(|c| c.var_name == var_name)
    }

    /// Shared value of variable `var_name`.
    pub fn channel_value(&self, var_name: &str) -> Option<PvValue> {
        let ch = self.channel_index(var_name)?;
        Some(self.shared.channels[ch].buffer.lock().value.clone())
    }

    /// Shared metadata of variable `var_name`.
    pub fn channel_meta(&self, var_name: &str) -> Option<PvMeta> {
        let ch = self.channel_index(var_name)?;
        Some(self.shared.channels[ch].buffer.lock().meta.clone())
    }

    pub fn ef_is_set(&self, flag: EventFlag) -> bool {
        self.shared.state.lock().event_flags.test(flag.0)
    }

    /// Set an event flag from outside the program.
    pub fn ef_set(&self, flag: EventFlag) {
        self.shared.ef_set(flag.0);
    }

    pub fn channel_counts(&self) -> ChannelCounts {
        let state = self.shared.state.lock();
        ChannelCounts {
            channels: self.shared.channels.len(),
            assigned: state.assign_count,
            connected: state.connect_count,
            monitored: state.monitor_count,
            first_monitors: state.first_monitor_count,
        }
    }

    /// Thread ids of the state sets that have started.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.shared
            .state_sets
            .iter()
            .filter_map(|ss| ss.status.lock().thread_id)
            .collect()
    }

    /// Whether both handles refer to the same instance.
    pub fn same_as(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("program", &self.program_name())
            .field("instance", &self.instance_number())
            .field("thread", &self.thread_name())
            .finish()
    }
}

/// Owner of an instance's main thread.
#[derive(Debug)]
pub struct InstanceHandle {
    instance: Instance,
    thread: Option<JoinHandle<()>>,
}

impl InstanceHandle {
    pub(crate) fn new(instance: Instance, thread: JoinHandle<()>) -> Self {
        Self {
            instance,
            thread: Some(thread),
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// True once the main thread has returned.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the main thread to return.
    ///
    /// # Errors
    /// Returns `SeqError::Panicked` if the main thread panicked.
    pub fn join(mut self) -> SeqResult<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|payload| SeqError::Panicked(panic_message(payload.as_ref()))),
            None => Ok(()),
        }
    }

    /// Request exit and wait for the instance to terminate.
    pub fn stop(self) -> SeqResult<()> {
        self.instance.request_exit();
        self.join()
    }
}
