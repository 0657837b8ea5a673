//! Program descriptor.
//!
//! A [`ProgramDescriptor`] is the immutable template of a state program:
//! its channels, state sets, states, event flag count, options and hooks.
//! It is produced once (by a code generator or by hand through
//! [`ProgramBuilder`]) and shared by every instance.
//!
//! # Usage
//!
//! ```rust,no_run
//! use seq_engine::program::*;
//! use seq_common::pv::PvType;
//!
//! const V: ChannelId = ChannelId(0);
//!
//! let program = ProgramBuilder::new("level")
//!     .channel(ChannelSpec::new("v", PvType::Double).assign("demo:v").monitor())
//!     .state_set(
//!         StateSetSpec::new("main").state(
//!             StateSpec::new("low", FnState::new(|ctx| {
//!                 (ctx.get_f64(V) > 5.0).then_some(Transition::to(0, 1))
//!             }))
//!             .watch(V),
//!         ),
//!     )
//!     .build()
//!     .expect("valid program");
//! ```

use crate::context::StateSetContext;
use crate::error::ProgramError;
use crate::event_flags::EventSet;
use seq_common::consts::SEQ_MAGIC;
use seq_common::options::{ProgramOptions, StateOptions};
use seq_common::pv::{PvType, PvValue};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

// ─── Identifiers ────────────────────────────────────────────────────

/// Index of a channel in its program's channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelId(pub usize);

/// Event flag number, `1..=num_event_flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EventFlag(pub usize);

/// Something a state can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRef {
    Flag(EventFlag),
    Channel(ChannelId),
}

impl From<EventFlag> for EventRef {
    fn from(flag: EventFlag) -> Self {
        EventRef::Flag(flag)
    }
}

impl From<ChannelId> for EventRef {
    fn from(ch: ChannelId) -> Self {
        EventRef::Channel(ch)
    }
}

// ─── Channels ───────────────────────────────────────────────────────

/// Queue attached to a channel (`syncQ`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue number, `0..num_queues`.
    pub index: usize,
    /// Capacity in elements.
    pub size: usize,
}

/// Declared program variable.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub var_name: String,
    /// PV name template (macros allowed); empty for an anonymous channel.
    pub pv_name: String,
    pub ty: PvType,
    pub count: usize,
    pub monitored: bool,
    pub sync: Option<EventFlag>,
    pub queue: Option<QueueSpec>,
    pub initial: Option<PvValue>,
}

impl ChannelSpec {
    /// Single-element, anonymous, unmonitored variable.
    pub fn new(var_name: impl Into<String>, ty: PvType) -> Self {
        Self {
            var_name: var_name.into(),
            pv_name: String::new(),
            ty,
            count: 1,
            monitored: false,
            sync: None,
            queue: None,
            initial: None,
        }
    }

    /// Array of `count` elements.
    pub fn count(mut self, count: usize) -> Self {
        self.count = count.max(1);
        self
    }

    /// Bind to the PV named by `template` at launch.
    pub fn assign(mut self, template: impl Into<String>) -> Self {
        self.pv_name = template.into();
        self
    }

    pub fn monitor(mut self) -> Self {
        self.monitored = true;
        self
    }

    /// Set `flag` on every update of this channel.
    pub fn sync(mut self, flag: EventFlag) -> Self {
        self.sync = Some(flag);
        self
    }

    /// Buffer monitor updates in queue `index` of `size` elements.
    pub fn queue(mut self, index: usize, size: usize) -> Self {
        self.queue = Some(QueueSpec { index, size });
        self
    }

    pub fn initial(mut self, value: PvValue) -> Self {
        self.initial = Some(value);
        self
    }

    /// Value the variable holds before anything is written to it.
    pub(crate) fn initial_value(&self) -> PvValue {
        let mut value = PvValue::zeroed(self.ty, self.count);
        if let Some(init) = &self.initial {
            value.copy_prefix_from(init, self.count);
        }
        value
    }
}

// ─── States ─────────────────────────────────────────────────────────

/// Transition selected by a state's event function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Transition number passed to the action function.
    pub number: usize,
    /// Index of the next state within the state set.
    pub next_state: usize,
}

impl Transition {
    pub fn to(number: usize, next_state: usize) -> Self {
        Self { number, next_state }
    }
}

/// Compiled code of one state.
///
/// | Method | Called |
/// |--------|--------|
/// | `entry` | on entering from another state (or self, with `DO_ENTRY_FROM_SELF`) |
/// | `delays` | on every entry, registers the state's delays |
/// | `event` | after every wakeup until it returns a transition |
/// | `action` | once for the selected transition; may redirect `next_state` |
/// | `exit` | before leaving for another state (or self, with `DO_EXIT_TO_SELF`) |
pub trait StateBehavior: Send + Sync {
    fn entry(&self, _ctx: &mut StateSetContext<'_>) {}

    fn exit(&self, _ctx: &mut StateSetContext<'_>) {}

    fn delays(&self, _ctx: &mut StateSetContext<'_>) {}

    /// Evaluate the state's conditions. `None` means keep waiting.
    fn event(&self, ctx: &mut StateSetContext<'_>) -> Option<Transition>;

    fn action(&self, _ctx: &mut StateSetContext<'_>, _transition: usize, _next_state: &mut usize) {}
}

type ContextFn = Box<dyn Fn(&mut StateSetContext<'_>) + Send + Sync>;
type EventFn = Box<dyn Fn(&mut StateSetContext<'_>) -> Option<Transition> + Send + Sync>;
type ActionFn = Box<dyn Fn(&mut StateSetContext<'_>, usize, &mut usize) + Send + Sync>;

/// [`StateBehavior`] built from closures.
pub struct FnState {
    entry: Option<ContextFn>,
    exit: Option<ContextFn>,
    delays: Option<ContextFn>,
    event: EventFn,
    action: Option<ActionFn>,
}

impl FnState {
    pub fn new(
        event: impl Fn(&mut StateSetContext<'_>) -> Option<Transition> + Send + Sync + 'static,
    ) -> Self {
        Self {
            entry: None,
            exit: None,
            delays: None,
            event: Box::new(event),
            action: None,
        }
    }

    pub fn on_entry(mut self, f: impl Fn(&mut StateSetContext<'_>) + Send + Sync + 'static) -> Self {
        self.entry = Some(Box::new(f));
        self
    }

    pub fn on_exit(mut self, f: impl Fn(&mut StateSetContext<'_>) + Send + Sync + 'static) -> Self {
        self.exit = Some(Box::new(f));
        self
    }

    pub fn with_delays(
        mut self,
        f: impl Fn(&mut StateSetContext<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.delays = Some(Box::new(f));
        self
    }

    pub fn on_action(
        mut self,
        f: impl Fn(&mut StateSetContext<'_>, usize, &mut usize) + Send + Sync + 'static,
    ) -> Self {
        self.action = Some(Box::new(f));
        self
    }
}

impl StateBehavior for FnState {
    fn entry(&self, ctx: &mut StateSetContext<'_>) {
        if let Some(f) = &self.entry {
            f(ctx);
        }
    }

    fn exit(&self, ctx: &mut StateSetContext<'_>) {
        if let Some(f) = &self.exit {
            f(ctx);
        }
    }

    fn delays(&self, ctx: &mut StateSetContext<'_>) {
        if let Some(f) = &self.delays {
            f(ctx);
        }
    }

    fn event(&self, ctx: &mut StateSetContext<'_>) -> Option<Transition> {
        (self.event)(ctx)
    }

    fn action(&self, ctx: &mut StateSetContext<'_>, transition: usize, next_state: &mut usize) {
        if let Some(f) = &self.action {
            f(ctx, transition, next_state);
        }
    }
}

/// One node of a state set.
#[derive(Clone)]
pub struct StateSpec {
    name: String,
    behavior: Arc<dyn StateBehavior>,
    watch: Vec<EventRef>,
    options: StateOptions,
    mask: EventSet,
}

impl StateSpec {
    pub fn new(name: impl Into<String>, behavior: impl StateBehavior + 'static) -> Self {
        Self {
            name: name.into(),
            behavior: Arc::new(behavior),
            watch: Vec::new(),
            options: StateOptions::empty(),
            mask: EventSet::default(),
        }
    }

    /// Wake this state on changes of `event`.
    pub fn watch(mut self, event: impl Into<EventRef>) -> Self {
        self.watch.push(event.into());
        self
    }

    pub fn options(mut self, options: StateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state_options(&self) -> StateOptions {
        self.options
    }

    /// Resolved event numbers this state waits for.
    pub fn mask(&self) -> &EventSet {
        &self.mask
    }

    pub(crate) fn behavior(&self) -> &dyn StateBehavior {
        self.behavior.as_ref()
    }
}

impl fmt::Debug for StateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSpec")
            .field("name", &self.name)
            .field("watch", &self.watch)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// One independently scheduled state machine.
#[derive(Debug, Clone)]
pub struct StateSetSpec {
    name: String,
    states: Vec<StateSpec>,
    num_delays: usize,
}

impl StateSetSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: Vec::new(),
            num_delays: 0,
        }
    }

    /// Maximum number of delays any state of this set registers.
    pub fn delays(mut self, num_delays: usize) -> Self {
        self.num_delays = num_delays;
        self
    }

    /// Append a state; the first one is the initial state.
    pub fn state(mut self, state: StateSpec) -> Self {
        self.states.push(state);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn states(&self) -> &[StateSpec] {
        &self.states
    }

    pub fn num_delays(&self) -> usize {
        self.num_delays
    }
}

// ─── Descriptor ─────────────────────────────────────────────────────

/// Program-level hook (init, entry, exit).
pub type Hook = Arc<dyn Fn(&mut StateSetContext<'_>) + Send + Sync>;

/// Immutable program template.
#[derive(Clone)]
pub struct ProgramDescriptor {
    magic: u32,
    name: String,
    options: ProgramOptions,
    params: String,
    num_event_flags: usize,
    num_queues: usize,
    channels: Vec<ChannelSpec>,
    state_sets: Vec<StateSetSpec>,
    init: Option<Hook>,
    entry: Option<Hook>,
    exit: Option<Hook>,
}

impl ProgramDescriptor {
    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> ProgramOptions {
        self.options
    }

    /// Default macro definitions, applied before the launch macros.
    pub fn params(&self) -> &str {
        &self.params
    }

    pub fn num_event_flags(&self) -> usize {
        self.num_event_flags
    }

    pub fn num_queues(&self) -> usize {
        self.num_queues
    }

    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    pub fn state_sets(&self) -> &[StateSetSpec] {
        &self.state_sets
    }

    /// Event number of channel `ch`.
    pub fn event_number(&self, ch: usize) -> usize {
        self.num_event_flags + 1 + ch
    }

    /// Size of the event bit set (event numbers `0..num_events`).
    pub fn num_events(&self) -> usize {
        self.num_event_flags + 1 + self.channels.len()
    }

    pub(crate) fn init_hook(&self) -> Option<&Hook> {
        self.init.as_ref()
    }

    pub(crate) fn entry_hook(&self) -> Option<&Hook> {
        self.entry.as_ref()
    }

    pub(crate) fn exit_hook(&self) -> Option<&Hook> {
        self.exit.as_ref()
    }
}

impl fmt::Debug for ProgramDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramDescriptor")
            .field("name", &self.name)
            .field("magic", &self.magic)
            .field("options", &self.options)
            .field("num_event_flags", &self.num_event_flags)
            .field("channels", &self.channels.len())
            .field("state_sets", &self.state_sets)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ProgramDescriptor`].
pub struct ProgramBuilder {
    inner: ProgramDescriptor,
}

impl ProgramBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: ProgramDescriptor {
                magic: SEQ_MAGIC,
                name: name.into(),
                options: ProgramOptions::empty(),
                params: String::new(),
                num_event_flags: 0,
                num_queues: 0,
                channels: Vec::new(),
                state_sets: Vec::new(),
                init: None,
                entry: None,
                exit: None,
            },
        }
    }

    /// Override the version tag (checked at launch).
    pub fn magic(mut self, magic: u32) -> Self {
        self.inner.magic = magic;
        self
    }

    pub fn options(mut self, options: ProgramOptions) -> Self {
        self.inner.options = options;
        self
    }

    pub fn params(mut self, params: impl Into<String>) -> Self {
        self.inner.params = params.into();
        self
    }

    pub fn event_flags(mut self, count: usize) -> Self {
        self.inner.num_event_flags = count;
        self
    }

    /// Append a channel; its [`ChannelId`] is its position.
    pub fn channel(mut self, spec: ChannelSpec) -> Self {
        self.inner.channels.push(spec);
        self
    }

    pub fn state_set(mut self, spec: StateSetSpec) -> Self {
        self.inner.state_sets.push(spec);
        self
    }

    pub fn init(mut self, hook: impl Fn(&mut StateSetContext<'_>) + Send + Sync + 'static) -> Self {
        self.inner.init = Some(Arc::new(hook));
        self
    }

    pub fn entry(mut self, hook: impl Fn(&mut StateSetContext<'_>) + Send + Sync + 'static) -> Self {
        self.inner.entry = Some(Arc::new(hook));
        self
    }

    pub fn exit(mut self, hook: impl Fn(&mut StateSetContext<'_>) + Send + Sync + 'static) -> Self {
        self.inner.exit = Some(Arc::new(hook));
        self
    }

    /// Validate references and resolve state event masks.
    ///
    /// # Errors
    ///
    /// - `NoStateSets` / `EmptyStateSet` for missing states
    /// - `UnknownEventFlag` / `UnknownChannel` for dangling references
    /// - `InvalidQueue` for zero-sized, duplicate or non-contiguous queue numbers
    pub fn build(self) -> Result<ProgramDescriptor, ProgramError> {
        let mut program = self.inner;
        let name = program.name.clone();

        if program.state_sets.is_empty() {
            return Err(ProgramError::NoStateSets(name));
        }
        if let Some(ss) = program.state_sets.iter().find(|ss| ss.states.is_empty()) {
            return Err(ProgramError::EmptyStateSet {
                program: name,
                state_set: ss.name.clone(),
            });
        }

        let max_flag = program.num_event_flags;
        let check_flag = |flag: EventFlag| {
            if flag.0 == 0 || flag.0 > max_flag {
                Err(ProgramError::UnknownEventFlag {
                    program: name.clone(),
                    flag: flag.0,
                    max: max_flag,
                })
            } else {
                Ok(flag.0)
            }
        };

        let mut queue_owner: Vec<Option<usize>> = Vec::new();
        for (ch, spec) in program.channels.iter().enumerate() {
            if let Some(flag) = spec.sync {
                check_flag(flag)?;
            }
            let Some(queue) = spec.queue else { continue };
            let invalid = |reason: &str| ProgramError::InvalidQueue {
                program: name.clone(),
                var: spec.var_name.clone(),
                reason: reason.to_string(),
            };
            if queue.size == 0 {
                return Err(invalid("size must be at least 1"));
            }
            if queue.index >= queue_owner.len() {
                queue_owner.resize(queue.index + 1, None);
            }
            if queue_owner[queue.index].replace(ch).is_some() {
                return Err(invalid("queue number used by more than one variable"));
            }
        }
        if let Some(gap) = queue_owner.iter().position(Option::is_none) {
            return Err(ProgramError::InvalidQueue {
                program: name.clone(),
                var: String::new(),
                reason: format!("queue number {gap} is not used by any variable"),
            });
        }
        program.num_queues = queue_owner.len();

        let num_channels = program.channels.len();
        let num_events = program.num_events();
        for ss in &mut program.state_sets {
            for state in &mut ss.states {
                let mut mask = EventSet::with_capacity(num_events);
                for event in &state.watch {
                    let bit = match *event {
                        EventRef::Flag(flag) => check_flag(flag)?,
                        EventRef::Channel(ChannelId(ch)) if ch < num_channels => {
                            max_flag + 1 + ch
                        }
                        EventRef::Channel(ChannelId(ch)) => {
                            return Err(ProgramError::UnknownChannel {
                                program: name.clone(),
                                index: ch,
                            });
                        }
                    };
                    mask.set(bit);
                }
                state.mask = mask;
            }
        }
        Ok(program)
    }
}
