//! Admin reports.
//!
//! A [`ShowQuery`] selects what to report; the result is a [`ShowReport`]
//! that serializes to JSON (tagged by `kind`) and renders as a text table.
//!
//! | Query | Scope | Content |
//! |-------|-------|---------|
//! | `Program` | instance | options, counters, state sets with their states, delays and pending I/O |
//! | `Channels` | instance | every channel, optionally filtered |
//! | `Queues` | instance | every channel queue |
//! | `Stats` | registry | channel totals, optionally listing channels |
//! | `All` | registry | one row per instance with its current states |

use crate::instance::Instance;
use crate::registry::Registry;
use seq_common::pv::{PvSeverity, PvStatus, PvType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::UNIX_EPOCH;

/// What to report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShowQuery {
    Program,
    /// `filter`: leading `+` keeps connected channels only, leading `-`
    /// disconnected ones; the rest must occur in the variable or PV name.
    Channels { filter: Option<String> },
    Queues,
    /// Level 0 counts only, 1 lists disconnected channels, 2 lists all.
    Stats { level: u8 },
    All,
}

// ─── Report types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StateSetReport {
    pub name: String,
    pub thread_name: Option<String>,
    pub thread_id: Option<String>,
    pub os_tid: Option<i64>,
    pub first_state: String,
    pub current_state: String,
    pub previous_state: Option<String>,
    pub time_in_state_secs: f64,
    pub transitions: u64,
    /// Per channel: a get is outstanding.
    pub get_in_progress: Vec<bool>,
    pub put_in_progress: Vec<bool>,
    pub delays: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgramReport {
    pub program: String,
    pub instance: u32,
    pub thread_name: String,
    pub pv_system: String,
    pub options: String,
    pub priority: u32,
    pub stack_size: usize,
    pub debug: u32,
    pub channels: usize,
    pub assigned: usize,
    pub connected: usize,
    pub monitored: usize,
    pub first_monitors: usize,
    pub queues: usize,
    pub event_flags: usize,
    pub state_sets: Vec<StateSetReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelReport {
    pub index: usize,
    pub var_name: String,
    #[serde(rename = "type")]
    pub ty: PvType,
    pub count: usize,
    pub value: String,
    pub pv_name: Option<String>,
    pub connected: bool,
    pub monitored: bool,
    pub synced_to: Option<usize>,
    pub queue: Option<usize>,
    pub status: PvStatus,
    pub severity: PvSeverity,
    pub message: Option<String>,
    pub timestamp_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    pub queue: usize,
    pub var_name: String,
    pub capacity: usize,
    pub used: usize,
    pub element_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsEntry {
    pub program: String,
    pub instance: u32,
    pub var_name: String,
    pub pv_name: String,
    pub connected: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsReport {
    pub programs: usize,
    pub channels: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub listed: Vec<StatsEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceRow {
    pub program: String,
    pub instance: u32,
    pub thread_name: String,
    /// `(state set, current state)` pairs.
    pub state_sets: Vec<(String, String)>,
}

/// Result of a [`ShowQuery`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShowReport {
    Program(ProgramReport),
    Channels {
        program: String,
        instance: u32,
        channels: Vec<ChannelReport>,
    },
    Queues {
        program: String,
        instance: u32,
        queues: Vec<QueueReport>,
    },
    Stats(StatsReport),
    All { instances: Vec<InstanceRow> },
}

// ─── Collection ─────────────────────────────────────────────────────

fn channel_filter(filter: Option<&str>) -> (Option<bool>, &str) {
    match filter {
        Some(f) if f.starts_with('+') => (Some(true), &f[1..]),
        Some(f) if f.starts_with('-') => (Some(false), &f[1..]),
        Some(f) => (None, f),
        None => (None, ""),
    }
}

impl Instance {
    fn program_report(&self) -> ProgramReport {
        let shared = &self.shared;
        let counts = self.channel_counts();
        let program = &shared.program;

        let state_sets = shared
            .state_sets
            .iter()
            .zip(program.state_sets())
            .map(|(ss, spec)| {
                let status = ss.status.lock().clone();
                let state_name = |i: usize| {
                    spec.states()
                        .get(i)
                        .map(|s| s.name().to_string())
                        .unwrap_or_default()
                };
                StateSetReport {
                    name: ss.name.clone(),
                    thread_name: status.thread_name.clone(),
                    thread_id: status.thread_id.map(|id| format!("{id:?}")),
                    os_tid: status.os_tid,
                    first_state: state_name(0),
                    current_state: state_name(status.current),
                    previous_state: status.previous.map(state_name),
                    time_in_state_secs: status.time_entered.elapsed().as_secs_f64(),
                    transitions: status.transitions,
                    get_in_progress: ss.get_sems.iter().map(|s| !s.is_full()).collect(),
                    put_in_progress: ss.put_sems.iter().map(|s| !s.is_full()).collect(),
                    delays: status.delays,
                }
            })
            .collect();

        ProgramReport {
            program: program.name().to_string(),
            instance: shared.instance,
            thread_name: shared.thread_name.clone(),
            pv_system: shared.pv_system.name().to_string(),
            options: shared.options.to_option_string(),
            priority: shared.priority,
            stack_size: shared.stack_size,
            debug: shared.debug,
            channels: counts.channels,
            assigned: counts.assigned,
            connected: counts.connected,
            monitored: counts.monitored,
            first_monitors: counts.first_monitors,
            queues: program.num_queues(),
            event_flags: program.num_event_flags(),
            state_sets,
        }
    }

    fn channel_reports(&self, filter: Option<&str>) -> Vec<ChannelReport> {
        let shared = &self.shared;
        let (want_connected, pattern) = channel_filter(filter);
        let state = shared.state.lock();

        shared
            .channels
            .iter()
            .enumerate()
            .filter_map(|(ch, channel)| {
                let binding = state.bindings[ch].as_ref();
                let connected = binding.is_some_and(|b| b.connected);
                let pv_name = binding.map(|b| b.pv_name.clone());
                if want_connected.is_some_and(|want| want != connected) {
                    return None;
                }
                if !pattern.is_empty()
                    && !channel.var_name.contains(pattern)
                    && !pv_name.as_deref().is_some_and(|n| n.contains(pattern))
                {
                    return None;
                }
                let buf = channel.buffer.lock();
                Some(ChannelReport {
                    index: ch,
                    var_name: channel.var_name.clone(),
                    ty: channel.ty,
                    count: channel.transfer_count(),
                    value: buf.value.to_string(),
                    pv_name,
                    connected,
                    monitored: state.monitored[ch],
                    synced_to: state.synced_to[ch],
                    queue: channel.queue.as_ref().map(|q| q.number),
                    status: buf.meta.status,
                    severity: buf.meta.severity,
                    message: buf.meta.message.clone(),
                    timestamp_secs: buf
                        .meta
                        .timestamp
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs_f64())
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    fn queue_reports(&self) -> Vec<QueueReport> {
        let mut queues: Vec<QueueReport> = self
            .shared
            .channels
            .iter()
            .filter_map(|channel| {
                let queue = channel.queue.as_ref()?;
                Some(QueueReport {
                    queue: queue.number,
                    var_name: channel.var_name.clone(),
                    capacity: queue.entries.capacity(),
                    used: queue.entries.used(),
                    element_size: channel.ty.element_size() * channel.count,
                })
            })
            .collect();
        queues.sort_by_key(|q| q.queue);
        queues
    }

    fn add_stats(&self, level: u8, stats: &mut StatsReport) {
        stats.programs += 1;
        let state = self.shared.state.lock();
        for (ch, channel) in self.shared.channels.iter().enumerate() {
            let Some(binding) = state.bindings[ch].as_ref() else {
                continue;
            };
            stats.channels += 1;
            if binding.connected {
                stats.connected += 1;
            } else {
                stats.disconnected += 1;
            }
            if level >= 2 || (level == 1 && !binding.connected) {
                stats.listed.push(StatsEntry {
                    program: self.program_name().to_string(),
                    instance: self.instance_number(),
                    var_name: channel.var_name.clone(),
                    pv_name: binding.pv_name.clone(),
                    connected: binding.connected,
                });
            }
        }
    }

    fn row(&self) -> InstanceRow {
        InstanceRow {
            program: self.program_name().to_string(),
            instance: self.instance_number(),
            thread_name: self.thread_name().to_string(),
            state_sets: self
                .state_set_names()
                .into_iter()
                .enumerate()
                .map(|(ss, name)| (name, self.current_state(ss).unwrap_or_default()))
                .collect(),
        }
    }

    /// Report on this instance. `Stats` and `All` cover this instance only.
    pub fn report(&self, query: &ShowQuery) -> ShowReport {
        match query {
            ShowQuery::Program => ShowReport::Program(self.program_report()),
            ShowQuery::Channels { filter } => ShowReport::Channels {
                program: self.program_name().to_string(),
                instance: self.instance_number(),
                channels: self.channel_reports(filter.as_deref()),
            },
            ShowQuery::Queues => ShowReport::Queues {
                program: self.program_name().to_string(),
                instance: self.instance_number(),
                queues: self.queue_reports(),
            },
            ShowQuery::Stats { level } => {
                let mut stats = StatsReport::default();
                self.add_stats(*level, &mut stats);
                ShowReport::Stats(stats)
            }
            ShowQuery::All => ShowReport::All {
                instances: vec![self.row()],
            },
        }
    }
}

impl Registry {
    /// Report over all live instances: one report per instance for the
    /// per-instance queries, one aggregate for `Stats` and `All`.
    pub fn report(&self, query: &ShowQuery) -> Vec<ShowReport> {
        let instances = self.instances();
        match query {
            ShowQuery::Stats { level } => {
                let mut stats = StatsReport::default();
                for instance in &instances {
                    instance.add_stats(*level, &mut stats);
                }
                vec![ShowReport::Stats(stats)]
            }
            ShowQuery::All => vec![ShowReport::All {
                instances: instances.iter().map(Instance::row).collect(),
            }],
            _ => instances.iter().map(|i| i.report(query)).collect(),
        }
    }
}

// ─── Text rendering ─────────────────────────────────────────────────

fn flags(v: &[bool]) -> String {
    v.iter().map(|&b| if b { '1' } else { '0' }).collect()
}

impl fmt::Display for ShowReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShowReport::Program(p) => {
                writeln!(f, "State Program: \"{}\" [{}]", p.program, p.instance)?;
                writeln!(f, "  thread name = {}", p.thread_name)?;
                writeln!(f, "  pv system = {}", p.pv_system)?;
                writeln!(f, "  options = {}", p.options)?;
                writeln!(f, "  priority = {}, stack size = {}", p.priority, p.stack_size)?;
                writeln!(
                    f,
                    "  channels = {}, assigned = {}, connected = {}, monitored = {}, got monitor = {}",
                    p.channels, p.assigned, p.connected, p.monitored, p.first_monitors
                )?;
                writeln!(f, "  queues = {}, event flags = {}", p.queues, p.event_flags)?;
                for ss in &p.state_sets {
                    writeln!(f, "  State Set: \"{}\"", ss.name)?;
                    if let Some(name) = &ss.thread_name {
                        writeln!(
                            f,
                            "    thread name = {name}, tid = {}",
                            ss.os_tid.map_or_else(|| "-".to_string(), |t| t.to_string())
                        )?;
                    }
                    writeln!(f, "    First state = \"{}\"", ss.first_state)?;
                    writeln!(f, "    Current state = \"{}\"", ss.current_state)?;
                    if let Some(prev) = &ss.previous_state {
                        writeln!(f, "    Previous state = \"{prev}\"")?;
                    }
                    writeln!(f, "    Elapsed time since state was entered = {:.1} seconds", ss.time_in_state_secs)?;
                    writeln!(f, "    Get in progress = [{}]", flags(&ss.get_in_progress))?;
                    writeln!(f, "    Put in progress = [{}]", flags(&ss.put_in_progress))?;
                    for (id, delay) in ss.delays.iter().enumerate() {
                        writeln!(f, "    delay[{id}] = {delay}")?;
                    }
                }
                Ok(())
            }
            ShowReport::Channels {
                program,
                instance,
                channels,
            } => {
                writeln!(f, "State Program: \"{program}\" [{instance}]")?;
                for c in channels {
                    writeln!(
                        f,
                        "  #{} {} {}[{}] = {}",
                        c.index, c.var_name, c.ty, c.count, c.value
                    )?;
                    match &c.pv_name {
                        Some(pv) => writeln!(
                            f,
                            "    pv \"{pv}\" {}",
                            if c.connected { "connected" } else { "not connected" }
                        )?,
                        None => writeln!(f, "    not assigned")?,
                    }
                    writeln!(
                        f,
                        "    {}monitored, sync = {}, queue = {}",
                        if c.monitored { "" } else { "not " },
                        c.synced_to.map_or_else(|| "-".to_string(), |e| e.to_string()),
                        c.queue.map_or_else(|| "-".to_string(), |q| q.to_string())
                    )?;
                    writeln!(
                        f,
                        "    status = {}, severity = {}, message = {}, time = {:.6}",
                        c.status,
                        c.severity,
                        c.message.as_deref().unwrap_or(""),
                        c.timestamp_secs
                    )?;
                }
                Ok(())
            }
            ShowReport::Queues {
                program,
                instance,
                queues,
            } => {
                writeln!(f, "State Program: \"{program}\" [{instance}]")?;
                for q in queues {
                    writeln!(
                        f,
                        "  queue {} ({}): {} of {} used, element size {}",
                        q.queue, q.var_name, q.used, q.capacity, q.element_size
                    )?;
                }
                Ok(())
            }
            ShowReport::Stats(s) => {
                writeln!(
                    f,
                    "Total programs={}, channels={}, connected={}, disconnected={}",
                    s.programs, s.channels, s.connected, s.disconnected
                )?;
                for e in &s.listed {
                    writeln!(
                        f,
                        "  {}[{}] {} -> {} ({})",
                        e.program,
                        e.instance,
                        e.var_name,
                        e.pv_name,
                        if e.connected { "connected" } else { "disconnected" }
                    )?;
                }
                Ok(())
            }
            ShowReport::All { instances } => {
                writeln!(f, "{:<20} {:>4} {:<20} {:<20} {:<20}", "Program", "Inst", "Thread", "State Set", "State")?;
                for row in instances {
                    for (i, (ss, state)) in row.state_sets.iter().enumerate() {
                        if i == 0 {
                            writeln!(
                                f,
                                "{:<20} {:>4} {:<20} {:<20} {:<20}",
                                row.program, row.instance, row.thread_name, ss, state
                            )?;
                        } else {
                            writeln!(f, "{:<20} {:>4} {:<20} {:<20} {:<20}", "", "", "", ss, state)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }
}
