//! Built-in demo state programs.
//!
//! | Program | Channels | Behavior |
//! |---------|----------|----------|
//! | `level` | `{unit}:level` (monitored), `{unit}:alarm` | `low`/`high` with hysteresis, writes the alarm on every change |
//! | `ramp` | `{unit}:level` | sawtooth writer, one step every `period` seconds |
//! | `pulse` | `{unit}:heartbeat` | counter put every `period` seconds; a second state set logs every tenth beat |
//! | `events` | `{unit}:events` (queued) | drains a monitor queue and logs each update |
//!
//! All programs take their tuning from launch macros; missing or malformed
//! values fall back to the defaults below.

use seq_common::options::ProgramOptions;
use seq_common::pv::{PvType, PvValue};
use seq_engine::prelude::*;

// ─── Level monitor ──────────────────────────────────────────────────

const LEVEL: ChannelId = ChannelId(0);
const ALARM: ChannelId = ChannelId(1);

fn macro_f64(ctx: &StateSetContext<'_>, name: &str, default: f64) -> f64 {
    ctx.mac_value_get(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn set_alarm(ctx: &mut StateSetContext<'_>, on: bool) {
    ctx.set_f64(ALARM, if on { 1.0 } else { 0.0 });
    let status = ctx.pv_put(ALARM, Completion::Sync);
    if !status.is_ok() {
        ctx.log(&format!("alarm write failed: {status}"));
    }
}

/// Level monitor with hysteresis (`high`, default 8; `low`, default 2).
pub fn level() -> Result<ProgramDescriptor, ProgramError> {
    ProgramBuilder::new("level")
        .options(ProgramOptions::CONN)
        .params("high=8, low=2")
        .channel(
            ChannelSpec::new("level", PvType::Double)
                .assign("{unit}:level")
                .monitor(),
        )
        .channel(ChannelSpec::new("alarm", PvType::Short).assign("{unit}:alarm"))
        .state_set(
            StateSetSpec::new("watch")
                .state(
                    StateSpec::new(
                        "low",
                        FnState::new(|ctx| {
                            let high = macro_f64(ctx, "high", 8.0);
                            (ctx.get_f64(LEVEL) > high).then_some(Transition::to(0, 1))
                        })
                        .on_entry(|ctx| set_alarm(ctx, false)),
                    )
                    .watch(LEVEL),
                )
                .state(
                    StateSpec::new(
                        "high",
                        FnState::new(|ctx| {
                            let low = macro_f64(ctx, "low", 2.0);
                            (ctx.get_f64(LEVEL) < low).then_some(Transition::to(0, 0))
                        })
                        .on_entry(|ctx| {
                            let level = ctx.get_f64(LEVEL);
                            ctx.log(&format!("level {level:.2} above limit"));
                            set_alarm(ctx, true);
                        }),
                    )
                    .watch(LEVEL),
                ),
        )
        .build()
}

// ─── Ramp ───────────────────────────────────────────────────────────

/// Sawtooth writer (`step`, default 1; `max`, default 10; `period`,
/// default 1 s).
pub fn ramp() -> Result<ProgramDescriptor, ProgramError> {
    const OUT: ChannelId = ChannelId(0);
    ProgramBuilder::new("ramp")
        .params("step=1, max=10, period=1")
        .channel(ChannelSpec::new("out", PvType::Double).assign("{unit}:level"))
        .state_set(
            StateSetSpec::new("ramp").delays(1).state(StateSpec::new(
                "step",
                FnState::new(|ctx| ctx.delay(0).then_some(Transition::to(0, 0)))
                    .with_delays(|ctx| {
                        let period = macro_f64(ctx, "period", 1.0);
                        ctx.delay_init(0, period);
                    })
                    .on_action(|ctx, _, _| {
                        let step = macro_f64(ctx, "step", 1.0);
                        let max = macro_f64(ctx, "max", 10.0).max(step);
                        let next = ctx.get_f64(OUT) + step;
                        ctx.set_f64(OUT, if next > max { 0.0 } else { next });
                        ctx.pv_put(OUT, Completion::Default);
                    }),
            )),
        )
        .build()
}

// ─── Heartbeat ──────────────────────────────────────────────────────

/// Heartbeat counter (`period`, default 1 s).
pub fn pulse() -> Result<ProgramDescriptor, ProgramError> {
    const BEAT: ChannelId = ChannelId(0);
    const TICK: EventFlag = EventFlag(1);
    ProgramBuilder::new("pulse")
        .params("period=1")
        .event_flags(1)
        .channel(ChannelSpec::new("beat", PvType::Long).assign("{unit}:heartbeat"))
        .state_set(
            StateSetSpec::new("beat").delays(1).state(StateSpec::new(
                "wait",
                FnState::new(|ctx| ctx.delay(0).then_some(Transition::to(0, 0)))
                    .with_delays(|ctx| {
                        let period = macro_f64(ctx, "period", 1.0);
                        ctx.delay_init(0, period);
                    })
                    .on_action(|ctx, _, _| {
                        let beat = ctx.get_f64(BEAT) + 1.0;
                        ctx.set_f64(BEAT, beat);
                        ctx.pv_put(BEAT, Completion::Default);
                        ctx.ef_set(TICK);
                    }),
            )),
        )
        .state_set(
            StateSetSpec::new("count").state(
                StateSpec::new(
                    "idle",
                    FnState::new(|ctx| ctx.ef_test_and_clear(TICK).then_some(Transition::to(0, 0)))
                        .on_action(|ctx, _, _| {
                            let beat = ctx.get_f64(BEAT);
                            if beat as u64 % 10 == 0 {
                                ctx.log(&format!("{beat} beats"));
                            }
                        }),
                )
                .watch(TICK),
            ),
        )
        .build()
}

// ─── Event queue ────────────────────────────────────────────────────

/// Queue drain (queue size 16).
pub fn events() -> Result<ProgramDescriptor, ProgramError> {
    const EVENT: ChannelId = ChannelId(0);
    const PENDING: EventFlag = EventFlag(1);
    ProgramBuilder::new("events")
        .event_flags(1)
        .channel(
            ChannelSpec::new("event", PvType::String)
                .assign("{unit}:events")
                .monitor()
                .queue(0, 16)
                .sync(PENDING)
                .initial(PvValue::string("")),
        )
        .state_set(
            StateSetSpec::new("drain").state(
                StateSpec::new(
                    "wait",
                    FnState::new(|ctx| ctx.ef_test(PENDING).then_some(Transition::to(0, 0)))
                        .on_action(|ctx, _, _| {
                            while ctx.pv_get_q(EVENT) {
                                let text = ctx.get_str(EVENT);
                                ctx.log(&format!("event: {text}"));
                            }
                        }),
                )
                .watch(PENDING),
            ),
        )
        .build()
}

/// Every demo program.
///
/// # Errors
/// Returns the first `ProgramError` from building a descriptor.
pub fn programs() -> Result<Vec<ProgramDescriptor>, ProgramError> {
    Ok(vec![level()?, ramp()?, pulse()?, events()?])
}
