//! Level monitor scenario: a two-state program follows a monitored
//! process variable across a threshold and drives an alarm output.

use super::common::{WAIT, registry_with, wait_for, wait_state};
use seq_common::options::ProgramOptions;
use seq_common::pv::{PvSeverity, PvStatus, PvType, PvValue};
use seq_engine::prelude::*;
use seq_pv::sim::SimPvSystem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const LEVEL: ChannelId = ChannelId(0);
const ALARM: ChannelId = ChannelId(1);

fn level_program() -> ProgramDescriptor {
    ProgramBuilder::new("level")
        .options(ProgramOptions::CONN)
        .params("threshold=5")
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
                            let threshold = ctx
                                .mac_value_get("threshold")
                                .and_then(|t| t.parse::<f64>().ok())
                                .unwrap_or(5.0);
                            (ctx.get_f64(LEVEL) > threshold).then_some(Transition::to(0, 1))
                        })
                        .on_entry(|ctx| {
                            ctx.set_f64(ALARM, 0.0);
                            ctx.pv_put(ALARM, Completion::Sync);
                        }),
                    )
                    .watch(LEVEL),
                )
                .state(
                    StateSpec::new(
                        "high",
                        FnState::new(|ctx| {
                            (ctx.get_f64(LEVEL) <= 5.0).then_some(Transition::to(0, 0))
                        })
                        .on_entry(|ctx| {
                            ctx.set_f64(ALARM, 1.0);
                            ctx.pv_put(ALARM, Completion::Sync);
                        }),
                    )
                    .watch(LEVEL),
                ),
        )
        .build()
        .expect("valid program")
}

#[test]
fn follows_level_across_threshold() {
    let sim = SimPvSystem::new();
    sim.add_record("tank1:level", PvValue::double(1.0));
    sim.add_record("tank1:alarm", PvValue::Short(vec![0]));
    let registry = registry_with(&sim, 1.0);
    registry
        .register_program(level_program())
        .expect("register");

    let handle = registry.start("level", "unit=tank1", None).expect("start");
    let instance = handle.instance().clone();
    assert!(wait_for(WAIT, || sim.put_count("tank1:alarm") == 1));
    assert_eq!(instance.current_state(0).as_deref(), Some("low"));

    sim.set("tank1:level", PvValue::double(6.0));
    assert!(wait_state(&instance, 0, "high"));
    assert!(wait_for(WAIT, || sim.value("tank1:alarm") == Some(PvValue::Short(vec![1]))));

    sim.set("tank1:level", PvValue::double(2.0));
    assert!(wait_state(&instance, 0, "low"));
    assert!(wait_for(WAIT, || sim.value("tank1:alarm") == Some(PvValue::Short(vec![0]))));
    assert_eq!(instance.transitions(0), Some(2));
    assert_eq!(sim.put_count("tank1:alarm"), 3);

    handle.stop().expect("stop");
    assert_eq!(sim.variable_count(), 0);
    assert!(registry.instances().is_empty());
}

#[test]
fn alarm_metadata_reaches_program() {
    let sim = SimPvSystem::new();
    sim.add_record("tank2:level", PvValue::double(1.0));
    sim.add_record("tank2:alarm", PvValue::Short(vec![0]));
    let registry = registry_with(&sim, 1.0);

    let handle = registry
        .launch(Arc::new(level_program()), "unit=tank2", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert!(wait_for(WAIT, || instance.channel_counts().first_monitors == 1));

    sim.set_alarm("tank2:level", PvStatus::HiHi, PvSeverity::Major, Some("overflow"));
    assert!(wait_for(WAIT, || {
        instance
            .channel_meta("level")
            .is_some_and(|m| m.severity == PvSeverity::Major)
    }));
    let meta = instance.channel_meta("level").expect("channel exists");
    assert_eq!(meta.status, PvStatus::HiHi);
    assert_eq!(meta.message.as_deref(), Some("overflow"));
    handle.stop().expect("stop");
}

#[test]
fn two_instances_bind_their_own_records() {
    let sim = SimPvSystem::new();
    for unit in ["a", "b"] {
        sim.add_record(&format!("{unit}:level"), PvValue::double(0.0));
        sim.add_record(&format!("{unit}:alarm"), PvValue::Short(vec![0]));
    }
    let registry = registry_with(&sim, 1.0);
    registry
        .register_program(level_program())
        .expect("register");

    let a = registry.start("level", "unit=a", None).expect("start a");
    let b = registry.start("level", "unit=b", None).expect("start b");
    assert!(wait_for(WAIT, || sim.put_count("a:alarm") == 1 && sim.put_count("b:alarm") == 1));

    sim.set("b:level", PvValue::double(9.0));
    assert!(wait_state(b.instance(), 0, "high"));
    assert_eq!(a.instance().current_state(0).as_deref(), Some("low"));

    a.stop().expect("stop a");
    b.stop().expect("stop b");
}

/// Two states with a 0.1 s self-transition fallback on a float channel.
fn threshold_program(high_entries: Arc<AtomicUsize>) -> ProgramDescriptor {
    const V: ChannelId = ChannelId(0);
    ProgramBuilder::new("threshold")
        .channel(ChannelSpec::new("v", PvType::Float).assign("{unit}:v").monitor())
        .state_set(
            StateSetSpec::new("main")
                .delays(1)
                .state(
                    StateSpec::new(
                        "Low",
                        FnState::new(|ctx| {
                            if ctx.get_f64(V) > 5.0 {
                                Some(Transition::to(0, 1))
                            } else {
                                ctx.delay(0).then_some(Transition::to(1, 0))
                            }
                        })
                        .with_delays(|ctx| ctx.delay_init(0, 0.1)),
                    )
                    .watch(V),
                )
                .state(
                    StateSpec::new(
                        "High",
                        FnState::new(|ctx| {
                            if ctx.get_f64(V) <= 5.0 {
                                Some(Transition::to(0, 0))
                            } else {
                                ctx.delay(0).then_some(Transition::to(1, 1))
                            }
                        })
                        .with_delays(|ctx| ctx.delay_init(0, 0.1))
                        .on_entry(move |_| {
                            high_entries.fetch_add(1, Ordering::SeqCst);
                        }),
                    )
                    .watch(V),
                ),
        )
        .build()
        .expect("valid program")
}

#[test]
fn threshold_crossing_resets_time_in_state() {
    let sim = SimPvSystem::new();
    sim.add_record("t:v", PvValue::Float(vec![0.0]));
    let registry = registry_with(&sim, 1.0);
    let high_entries = Arc::new(AtomicUsize::new(0));
    let handle = registry
        .launch(Arc::new(threshold_program(Arc::clone(&high_entries))), "unit=t", None)
        .expect("launch");
    let instance = handle.instance().clone();

    // fallback self-transitions keep firing while nothing changes
    assert!(wait_for(WAIT, || instance.transitions(0).is_some_and(|n| n >= 2)));
    assert_eq!(instance.current_state(0).as_deref(), Some("Low"));

    sim.set("t:v", PvValue::Float(vec![6.0]));
    assert!(wait_state(&instance, 0, "High"));
    let in_state = instance.time_in_state(0).expect("state set 0");
    assert!(in_state < Duration::from_millis(500), "{in_state:?}");

    // self-transitions in High do not re-run its entry
    let before = instance.transitions(0).unwrap_or_default();
    assert!(wait_for(WAIT, || {
        instance.transitions(0).is_some_and(|n| n >= before + 2)
    }));
    assert_eq!(instance.current_state(0).as_deref(), Some("High"));
    assert_eq!(high_entries.load(Ordering::SeqCst), 1);
    handle.stop().expect("stop");
}
