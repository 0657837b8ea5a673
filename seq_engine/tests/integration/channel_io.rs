//! Channel I/O against the simulated PV system: synchronous and
//! asynchronous get/put, timeouts, disconnects, queues, event flag sync and
//! safe mode.

use super::common::{WAIT, idle, registry_with, wait_for, wait_state};
use parking_lot::Mutex;
use seq_common::options::ProgramOptions;
use seq_common::pv::{PvSeverity, PvStatus, PvType, PvValue};
use seq_engine::prelude::*;
use seq_pv::sim::SimPvSystem;
use std::sync::Arc;
use std::time::{Duration, Instant};

const V: ChannelId = ChannelId(0);
const F: EventFlag = EventFlag(1);
const GO: EventFlag = EventFlag(2);

type Log<T> = Arc<Mutex<Vec<T>>>;

fn log<T>() -> Log<T> {
    Arc::new(Mutex::new(Vec::new()))
}

// ─── Get / put ──────────────────────────────────────────────────────

#[test]
fn synchronous_get_and_put() {
    let sim = SimPvSystem::new();
    sim.add_record("io:v", PvValue::double(3.0));
    let registry = registry_with(&sim, 1.0);
    let results: Log<(PvStatus, f64)> = log();

    let sink = Arc::clone(&results);
    let program = ProgramBuilder::new("syncio")
        .options(ProgramOptions::CONN)
        .channel(ChannelSpec::new("v", PvType::Double).assign("io:v"))
        .state_set(
            StateSetSpec::new("main")
                .state(StateSpec::new(
                    "run",
                    FnState::new(move |ctx| {
                        let got = ctx.pv_get(V, Completion::Sync);
                        sink.lock().push((got, ctx.get_f64(V)));
                        ctx.set_f64(V, 7.5);
                        let put = ctx.pv_put(V, Completion::Sync);
                        sink.lock().push((put, ctx.get_f64(V)));
                        Some(Transition::to(0, 1))
                    }),
                ))
                .state(StateSpec::new("done", idle())),
        )
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    assert!(wait_state(handle.instance(), 0, "done"));
    assert_eq!(
        *results.lock(),
        vec![(PvStatus::Ok, 3.0), (PvStatus::Ok, 7.5)]
    );
    assert_eq!(sim.value("io:v"), Some(PvValue::double(7.5)));
    assert_eq!(sim.put_count("io:v"), 1);
    handle.stop().expect("stop");
}

#[test]
fn get_times_out_when_no_completion_arrives() {
    let sim = SimPvSystem::new();
    sim.add_record("slow:v", PvValue::double(1.0));
    sim.hold_completions(true);
    let registry = registry_with(&sim, 0.2);
    let results: Log<(PvStatus, PvStatus, PvSeverity)> = log();

    let sink = Arc::clone(&results);
    let program = ProgramBuilder::new("timeout")
        .options(ProgramOptions::CONN)
        .channel(ChannelSpec::new("v", PvType::Double).assign("slow:v"))
        .state_set(
            StateSetSpec::new("main")
                .state(StateSpec::new(
                    "run",
                    FnState::new(move |ctx| {
                        let got = ctx.pv_get(V, Completion::Sync);
                        sink.lock()
                            .push((got, ctx.pv_status(V), ctx.pv_severity(V)));
                        Some(Transition::to(0, 1))
                    }),
                ))
                .state(StateSpec::new("done", idle())),
        )
        .build()
        .expect("valid program");

    let started = Instant::now();
    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert!(wait_state(&instance, 0, "done"));
    assert!(started.elapsed() >= Duration::from_millis(180));
    assert_eq!(
        *results.lock(),
        vec![(PvStatus::Timeout, PvStatus::Timeout, PvSeverity::Major)]
    );

    // the late completion is stale and must not touch the variable
    sim.set("slow:v", PvValue::double(5.0));
    assert_eq!(sim.release_completions(), 1);
    assert_eq!(instance.channel_value("v"), Some(PvValue::double(0.0)));
    handle.stop().expect("stop");
}

#[test]
fn asynchronous_get_completes_later() {
    let sim = SimPvSystem::new();
    sim.add_record("async:v", PvValue::double(4.0));
    sim.hold_completions(true);
    let registry = registry_with(&sim, 1.0);

    let program = ProgramBuilder::new("asyncget")
        .options(ProgramOptions::CONN)
        .channel(ChannelSpec::new("v", PvType::Double).assign("async:v"))
        .state_set(
            StateSetSpec::new("main")
                .state(StateSpec::new(
                    "start",
                    FnState::new(|ctx| {
                        assert_eq!(ctx.pv_get(V, Completion::Async), PvStatus::Ok);
                        // a second request on the same channel is refused
                        assert_eq!(ctx.pv_get(V, Completion::Async), PvStatus::Error);
                        Some(Transition::to(0, 1))
                    }),
                ))
                .state(
                    StateSpec::new(
                        "wait",
                        FnState::new(|ctx| ctx.pv_get_complete(V).then_some(Transition::to(0, 2))),
                    )
                    .watch(V),
                )
                .state(StateSpec::new("done", idle())),
        )
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert!(wait_state(&instance, 0, "wait"));
    assert!(wait_for(WAIT, || sim.pending_completions() == 1));
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(instance.current_state(0).as_deref(), Some("wait"));

    assert_eq!(sim.release_completions(), 1);
    assert!(wait_state(&instance, 0, "done"));
    assert_eq!(instance.channel_value("v"), Some(PvValue::double(4.0)));
    handle.stop().expect("stop");
}

#[test]
fn asynchronous_puts_report_completion() {
    let sim = SimPvSystem::new();
    sim.add_record("p:a", PvValue::double(0.0));
    sim.add_record("p:b", PvValue::double(0.0));
    sim.hold_completions(true);
    let registry = registry_with(&sim, 1.0);
    let flags: Log<Vec<bool>> = log();

    let sink = Arc::clone(&flags);
    let program = ProgramBuilder::new("asyncput")
        .options(ProgramOptions::CONN)
        .channel(ChannelSpec::new("a", PvType::Double).assign("p:a"))
        .channel(ChannelSpec::new("b", PvType::Double).assign("p:b"))
        .state_set(
            StateSetSpec::new("main")
                .state(StateSpec::new(
                    "start",
                    FnState::new(|ctx| {
                        ctx.set_f64(ChannelId(0), 1.0);
                        ctx.set_f64(ChannelId(1), 2.0);
                        assert_eq!(ctx.pv_put(ChannelId(0), Completion::Async), PvStatus::Ok);
                        assert_eq!(ctx.pv_put(ChannelId(1), Completion::Async), PvStatus::Ok);
                        assert!(!ctx.pv_put_complete(ChannelId(0), 2, true));
                        Some(Transition::to(0, 1))
                    }),
                ))
                .state(
                    StateSpec::new(
                        "wait",
                        FnState::new(move |ctx| {
                            let mut done = [false; 2];
                            let all = ctx.pv_put_complete_into(ChannelId(0), 2, false, &mut done);
                            sink.lock().push(done.to_vec());
                            all.then_some(Transition::to(0, 2))
                        }),
                    )
                    .watch(ChannelId(0))
                    .watch(ChannelId(1)),
                )
                .state(StateSpec::new("done", idle())),
        )
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert!(wait_state(&instance, 0, "wait"));
    assert!(wait_for(WAIT, || sim.pending_completions() == 2));
    assert!(wait_for(WAIT, || !flags.lock().is_empty()));
    assert_eq!(sim.value("p:a"), Some(PvValue::double(1.0)));
    assert_eq!(sim.value("p:b"), Some(PvValue::double(2.0)));

    assert_eq!(sim.release_completions(), 2);
    assert!(wait_state(&instance, 0, "done"));
    let flags = flags.lock();
    assert_eq!(flags.first(), Some(&vec![false, false]));
    assert_eq!(flags.last(), Some(&vec![true, true]));
    handle.stop().expect("stop");
}

// ─── Connection loss ────────────────────────────────────────────────

#[test]
fn disconnect_releases_blocked_put() {
    let sim = SimPvSystem::new();
    sim.add_record("d:v", PvValue::double(0.0));
    sim.hold_completions(true);
    let registry = registry_with(&sim, 10.0);
    let results: Log<PvStatus> = log();

    let sink = Arc::clone(&results);
    let program = ProgramBuilder::new("dropout")
        .options(ProgramOptions::CONN)
        .channel(ChannelSpec::new("v", PvType::Double).assign("d:v"))
        .state_set(
            StateSetSpec::new("main")
                .state(StateSpec::new(
                    "put",
                    FnState::new(move |ctx| {
                        sink.lock().push(ctx.pv_put(V, Completion::Sync));
                        Some(Transition::to(0, 1))
                    }),
                ))
                .state(StateSpec::new("done", idle())),
        )
        .build()
        .expect("valid program");

    let started = Instant::now();
    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert!(wait_for(WAIT, || sim.pending_completions() == 1));
    assert!(sim.disconnect("d:v"));

    assert!(wait_state(&instance, 0, "done"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(*results.lock(), vec![PvStatus::Disconnected]);
    let meta = instance.channel_meta("v").expect("channel exists");
    assert_eq!(meta.status, PvStatus::Disconnected);
    assert_eq!(meta.severity, PvSeverity::Invalid);
    assert_eq!(instance.channel_counts().connected, 0);
    handle.stop().expect("stop");
}

#[test]
fn disconnect_releases_blocked_get() {
    let sim = SimPvSystem::new();
    sim.add_record("dg:v", PvValue::double(2.0));
    sim.hold_completions(true);
    let registry = registry_with(&sim, 10.0);
    let results: Log<PvStatus> = log();

    let sink = Arc::clone(&results);
    let program = ProgramBuilder::new("getdrop")
        .options(ProgramOptions::CONN)
        .channel(ChannelSpec::new("v", PvType::Double).assign("dg:v"))
        .state_set(
            StateSetSpec::new("main")
                .state(StateSpec::new(
                    "get",
                    FnState::new(move |ctx| {
                        sink.lock().push(ctx.pv_get(V, Completion::Sync));
                        Some(Transition::to(0, 1))
                    }),
                ))
                .state(StateSpec::new("done", idle())),
        )
        .build()
        .expect("valid program");

    let started = Instant::now();
    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert!(wait_for(WAIT, || sim.pending_completions() == 1));
    assert!(sim.disconnect("dg:v"));

    assert!(wait_state(&instance, 0, "done"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(*results.lock(), vec![PvStatus::Disconnected]);
    let meta = instance.channel_meta("v").expect("channel exists");
    assert_eq!(meta.status, PvStatus::Disconnected);
    assert_eq!(meta.severity, PvSeverity::Invalid);

    // the held completion arrives too late to matter
    sim.release_completions();
    assert_eq!(instance.channel_value("v"), Some(PvValue::double(0.0)));
    handle.stop().expect("stop");
}

#[test]
fn disconnect_completes_pending_async_get() {
    let sim = SimPvSystem::new();
    sim.add_record("da:v", PvValue::double(2.0));
    sim.hold_completions(true);
    let registry = registry_with(&sim, 10.0);
    let results: Log<(PvStatus, PvSeverity)> = log();

    let sink = Arc::clone(&results);
    let program = ProgramBuilder::new("asyncdrop")
        .options(ProgramOptions::CONN)
        .channel(ChannelSpec::new("v", PvType::Double).assign("da:v"))
        .state_set(
            StateSetSpec::new("main")
                .state(StateSpec::new(
                    "start",
                    FnState::new(|ctx| {
                        (ctx.pv_get(V, Completion::Async) == PvStatus::Ok)
                            .then_some(Transition::to(0, 1))
                    }),
                ))
                .state(
                    StateSpec::new(
                        "wait",
                        FnState::new(move |ctx| {
                            if !ctx.pv_get_complete(V) {
                                return None;
                            }
                            sink.lock().push((ctx.pv_status(V), ctx.pv_severity(V)));
                            Some(Transition::to(0, 2))
                        }),
                    )
                    .watch(V),
                )
                .state(StateSpec::new("done", idle())),
        )
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert!(wait_state(&instance, 0, "wait"));
    assert!(wait_for(WAIT, || sim.pending_completions() == 1));
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(instance.current_state(0).as_deref(), Some("wait"));

    assert!(sim.disconnect("da:v"));
    assert!(wait_state(&instance, 0, "done"));
    assert_eq!(
        *results.lock(),
        vec![(PvStatus::Disconnected, PvSeverity::Invalid)]
    );
    handle.stop().expect("stop");
}

#[test]
fn connection_state_wakes_watchers() {
    let sim = SimPvSystem::new();
    sim.add_record("c:v", PvValue::double(0.0));
    let registry = registry_with(&sim, 1.0);

    let program = ProgramBuilder::new("watchconn")
        .options(ProgramOptions::CONN)
        .channel(ChannelSpec::new("v", PvType::Double).assign("c:v").monitor())
        .state_set(
            StateSetSpec::new("main")
                .state(
                    StateSpec::new(
                        "up",
                        FnState::new(|ctx| (!ctx.pv_connected(V)).then_some(Transition::to(0, 1))),
                    )
                    .watch(V),
                )
                .state(
                    StateSpec::new(
                        "down",
                        FnState::new(|ctx| ctx.pv_connected(V).then_some(Transition::to(0, 0))),
                    )
                    .watch(V),
                ),
        )
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert!(wait_for(WAIT, || instance.channel_counts().first_monitors == 1));

    sim.disconnect("c:v");
    assert!(wait_state(&instance, 0, "down"));
    assert_eq!(sim.monitor_count("c:v"), 0);

    sim.reconnect("c:v");
    assert!(wait_state(&instance, 0, "up"));
    assert!(wait_for(WAIT, || instance.channel_counts().first_monitors == 1));
    assert_eq!(sim.monitor_count("c:v"), 1);
    handle.stop().expect("stop");
    assert_eq!(sim.variable_count(), 0);
}

#[test]
fn stop_while_waiting_for_connections() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let program = ProgramBuilder::new("never")
        .options(ProgramOptions::CONN)
        .channel(ChannelSpec::new("v", PvType::Double).assign("missing:v"))
        .state_set(StateSetSpec::new("main").state(StateSpec::new("idle", idle())))
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    assert!(wait_for(WAIT, || sim.variable_count() == 1));
    assert_eq!(handle.instance().channel_counts().connected, 0);
    handle.stop().expect("stop");
    assert_eq!(sim.variable_count(), 0);
}

// ─── Queues and sync ────────────────────────────────────────────────

fn queue_program(results: Log<f64>, flush_first: bool) -> ProgramDescriptor {
    ProgramBuilder::new(if flush_first { "flushq" } else { "drainq" })
        .options(ProgramOptions::CONN)
        .event_flags(2)
        .channel(
            ChannelSpec::new("q", PvType::Double)
                .assign("q:v")
                .monitor()
                .queue(0, 2)
                .sync(F),
        )
        .state_set(
            StateSetSpec::new("main")
                .state(
                    StateSpec::new(
                        "idle",
                        FnState::new(move |ctx| {
                            if !ctx.ef_test(GO) {
                                return None;
                            }
                            if flush_first {
                                ctx.pv_flush_q(V);
                            }
                            while ctx.pv_get_q(V) {
                                results.lock().push(ctx.get_f64(V));
                            }
                            Some(Transition::to(0, 1))
                        }),
                    )
                    .watch(GO),
                )
                .state(StateSpec::new("done", idle())),
        )
        .build()
        .expect("valid program")
}

#[test]
fn queued_monitors_are_drained_in_order() {
    let sim = SimPvSystem::new();
    sim.add_record("q:v", PvValue::double(1.0));
    let registry = registry_with(&sim, 1.0);
    let results: Log<f64> = log();

    let handle = registry
        .launch(Arc::new(queue_program(Arc::clone(&results), false)), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert!(wait_for(WAIT, || instance.channel_counts().first_monitors == 1));
    assert!(instance.ef_is_set(F));

    sim.set("q:v", PvValue::double(2.0));
    // full: overwrites the newest element
    sim.set("q:v", PvValue::double(3.0));

    instance.ef_set(GO);
    assert!(wait_state(&instance, 0, "done"));
    assert_eq!(*results.lock(), vec![1.0, 3.0]);
    assert!(!instance.ef_is_set(F));
    handle.stop().expect("stop");
}

#[test]
fn flushed_queue_yields_nothing() {
    let sim = SimPvSystem::new();
    sim.add_record("q:v", PvValue::double(1.0));
    let registry = registry_with(&sim, 1.0);
    let results: Log<f64> = log();

    let handle = registry
        .launch(Arc::new(queue_program(Arc::clone(&results), true)), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert!(wait_for(WAIT, || instance.channel_counts().first_monitors == 1));
    sim.set("q:v", PvValue::double(2.0));

    instance.ef_set(GO);
    assert!(wait_state(&instance, 0, "done"));
    assert!(results.lock().is_empty());
    handle.stop().expect("stop");
}

#[test]
fn sync_sets_flag_on_monitor_update() {
    let sim = SimPvSystem::new();
    sim.add_record("s:v", PvValue::double(0.0));
    let registry = registry_with(&sim, 1.0);

    let program = ProgramBuilder::new("synced")
        .options(ProgramOptions::CONN)
        .event_flags(1)
        .channel(ChannelSpec::new("v", PvType::Double).assign("s:v").monitor())
        .state_set(
            StateSetSpec::new("main")
                .state(
                    StateSpec::new(
                        "wait",
                        FnState::new(|ctx| ctx.ef_test_and_clear(F).then_some(Transition::to(0, 1)))
                            .on_entry(|ctx| ctx.pv_sync(V, Some(F))),
                    )
                    .watch(F),
                )
                .state(StateSpec::new("got", idle())),
        )
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(instance.current_state(0).as_deref(), Some("wait"));

    sim.set("s:v", PvValue::double(8.0));
    assert!(wait_state(&instance, 0, "got"));
    assert_eq!(instance.channel_value("v"), Some(PvValue::double(8.0)));
    handle.stop().expect("stop");
}

#[test]
fn dynamic_assign_binds_at_run_time() {
    let sim = SimPvSystem::new();
    sim.add_record("dyn:v", PvValue::Long(vec![12]));
    let registry = registry_with(&sim, 1.0);
    let names: Log<String> = log();

    let sink = Arc::clone(&names);
    let program = ProgramBuilder::new("dynassign")
        .channel(ChannelSpec::new("v", PvType::Long).monitor())
        .state_set(
            StateSetSpec::new("main")
                .state(StateSpec::new(
                    "assign",
                    FnState::new(move |ctx| {
                        assert!(!ctx.pv_assigned(V));
                        assert_eq!(ctx.pv_assign(V, "dyn:v"), PvStatus::Ok);
                        sink.lock().push(ctx.pv_name(V));
                        Some(Transition::to(0, 1))
                    }),
                ))
                .state(
                    StateSpec::new(
                        "wait",
                        FnState::new(|ctx| (ctx.get_f64(V) == 12.0).then_some(Transition::to(0, 2))),
                    )
                    .watch(V),
                )
                .state(StateSpec::new("done", idle())),
        )
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert!(wait_state(&instance, 0, "done"));
    assert_eq!(*names.lock(), vec!["dyn:v".to_string()]);
    let counts = instance.channel_counts();
    assert_eq!((counts.assigned, counts.connected, counts.monitored), (1, 1, 1));
    handle.stop().expect("stop");
}

// ─── Safe mode ──────────────────────────────────────────────────────

#[test]
fn safe_mode_passes_values_through_anonymous_channels() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let seen: Log<f64> = log();

    let sink = Arc::clone(&seen);
    let program = ProgramBuilder::new("safe")
        .options(ProgramOptions::SAFE)
        .channel(ChannelSpec::new("count", PvType::Long).monitor())
        .state_set(
            StateSetSpec::new("writer")
                .state(StateSpec::new(
                    "write",
                    FnState::new(|ctx| {
                        ctx.set_f64(V, 42.0);
                        assert_eq!(ctx.pv_put(V, Completion::Default), PvStatus::Ok);
                        Some(Transition::to(0, 1))
                    }),
                ))
                .state(StateSpec::new("idle", idle())),
        )
        .state_set(
            StateSetSpec::new("reader")
                .state(
                    StateSpec::new(
                        "wait",
                        FnState::new(move |ctx| {
                            let value = ctx.get_f64(V);
                            sink.lock().push(value);
                            (value == 42.0).then_some(Transition::to(0, 1))
                        }),
                    )
                    .watch(V),
                )
                .state(StateSpec::new("got", idle())),
        )
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert!(wait_state(&instance, 1, "got"));
    assert_eq!(seen.lock().last(), Some(&42.0));
    assert_eq!(instance.channel_value("count"), Some(PvValue::Long(vec![42])));
    handle.stop().expect("stop");
}

#[test]
fn safe_mode_keeps_local_writes_private_until_put() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);

    let program = ProgramBuilder::new("private")
        .options(ProgramOptions::SAFE)
        .event_flags(2)
        .channel(ChannelSpec::new("x", PvType::Double).monitor())
        .state_set(
            StateSetSpec::new("main")
                .state(
                    StateSpec::new(
                        "local",
                        FnState::new(|ctx| {
                            ctx.set_f64(V, 5.0);
                            ctx.ef_test(GO).then_some(Transition::to(0, 1))
                        }),
                    )
                    .watch(GO),
                )
                .state(StateSpec::new(
                    "publish",
                    FnState::new(|ctx| {
                        ctx.pv_put(V, Completion::Default);
                        Some(Transition::to(0, 2))
                    }),
                ))
                .state(StateSpec::new("done", idle())),
        )
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(instance.channel_value("x"), Some(PvValue::double(0.0)));

    instance.ef_set(GO);
    assert!(wait_state(&instance, 0, "done"));
    assert_eq!(instance.channel_value("x"), Some(PvValue::double(5.0)));
    handle.stop().expect("stop");
}
