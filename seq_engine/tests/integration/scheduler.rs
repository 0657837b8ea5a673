//! State set scheduling: delays, event flags, entry/exit/action ordering,
//! exit and failure handling.

use super::common::{WAIT, idle, registry_with, wait_for, wait_state};
use seq_common::options::{ProgramOptions, StateOptions};
use seq_engine::prelude::*;
use seq_pv::sim::SimPvSystem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const F: EventFlag = EventFlag(1);

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

// ─── Delays ─────────────────────────────────────────────────────────

#[test]
fn delay_fires_after_its_interval() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let program = ProgramBuilder::new("delay")
        .state_set(
            StateSetSpec::new("main")
                .delays(1)
                .state(StateSpec::new(
                    "wait",
                    FnState::new(|ctx| ctx.delay(0).then_some(Transition::to(0, 1)))
                        .with_delays(|ctx| ctx.delay_init(0, 0.1)),
                ))
                .state(StateSpec::new("done", idle())),
        )
        .build()
        .expect("valid program");

    let started = Instant::now();
    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    assert!(wait_state(handle.instance(), 0, "done"));
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert_eq!(handle.instance().transitions(0), Some(1));
    handle.stop().expect("stop");
}

// ─── Event flags ────────────────────────────────────────────────────

#[test]
fn event_flag_hands_off_between_state_sets() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let program = ProgramBuilder::new("handoff")
        .event_flags(1)
        .state_set(
            StateSetSpec::new("producer")
                .state(StateSpec::new(
                    "go",
                    FnState::new(|ctx| {
                        ctx.ef_set(F);
                        Some(Transition::to(0, 1))
                    }),
                ))
                .state(StateSpec::new("idle", idle())),
        )
        .state_set(
            StateSetSpec::new("consumer")
                .state(
                    StateSpec::new(
                        "wait",
                        FnState::new(|ctx| ctx.ef_test_and_clear(F).then_some(Transition::to(0, 1))),
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
    assert!(wait_state(&instance, 1, "got"));
    assert_eq!(instance.current_state(0).as_deref(), Some("idle"));
    assert!(!instance.ef_is_set(F));
    handle.stop().expect("stop");
}

#[test]
fn external_flag_wakes_waiting_state_set() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let program = ProgramBuilder::new("external")
        .event_flags(1)
        .state_set(
            StateSetSpec::new("main")
                .state(
                    StateSpec::new(
                        "wait",
                        FnState::new(|ctx| ctx.ef_test(F).then_some(Transition::to(0, 1))),
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

    instance.ef_set(F);
    assert!(wait_state(&instance, 0, "got"));
    // legacy mode: the firing state consumed its own events
    assert!(!instance.ef_is_set(F));
    handle.stop().expect("stop");
}

#[test]
fn new_event_flag_mode_leaves_flags_alone() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let program = ProgramBuilder::new("newef")
        .options(ProgramOptions::NEWEF)
        .event_flags(1)
        .state_set(
            StateSetSpec::new("main")
                .state(
                    StateSpec::new(
                        "wait",
                        FnState::new(|ctx| ctx.ef_test(F).then_some(Transition::to(0, 1))),
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
    instance.ef_set(F);
    assert!(wait_state(&instance, 0, "got"));
    assert!(instance.ef_is_set(F));
    handle.stop().expect("stop");
}

// ─── Entry / exit / action ──────────────────────────────────────────

#[test]
fn self_transitions_skip_entry_and_exit() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let entries = counter();
    let exits = counter();
    let actions = counter();
    let loops = counter();

    let (en, ex, ac, lo) = (
        Arc::clone(&entries),
        Arc::clone(&exits),
        Arc::clone(&actions),
        Arc::clone(&loops),
    );
    let state_a = FnState::new(move |_| {
        if lo.fetch_add(1, Ordering::SeqCst) < 3 {
            Some(Transition::to(0, 0))
        } else {
            Some(Transition::to(1, 1))
        }
    })
    .on_entry(move |_| {
        en.fetch_add(1, Ordering::SeqCst);
    })
    .on_exit(move |_| {
        ex.fetch_add(1, Ordering::SeqCst);
    })
    .on_action(move |_, _, _| {
        ac.fetch_add(1, Ordering::SeqCst);
    });

    let program = ProgramBuilder::new("selfloop")
        .state_set(
            StateSetSpec::new("main")
                .state(StateSpec::new("a", state_a))
                .state(StateSpec::new("b", idle())),
        )
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    assert!(wait_state(handle.instance(), 0, "b"));
    assert_eq!(entries.load(Ordering::SeqCst), 1);
    assert_eq!(exits.load(Ordering::SeqCst), 1);
    assert_eq!(actions.load(Ordering::SeqCst), 4);
    assert_eq!(handle.instance().transitions(0), Some(4));
    handle.stop().expect("stop");
}

#[test]
fn state_options_run_entry_and_exit_on_self_transitions() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let entries = counter();
    let exits = counter();
    let loops = counter();

    let (en, ex, lo) = (
        Arc::clone(&entries),
        Arc::clone(&exits),
        Arc::clone(&loops),
    );
    let state_a = FnState::new(move |_| {
        if lo.fetch_add(1, Ordering::SeqCst) < 2 {
            Some(Transition::to(0, 0))
        } else {
            Some(Transition::to(1, 1))
        }
    })
    .on_entry(move |_| {
        en.fetch_add(1, Ordering::SeqCst);
    })
    .on_exit(move |_| {
        ex.fetch_add(1, Ordering::SeqCst);
    });

    let program = ProgramBuilder::new("selfopts")
        .state_set(
            StateSetSpec::new("main")
                .state(
                    StateSpec::new("a", state_a)
                        .options(StateOptions::DO_ENTRY_FROM_SELF | StateOptions::DO_EXIT_TO_SELF),
                )
                .state(StateSpec::new("b", idle())),
        )
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    assert!(wait_state(handle.instance(), 0, "b"));
    // initial entry plus two self entries; two self exits plus the real one
    assert_eq!(entries.load(Ordering::SeqCst), 3);
    assert_eq!(exits.load(Ordering::SeqCst), 3);
    handle.stop().expect("stop");
}

#[test]
fn action_can_redirect_the_next_state() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let program = ProgramBuilder::new("redirect")
        .state_set(
            StateSetSpec::new("main")
                .state(StateSpec::new(
                    "start",
                    FnState::new(|_| Some(Transition::to(7, 1))).on_action(|_, number, next| {
                        assert_eq!(number, 7);
                        *next = 2;
                    }),
                ))
                .state(StateSpec::new("skipped", idle()))
                .state(StateSpec::new("target", idle())),
        )
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    assert!(wait_state(handle.instance(), 0, "target"));
    handle.stop().expect("stop");
}

#[test]
fn invalid_next_state_stays_in_current_state() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let fired = Arc::new(AtomicBool::new(false));
    let exits = counter();

    let (once, ex) = (Arc::clone(&fired), Arc::clone(&exits));
    let program = ProgramBuilder::new("invalid")
        .state_set(
            StateSetSpec::new("main").state(StateSpec::new(
                "only",
                FnState::new(move |_| (!once.swap(true, Ordering::SeqCst)).then_some(Transition::to(0, 99)))
                    .on_exit(move |_| {
                        ex.fetch_add(1, Ordering::SeqCst);
                    }),
            )),
        )
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert!(wait_for(WAIT, || fired.load(Ordering::SeqCst)));
    assert!(wait_for(WAIT, || instance.transitions(0) == Some(1)));
    assert_eq!(instance.current_state(0).as_deref(), Some("only"));
    assert_eq!(exits.load(Ordering::SeqCst), 0);
    assert!(!instance.is_exiting());
    handle.stop().expect("stop");
}

// ─── Termination ────────────────────────────────────────────────────

#[test]
fn exit_request_from_state_code_runs_exit_hook() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let hooks = counter();

    let (init, entry, exit) = (Arc::clone(&hooks), Arc::clone(&hooks), Arc::clone(&hooks));
    let program = ProgramBuilder::new("quits")
        .init(move |_| {
            init.fetch_add(1, Ordering::SeqCst);
        })
        .entry(move |_| {
            entry.fetch_add(10, Ordering::SeqCst);
        })
        .exit(move |_| {
            exit.fetch_add(100, Ordering::SeqCst);
        })
        .state_set(StateSetSpec::new("main").state(StateSpec::new(
            "run",
            FnState::new(|ctx| {
                ctx.exit();
                None
            }),
        )))
        .state_set(StateSetSpec::new("other").state(StateSpec::new("idle", idle())))
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    assert!(wait_for(WAIT, || handle.is_finished()));
    handle.join().expect("join");
    assert_eq!(hooks.load(Ordering::SeqCst), 111);
    assert!(registry.instances().is_empty());
}

#[test]
fn panicking_state_set_takes_instance_down() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let program = ProgramBuilder::new("panics")
        .state_set(StateSetSpec::new("main").state(StateSpec::new("idle", idle())))
        .state_set(StateSetSpec::new("bad").state(StateSpec::new(
            "boom",
            FnState::new(|_| panic!("state code failure")),
        )))
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    assert!(wait_for(WAIT, || handle.is_finished()));
    assert!(handle.join().is_ok());
}

#[test]
fn context_reports_identity_and_macros() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let seen = Arc::new(parking_lot::Mutex::new(None));

    let sink = Arc::clone(&seen);
    let program = ProgramBuilder::new("ident")
        .options(ProgramOptions::DEBUG | ProgramOptions::REENT)
        .params("unit=default")
        .state_set(StateSetSpec::new("only").state(StateSpec::new(
            "record",
            FnState::new(move |ctx| {
                *sink.lock() = Some((
                    ctx.program_name().to_string(),
                    ctx.state_set_name().to_string(),
                    ctx.mac_value_get("unit"),
                    ctx.opt_get('d'),
                    ctx.opt_get('r'),
                    ctx.opt_get('s'),
                ));
                Some(Transition::to(0, 1))
            }),
        )).state(StateSpec::new("done", idle())))
        .build()
        .expect("valid program");

    let handle = registry
        .launch(Arc::new(program), "unit=tank7", None)
        .expect("launch");
    assert!(wait_state(handle.instance(), 0, "done"));
    let seen = seen.lock().clone().expect("event ran");
    assert_eq!(
        seen,
        (
            "ident".to_string(),
            "only".to_string(),
            Some("tank7".to_string()),
            true,
            true,
            false
        )
    );
    handle.stop().expect("stop");
}
