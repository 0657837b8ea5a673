//! Registry: program registration, instance numbering, lookup, stop and
//! launch failures.

use super::common::{WAIT, idle, registry_with, wait_for};
use seq_common::pv::{PvType, PvValue};
use seq_engine::prelude::*;
use seq_pv::sim::SimPvSystem;
use std::ops::ControlFlow;
use std::sync::Arc;

fn idle_program(name: &str) -> ProgramDescriptor {
    ProgramBuilder::new(name)
        .state_set(StateSetSpec::new("main").state(StateSpec::new("idle", idle())))
        .state_set(StateSetSpec::new("aux").state(StateSpec::new("idle", idle())))
        .build()
        .expect("valid program")
}

#[test]
fn instances_are_numbered_from_zero() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    registry
        .register_program(idle_program("counter"))
        .expect("register");

    let first = registry.start("counter", "", None).expect("start");
    let second = registry.start("counter", "", None).expect("start");
    assert_eq!(first.instance().instance_number(), 0);
    assert_eq!(second.instance().instance_number(), 1);
    assert_eq!(registry.instances().len(), 2);

    first.stop().expect("stop");
    assert!(wait_for(WAIT, || registry.instances().len() == 1));
    // max + 1, not the freed number
    let third = registry.start("counter", "", None).expect("start");
    assert_eq!(third.instance().instance_number(), 2);

    registry.stop_all();
    second.join().expect("join");
    third.join().expect("join");
    assert!(registry.instances().is_empty());
}

#[test]
fn duplicate_program_is_rejected() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    registry
        .register_program(idle_program("dup"))
        .expect("register");
    let err = registry
        .register_program(idle_program("dup"))
        .expect_err("duplicate");
    assert!(matches!(
        err,
        SeqError::Program(ProgramError::DuplicateProgram(ref name)) if name == "dup"
    ));
    assert_eq!(registry.programs().len(), 1);
}

#[test]
fn unknown_program_and_pv_system_fail_to_start() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    assert!(matches!(
        registry.start("nope", "", None),
        Err(SeqError::UnknownProgram(_))
    ));

    registry
        .register_program(idle_program("pvsys"))
        .expect("register");
    assert!(matches!(
        registry.start("pvsys", "pvsys=ca", None),
        Err(SeqError::UnknownPvSystem(ref name)) if name == "ca"
    ));
    assert!(registry.instances().is_empty());
}

#[test]
fn bad_magic_is_rejected_at_launch() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let program = ProgramBuilder::new("old")
        .magic(0x1234)
        .state_set(StateSetSpec::new("main").state(StateSpec::new("idle", idle())))
        .build()
        .expect("valid program");
    assert!(matches!(
        registry.launch(Arc::new(program), "", None),
        Err(SeqError::Program(ProgramError::BadMagic { found: 0x1234, .. }))
    ));
}

#[test]
fn lookups_by_number_thread_and_name() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    registry
        .register_program(idle_program("lookup"))
        .expect("register");
    let handle = registry
        .start("lookup", "name=pump_ctl", None)
        .expect("start");
    let instance = handle.instance().clone();
    assert_eq!(instance.thread_name(), "pump_ctl");
    assert!(wait_for(WAIT, || instance.thread_ids().len() == 2));

    let found = registry.find("lookup", 0).expect("by number");
    assert!(found.same_as(&instance));
    assert!(registry.find("lookup", 1).is_none());

    let thread = instance.thread_ids()[1];
    assert!(registry.find_by_thread(thread).expect("by thread").same_as(&instance));
    assert!(
        registry
            .find_by_thread_name("pump_ctl")
            .expect("by name")
            .same_as(&instance)
    );

    let names = registry.traverse(|i| ControlFlow::Break(i.program_name().to_string()));
    assert_eq!(names.as_deref(), Some("lookup"));

    registry.stop(thread).expect("stop by thread");
    assert!(wait_for(WAIT, || handle.is_finished()));
    assert!(matches!(
        registry.stop(thread),
        Err(SeqError::InstanceNotFound(_))
    ));
    assert!(matches!(
        registry.stop_instance("lookup", 0),
        Err(SeqError::InstanceNotFound(_))
    ));
}

#[test]
fn launch_parameters_come_from_macros() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let program = ProgramBuilder::new("params")
        .params("priority=5")
        .state_set(StateSetSpec::new("main").state(StateSpec::new("idle", idle())))
        .build()
        .expect("valid program");
    let handle = registry
        .launch(Arc::new(program), "stack=262144, user=ops", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert_eq!(instance.priority(), 5);
    assert_eq!(instance.stack_size(), 262_144);
    assert_eq!(instance.pv_system_name(), "sim");
    assert_eq!(instance.macro_value("user").as_deref(), Some("ops"));
    assert_eq!(instance.thread_name(), "params");
    handle.stop().expect("stop");
}

#[test]
fn reports_cover_live_instances() {
    let sim = SimPvSystem::new();
    sim.add_record("r:a", PvValue::double(1.5));
    let registry = registry_with(&sim, 1.0);
    let program = ProgramBuilder::new("report")
        .channel(ChannelSpec::new("a", PvType::Double).assign("r:a").monitor())
        .channel(ChannelSpec::new("b", PvType::Long).assign("r:missing"))
        .state_set(StateSetSpec::new("main").state(StateSpec::new("idle", idle())))
        .build()
        .expect("valid program");
    let handle = registry
        .launch(Arc::new(program), "", None)
        .expect("launch");
    let instance = handle.instance().clone();
    assert!(wait_for(WAIT, || instance.channel_counts().first_monitors == 1));

    let reports = registry.report(&ShowQuery::Stats { level: 1 });
    let [ShowReport::Stats(stats)] = reports.as_slice() else {
        panic!("expected one stats report, got {reports:?}");
    };
    assert_eq!((stats.channels, stats.connected, stats.disconnected), (2, 1, 1));
    assert_eq!(stats.listed.len(), 1);
    assert_eq!(stats.listed[0].pv_name, "r:missing");

    let ShowReport::Channels { channels, .. } = instance.report(&ShowQuery::Channels {
        filter: Some("+".to_string()),
    }) else {
        panic!("expected channel report");
    };
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].var_name, "a");

    let json = serde_json::to_value(instance.report(&ShowQuery::Program)).expect("json");
    assert_eq!(json["kind"], "program");
    assert_eq!(json["connected"], 1);
    handle.stop().expect("stop");
}

#[test]
fn failed_launch_leaves_registry_untouched() {
    let sim = SimPvSystem::new();
    let registry = registry_with(&sim, 1.0);
    let program = Arc::new(idle_program("fresh"));

    assert!(matches!(
        registry.launch(Arc::clone(&program), "pvsys=ca", None),
        Err(SeqError::UnknownPvSystem(_))
    ));
    assert!(registry.programs().is_empty());
    assert!(registry.instances().is_empty());

    let dir = tempfile::tempdir().expect("temp dir");
    let logfile = dir.path().join("fresh.log");
    let handle = registry
        .launch(program, &format!("logfile={}", logfile.display()), None)
        .expect("launch");
    assert_eq!(handle.instance().instance_number(), 0);
    assert_eq!(registry.programs().len(), 1);
    assert!(logfile.exists());
    handle.stop().expect("stop");
}
