//! # Sequencer Runner Binary
//!
//! Loads a runner configuration, registers the built-in demo programs,
//! launches the configured instances against the simulated PV system and
//! reports their state until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Run the programs listed in the config file
//! seq --config config/seq.toml
//!
//! # Launch an extra instance with macros
//! seq --config config/seq.toml --program level --macros "unit=tank2"
//!
//! # JSON logs and reports every 5 s
//! seq --config config/seq.toml --json --report-interval 5
//! ```

use clap::Parser;
use seq::config::RunnerConfig;
use seq::demo;
use seq_common::config::ConfigLoader;
use seq_common::consts::DEFAULT_CONFIG_PATH;
use seq_engine::prelude::*;
use seq_pv::sim::SimPvSystem;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

/// State program sequencer runner
#[derive(Parser, Debug)]
#[command(name = "seq")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Runs state programs against a PV system")]
#[command(long_about = None)]
struct Args {
    /// Path to the runner configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Launch this program in addition to the configured ones (repeatable).
    #[arg(short, long = "program", action = clap::ArgAction::Append)]
    programs: Vec<String>,

    /// Macros for the programs given with --program.
    #[arg(short, long, default_value = "")]
    macros: String,

    /// Seconds between status reports (0 disables them).
    #[arg(long, default_value_t = 10)]
    report_interval: u64,

    /// List the built-in programs and exit.
    #[arg(long)]
    list: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs and reports in JSON format
    #[arg(long)]
    json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("sequencer startup failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.list {
        for program in demo::programs()? {
            println!("{}", program.name());
        }
        return Ok(());
    }

    let config = match RunnerConfig::load(&args.config) {
        Ok(config) => {
            setup_tracing(&args, config.shared.log_level.as_str());
            config
        }
        Err(e) => {
            setup_tracing(&args, "info");
            return Err(format!("{}: {e}", args.config.display()).into());
        }
    };
    config.validate()?;

    info!(
        "Sequencer v{} starting ({})",
        env!("CARGO_PKG_VERSION"),
        config.shared.service_name
    );

    let sim = SimPvSystem::from_config(&config.sim);
    let mut pv_systems = PvSystemRegistry::new();
    pv_systems.register(Arc::new(sim))?;
    for name in seq_pv::builtin_systems() {
        if pv_systems.get(name).is_err() {
            if let Some(system) = seq_pv::create_system(name) {
                pv_systems.register(system)?;
            }
        }
    }
    info!("PV systems: {:?}", pv_systems.list());

    let registry = Registry::new(config.engine.clone(), pv_systems);
    for program in demo::programs()? {
        registry.register_program(program)?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })?;

    let mut handles = Vec::new();
    let launches = config
        .programs
        .iter()
        .map(|p| (p.name.clone(), p.macros.clone(), p.stack_size))
        .chain(
            args.programs
                .iter()
                .map(|name| (name.clone(), args.macros.clone(), None)),
        );
    for (name, macros, stack_size) in launches {
        match registry.start(&name, &macros, stack_size) {
            Ok(handle) => handles.push(handle),
            Err(e) => error!(program = %name, "launch failed: {e}"),
        }
    }
    if handles.is_empty() {
        warn!("no program instances running");
    }

    let interval = Duration::from_secs(args.report_interval);
    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) && handles.iter().any(|h| !h.is_finished()) {
        thread::sleep(Duration::from_millis(100));
        if args.report_interval > 0 && last_report.elapsed() >= interval {
            report(&registry, args.json);
            last_report = Instant::now();
        }
    }

    info!("stopping {} instance(s)", registry.instances().len());
    registry.stop_all();
    for handle in handles {
        let instance = handle.instance().clone();
        if let Err(e) = handle.join() {
            error!(
                program = %instance.program_name(),
                instance = instance.instance_number(),
                "{e}"
            );
        }
    }

    info!("Sequencer shutdown complete");
    Ok(())
}

/// Log the instance table and channel totals.
fn report(registry: &Registry, json: bool) {
    for query in [ShowQuery::All, ShowQuery::Stats { level: 1 }] {
        for report in registry.report(&query) {
            if json {
                match serde_json::to_string(&report) {
                    Ok(text) => info!(target: "seq::report", "{text}"),
                    Err(e) => warn!("report serialization failed: {e}"),
                }
            } else {
                info!(target: "seq::report", "\n{report}");
            }
        }
    }
}

/// Setup tracing subscriber based on CLI arguments and the configured level.
fn setup_tracing(args: &Args, configured: &str) {
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured))
    };

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .init();
    }
}
