// src/lib.rs

pub mod bus;
pub mod cli;
pub mod config;
pub mod controller;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod guard;
pub mod logging;
pub mod node;
pub mod store;
pub mod types;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::bus::{CommandPublisher, InMemoryBus, spawn_event_source};
use crate::cli::{CliArgs, Command, JobArgs, RunArgs};
use crate::config::loader::load_and_validate;
use crate::config::{ConfigFile, NodeProfile};
use crate::controller::{Controller, ControllerKind};
use crate::engine::{DailySchedule, Orchestrator, RuntimeEvent};
use crate::errors::BatchrelayError;
use crate::exec::{JobRunner, JobSpec, LogSink, ShellJob};
use crate::guard::FileLockGuard;
use crate::node::{CommandNodeBackend, LocalNodeBackend, NodeBackend, NodeTable};
use crate::store::{ArtifactStore, FsStore};
use crate::types::{CorrelationId, JobStatus, StageId};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the orchestrator (bus, controllers, nodes, runtime, schedule)
/// - the node-side one-shot job unit
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<ExitCode> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;

    match args.command {
        Command::Run(run_args) => run_pipeline(&cfg, &run_args).await,
        Command::Job(job_args) => run_job(&cfg, &job_args).await,
        Command::NextTick => {
            let schedule = DailySchedule::from_settings(&cfg.pipeline);
            let next = schedule.next_after(Utc::now());
            println!("{}", next.with_timezone(&schedule.offset).to_rfc3339());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_pipeline(cfg: &ConfigFile, args: &RunArgs) -> Result<ExitCode> {
    if args.dry_run {
        print_dry_run(cfg, args);
        return Ok(ExitCode::SUCCESS);
    }

    let bus = InMemoryBus::new();
    let nodes = NodeTable::new();

    // Remote nodes publish on the external bus; bring those events in.
    let _event_source = if args.local {
        None
    } else {
        let cmd = cfg.bus.subscribe_cmd.clone().ok_or_else(|| {
            BatchrelayError::ConfigError("[bus].subscribe_cmd is required without --local".into())
        })?;
        Some(spawn_event_source(cmd, bus.clone())?)
    };

    let backend: Arc<dyn NodeBackend> = if args.local {
        let store: Arc<dyn ArtifactStore> = Arc::new(FsStore::from_config(cfg));
        Arc::new(LocalNodeBackend::from_config(
            cfg,
            nodes.clone(),
            Arc::new(file_guard(cfg)),
            store,
            Arc::new(bus.clone()),
        ))
    } else {
        Arc::new(CommandNodeBackend::from_config(cfg, nodes.clone())?)
    };

    let mut orchestrator =
        Orchestrator::new(cfg, bus.clone(), backend, nodes).exit_when_settled(args.once);
    if !args.once {
        orchestrator = orchestrator.with_schedule();
    }
    let handle = orchestrator.spawn();

    // Ctrl-C → graceful shutdown.
    {
        let tx = handle.runtime_sender();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }

    if args.once {
        let cid = handle.fire_now().await?;
        info!(correlation_id = %cid, "fired one run");
    }

    let core = handle.wait().await?;

    let mut all_ok = true;
    for run in core.sequencer().runs() {
        info!(
            correlation_id = %run.correlation_id(),
            phase = %run.phase(),
            settled = run.is_settled(),
            "run summary"
        );
        all_ok &= run.phase().is_success();
    }
    for anomaly in core.sequencer().anomalies() {
        warn!(
            correlation_id = %anomaly.correlation_id,
            observation = ?anomaly.observation,
            phase = %anomaly.phase,
            "ordering anomaly"
        );
    }

    Ok(if args.once && !all_ok {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Node-side unit: run this stage's job once and publish its completion.
async fn run_job(cfg: &ConfigFile, args: &JobArgs) -> Result<ExitCode> {
    let stage = args.stage;
    let publish_cmd = cfg.bus.publish_cmd.clone().ok_or_else(|| {
        BatchrelayError::ConfigError("[bus].publish_cmd is required to run a job".into())
    })?;
    let correlation_id = args
        .correlation_id
        .clone()
        .map(CorrelationId::from)
        .unwrap_or_else(CorrelationId::generate);

    let env =
        NodeProfile::from_config(cfg, stage).boot_for_run(correlation_id, Utc::now(), args.run_date);
    let stage_cfg = cfg.stage(stage);

    let runner = JobRunner::new(
        JobSpec::from_config(cfg, stage),
        Arc::new(file_guard(cfg)),
        Arc::new(FsStore::from_config(cfg)),
        Arc::new(CommandPublisher::new(publish_cmd)),
        Arc::new(ShellJob::new(stage_cfg.cmd.clone())),
        LogSink::file(stage_cfg.effective_log_path(stage)),
    );

    let result = runner.run(&env).await?;
    info!(
        stage = %stage,
        correlation_id = %env.correlation_id(),
        status = ?result.status,
        published = result.published,
        log = %result.log_ref,
        "job finished"
    );
    if !result.published && !result.skipped() {
        error!(stage = %stage, "completion event was not published");
    }

    Ok(match result.status {
        JobStatus::Failed => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

/// Lock files for both stage nodes, at their configured paths.
fn file_guard(cfg: &ConfigFile) -> FileLockGuard {
    StageId::ALL
        .into_iter()
        .fold(FileLockGuard::new(".batchrelay/locks"), |guard, stage| {
            guard.with_path(cfg.node_of(stage), cfg.stage(stage).effective_lock_path(stage))
        })
}

/// Simple dry-run output: print the resolved pipeline without running it.
fn print_dry_run(cfg: &ConfigFile, args: &RunArgs) {
    let p = &cfg.pipeline;
    println!("batchrelay dry-run");
    println!("  pipeline.name = {}", p.name);
    println!("  pipeline.schedule = {} (UTC{})", p.schedule.format("%H:%M"), p.utc_offset);
    println!("  pipeline.watchdog_timeout = {:?}", p.watchdog_timeout);
    println!("  pipeline.region = {}", p.region);
    println!(
        "  nodes = {}",
        if args.local { "local" } else { "command" }
    );
    println!();

    let now = Utc::now();
    println!(
        "next tick: {}",
        DailySchedule::from_settings(p)
            .next_after(now)
            .with_timezone(&p.utc_offset)
            .to_rfc3339()
    );
    println!();

    println!("stages:");
    for stage in StageId::ALL {
        let s = cfg.stage(stage);
        let env = NodeProfile::from_config(cfg, stage).boot(CorrelationId::from("dry-run"), now);
        println!("  - {stage}");
        println!("      node: {}", s.node);
        println!("      topic: {}", cfg.topic(stage));
        println!("      cmd: {}", s.cmd);
        if let Some(ref prefix) = s.code_prefix {
            println!("      code: {}/{prefix}", s.effective_code_bucket(stage));
        }
        println!("      lock: {}", s.effective_lock_path(stage).display());
        println!("      log: {}", s.effective_log_path(stage).display());
        println!("      work_dir: {}", s.effective_work_dir(stage).display());
        println!("      run_date: {}", env.run_date());
        match stage {
            StageId::Collect => println!("      writes: raw/{}", env.collected_key()),
            StageId::Process => {
                println!("      reads: raw/{}", env.collected_key());
                println!("      writes: processed/{}", env.results_key());
                println!("      report: processed/{}", env.report_key());
            }
        }
        for (k, v) in s.tunable_strings() {
            println!("      tunable {k} = {v}");
        }
    }
    println!();

    println!("controllers:");
    for controller in Controller::pipeline(cfg) {
        let kind = controller.kind();
        let trigger = match controller.topic() {
            Some(topic) if kind == ControllerKind::ActivateProcess => format!("{topic} (done)"),
            Some(topic) => format!("{topic} (done, failed)"),
            None => "schedule".to_string(),
        };
        println!(
            "  - {kind}: on {trigger} → {:?} {}",
            kind.action(),
            controller.node()
        );
    }

    debug!("dry-run complete (no execution)");
}
