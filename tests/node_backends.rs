// tests/node_backends.rs

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tempfile::tempdir;

use batchrelay::bus::InMemoryBus;
use batchrelay::errors::BatchrelayError;
use batchrelay::guard::MemoryGuard;
use batchrelay::node::{
    ActivationRequest, CommandNodeBackend, HISTORY_LIMIT, LifecycleAction, NodeBackend, NodeTable,
    apply,
};
use batchrelay::store::MemoryStore;
use batchrelay::types::{CorrelationId, JobStatus, NodeState, StageId};
use batchrelay_test_utils::{
    ConfigFileBuilder, ScriptedJob, init_tracing, local_backend, wait_until,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn request(node: &str, stage: StageId, cid: &str) -> ActivationRequest {
    ActivationRequest {
        node: node.into(),
        stage,
        correlation_id: CorrelationId::from(cid),
        run_date: None,
    }
}

#[test]
fn command_backend_requires_both_templates() {
    let cfg = ConfigFileBuilder::new().build();
    assert!(matches!(
        CommandNodeBackend::from_config(&cfg, NodeTable::new()),
        Err(BatchrelayError::ConfigError(_))
    ));

    let cfg = ConfigFileBuilder::new().node_cmds("true", "true").build();
    assert!(CommandNodeBackend::from_config(&cfg, NodeTable::new()).is_ok());
}

#[cfg(unix)]
#[tokio::test]
async fn command_backend_renders_templates_and_tracks_state() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let log = dir.path().join("calls.log");
    let table = NodeTable::new();
    let backend = CommandNodeBackend::new(
        table.clone(),
        format!("echo start {{node}} {{stage}} {{correlation_id}} >> {}", log.display()),
        format!("echo stop {{node}} {{stage}} {{correlation_id}} >> {}", log.display()),
    );

    let state = backend.start(request("i-0abc", StageId::Collect, "run-1")).await?;
    assert_eq!(state, NodeState::Running);
    // Already up: the command is not run again.
    backend.start(request("i-0abc", StageId::Collect, "run-1")).await?;

    assert_eq!(backend.stop("i-0abc").await?, NodeState::Stopped);
    backend.stop("i-0abc").await?;

    let calls = std::fs::read_to_string(&log)?;
    assert_eq!(
        calls.lines().collect::<Vec<_>>(),
        vec!["start i-0abc collect run-1", "stop i-0abc collect run-1"]
    );
    assert_eq!(table.activation("i-0abc"), Some(CorrelationId::from("run-1")));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn start_command_receives_the_run_date() -> TestResult {
    let dir = tempdir()?;
    let log = dir.path().join("calls.log");
    let backend = CommandNodeBackend::new(
        NodeTable::new(),
        format!("echo start {{node}} date={{run_date}} >> {}", log.display()),
        "true",
    );

    let dated = ActivationRequest {
        run_date: NaiveDate::from_ymd_opt(2024, 12, 31),
        ..request("i-0abc", StageId::Process, "run-1")
    };
    backend.start(dated).await?;
    backend.stop("i-0abc").await?;
    backend.start(request("i-0abc", StageId::Process, "run-2")).await?;

    let calls = std::fs::read_to_string(&log)?;
    assert_eq!(
        calls.lines().collect::<Vec<_>>(),
        vec!["start i-0abc date=2024-12-31", "start i-0abc date="]
    );
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn failed_start_command_reverts_the_node_state() {
    init_tracing();
    let table = NodeTable::new();
    let backend = CommandNodeBackend::new(table.clone(), "echo quota >&2; exit 1", "true");

    let result = backend.start(request("i-0abc", StageId::Collect, "run-1")).await;
    assert!(result.is_err());
    assert_eq!(table.state("i-0abc"), NodeState::Stopped);

    let states: Vec<_> = table.history().into_iter().map(|c| c.to).collect();
    assert_eq!(states, vec![NodeState::Starting, NodeState::Stopped]);
}

#[tokio::test]
async fn node_changes_carry_the_activation_id() -> TestResult {
    let table = NodeTable::new();
    let mut changes = table.watch();
    let backend = CommandNodeBackend::new(table.clone(), "true", "true");

    apply(
        &backend,
        &LifecycleAction::start("i-0abc", StageId::Process, CorrelationId::from("run-5")),
    )
    .await?;

    let starting = changes.try_recv()?;
    assert_eq!(starting.to, NodeState::Starting);
    assert_eq!(starting.stage, StageId::Process);
    assert_eq!(starting.correlation_id, Some(CorrelationId::from("run-5")));
    let running = changes.try_recv()?;
    assert_eq!((running.from, running.to), (NodeState::Starting, NodeState::Running));
    Ok(())
}

#[test]
fn table_history_keeps_the_most_recent_changes() {
    let table = NodeTable::new();
    for i in 0..HISTORY_LIMIT {
        let cid = format!("run-{i}");
        table.begin_start(&request("i-0abc", StageId::Collect, &cid));
        table.set("i-0abc", NodeState::Running);
        table.begin_stop("i-0abc");
        table.set("i-0abc", NodeState::Stopped);
    }

    let history = table.history();
    assert_eq!(history.len(), HISTORY_LIMIT);
    let last = history.last().expect("changes");
    assert_eq!(last.to, NodeState::Stopped);
    assert_eq!(
        last.correlation_id,
        Some(CorrelationId::from(format!("run-{}", HISTORY_LIMIT - 1).as_str()))
    );
}

#[tokio::test]
async fn local_backend_rejects_unknown_nodes() {
    let cfg = ConfigFileBuilder::new().build();
    let bus = InMemoryBus::new();
    let backend = local_backend(
        &cfg,
        NodeTable::new(),
        &bus,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryGuard::new()),
        ScriptedJob::succeeding().into_body(),
        ScriptedJob::succeeding().into_body(),
    );

    let result = backend.start(request("ghost", StageId::Collect, "r")).await;
    assert!(matches!(result, Err(BatchrelayError::UnknownNode(n)) if n == "ghost"));
}

#[tokio::test]
async fn local_backend_runs_the_job_once_per_boot() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let cfg = ConfigFileBuilder::new().in_dir(dir.path()).build();
    let bus = InMemoryBus::new();
    let table = NodeTable::new();
    let job = ScriptedJob::succeeding();
    let backend = local_backend(
        &cfg,
        table.clone(),
        &bus,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryGuard::new()),
        job.clone().into_body(),
        ScriptedJob::succeeding().into_body(),
    );

    backend.start(request("collector", StageId::Collect, "run-1")).await?;
    backend.start(request("collector", StageId::Collect, "run-1")).await?;
    wait_until(|| !backend.records().is_empty()).await;

    assert_eq!(job.started(), 1);
    let records = backend.records();
    assert_eq!(records.len(), 1);
    assert!(matches!(&records[0].outcome, Ok(r) if r.status == JobStatus::Succeeded));
    // The node stays up until someone stops it.
    assert_eq!(table.state("collector"), NodeState::Running);

    backend.stop("collector").await?;
    assert_eq!(table.state("collector"), NodeState::Stopped);
    Ok(())
}

#[tokio::test]
async fn stopping_a_local_node_aborts_its_running_job() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let cfg = ConfigFileBuilder::new().in_dir(dir.path()).build();
    let bus = InMemoryBus::new();
    let guard = MemoryGuard::new();
    let job = ScriptedJob::hanging();
    let backend = local_backend(
        &cfg,
        NodeTable::new(),
        &bus,
        Arc::new(MemoryStore::new()),
        Arc::new(guard.clone()),
        job.clone().into_body(),
        ScriptedJob::succeeding().into_body(),
    );

    backend.start(request("collector", StageId::Collect, "run-1")).await?;
    wait_until(|| job.started() == 1).await;
    assert!(guard.holder("collector").is_some());

    backend.stop("collector").await?;
    // Aborting the task drops the lock token.
    wait_until(|| guard.holder("collector").is_none()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(job.finished(), 0);
    assert!(backend.records().is_empty());
    assert!(bus.history().is_empty());
    Ok(())
}
