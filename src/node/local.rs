// src/node/local.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{ActivationRequest, LifecycleFuture, NodeBackend, NodeTable};
use crate::bus::EventPublisher;
use crate::config::{ConfigFile, NodeProfile};
use crate::errors::BatchrelayError;
use crate::exec::{JobResult, JobRunner, JobSpec, LogSink, ShellJob};
use crate::guard::ExecutionGuard;
use crate::store::ArtifactStore;
use crate::types::{CorrelationId, NodeState, StageId};

/// What happened to the job of one local activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub node: String,
    pub stage: StageId,
    pub correlation_id: CorrelationId,
    pub outcome: std::result::Result<JobResult, String>,
}

struct LocalNode {
    profile: NodeProfile,
    runner: Arc<JobRunner>,
}

/// In-process nodes.
///
/// Booting a node resolves its environment once and runs its job as a
/// one-shot task. The node stays `Running` after the job ends until a stop
/// arrives; stopping aborts a job that is still going.
pub struct LocalNodeBackend {
    table: NodeTable,
    nodes: HashMap<String, LocalNode>,
    jobs: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    records: Arc<Mutex<Vec<JobRecord>>>,
}

impl LocalNodeBackend {
    pub fn new(table: NodeTable) -> Self {
        Self {
            table,
            nodes: HashMap::new(),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Host `profile.node`, running `runner` on every boot.
    pub fn with_node(mut self, profile: NodeProfile, runner: JobRunner) -> Self {
        self.nodes.insert(
            profile.node.clone(),
            LocalNode {
                profile,
                runner: Arc::new(runner),
            },
        );
        self
    }

    /// Both stages with their configured shell commands and log files.
    pub fn from_config(
        cfg: &ConfigFile,
        table: NodeTable,
        guard: Arc<dyn ExecutionGuard>,
        store: Arc<dyn ArtifactStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        StageId::ALL.into_iter().fold(Self::new(table), |backend, stage| {
            let stage_cfg = cfg.stage(stage);
            let runner = JobRunner::new(
                JobSpec::from_config(cfg, stage),
                Arc::clone(&guard),
                Arc::clone(&store),
                Arc::clone(&publisher),
                Arc::new(ShellJob::new(stage_cfg.cmd.clone())),
                LogSink::file(stage_cfg.effective_log_path(stage)),
            );
            backend.with_node(NodeProfile::from_config(cfg, stage), runner)
        })
    }

    pub fn table(&self) -> &NodeTable {
        &self.table
    }

    /// Finished jobs, in completion order.
    pub fn records(&self) -> Vec<JobRecord> {
        lock(&self.records).clone()
    }
}

impl NodeBackend for LocalNodeBackend {
    fn state(&self, node: &str) -> NodeState {
        self.table.state(node)
    }

    fn start(&self, request: ActivationRequest) -> LifecycleFuture<'_> {
        Box::pin(async move {
            let Some(local) = self.nodes.get(&request.node) else {
                return Err(BatchrelayError::UnknownNode(request.node.clone()));
            };
            if self.table.begin_start(&request).is_none() {
                return Ok(self.table.state(&request.node));
            }

            let env = local.profile.boot_for_run(
                request.correlation_id.clone(),
                Utc::now(),
                request.run_date,
            );
            self.table.set(&request.node, NodeState::Running);
            info!(
                node = %request.node,
                correlation_id = %request.correlation_id,
                run_date = %env.run_date(),
                "node booted"
            );

            let runner = Arc::clone(&local.runner);
            let records = Arc::clone(&self.records);
            let node = request.node.clone();

            let mut jobs = lock(&self.jobs);
            let handle = tokio::spawn(async move {
                let outcome = runner.run(&env).await.map_err(|e| {
                    error!(node = %node, error = %e, "job runner error");
                    e.to_string()
                });
                lock(&records).push(JobRecord {
                    node,
                    stage: env.stage(),
                    correlation_id: env.correlation_id().clone(),
                    outcome,
                });
            });
            jobs.insert(request.node.clone(), handle);

            Ok(NodeState::Running)
        })
    }

    fn stop<'a>(&'a self, node: &'a str) -> LifecycleFuture<'a> {
        Box::pin(async move {
            if self.table.begin_stop(node).is_none() {
                return Ok(self.table.state(node));
            }

            if let Some(handle) = lock(&self.jobs).remove(node) {
                if !handle.is_finished() {
                    warn!(node, "stopping node with a job still running; aborting it");
                    handle.abort();
                }
            }

            self.table.set(node, NodeState::Stopped);
            info!(node, "node stopped");
            Ok(NodeState::Stopped)
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
