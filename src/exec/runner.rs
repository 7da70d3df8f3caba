// src/exec/runner.rs

//! One-shot, non-retrying job execution for a node activation.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use super::body::{JobBody, JobContext};
use super::sink::LogSink;
use crate::bus::{Event, EventPublisher, META_RUN_DATE};
use crate::config::{ConfigFile, NodeEnvironment};
use crate::errors::{BatchrelayError, Result};
use crate::guard::ExecutionGuard;
use crate::store::{ArtifactStore, Bucket};
use crate::types::{JobStatus, StageId};

/// Static description of a stage's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub stage: StageId,
    pub topic: String,
    pub code_bucket: Bucket,
    pub code_prefix: Option<String>,
    pub work_dir: PathBuf,
}

impl JobSpec {
    pub fn from_config(cfg: &ConfigFile, stage: StageId) -> Self {
        let stage_cfg = cfg.stage(stage);
        Self {
            stage,
            topic: cfg.topic(stage).to_string(),
            code_bucket: stage_cfg.effective_code_bucket(stage),
            code_prefix: stage_cfg.code_prefix.clone(),
            work_dir: stage_cfg.effective_work_dir(stage),
        }
    }
}

/// Outcome of one [`JobRunner::run`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    /// `Idle` when the guard refused the run.
    pub status: JobStatus,
    pub log_ref: String,
    /// Whether the completion event reached the bus.
    pub published: bool,
    pub reason: Option<String>,
}

impl JobResult {
    pub fn skipped(&self) -> bool {
        self.status == JobStatus::Idle
    }
}

pub struct JobRunner {
    spec: JobSpec,
    guard: Arc<dyn ExecutionGuard>,
    store: Arc<dyn ArtifactStore>,
    publisher: Arc<dyn EventPublisher>,
    body: Arc<dyn JobBody>,
    sink: LogSink,
}

impl JobRunner {
    pub fn new(
        spec: JobSpec,
        guard: Arc<dyn ExecutionGuard>,
        store: Arc<dyn ArtifactStore>,
        publisher: Arc<dyn EventPublisher>,
        body: Arc<dyn JobBody>,
        sink: LogSink,
    ) -> Self {
        Self {
            spec,
            guard,
            store,
            publisher,
            body,
            sink,
        }
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    /// Run the job at most once for this activation.
    ///
    /// Lock contention is a quiet skip. Any failure after the lock is taken
    /// becomes a `Failed` status and a `failed` event; nothing is retried.
    /// The returned error is reserved for the guard itself failing.
    pub async fn run(&self, env: &NodeEnvironment) -> Result<JobResult> {
        let node = env.node();
        let log_ref = self.sink.reference();

        let Some(token) = self.guard.try_acquire(node)? else {
            info!(
                node,
                stage = %env.stage(),
                correlation_id = %env.correlation_id(),
                "another execution holds the node lock; skipping"
            );
            return Ok(JobResult {
                status: JobStatus::Idle,
                log_ref,
                published: false,
                reason: None,
            });
        };

        info!(
            node,
            stage = %env.stage(),
            correlation_id = %env.correlation_id(),
            held_since = %token.record().held_since,
            "job admitted"
        );
        self.log(&format!(
            "=== {} start stage={} node={} correlation_id={} run_date={} ===",
            Utc::now().to_rfc3339(),
            env.stage(),
            node,
            env.correlation_id(),
            env.run_date()
        ));

        let (status, reason) = match self.execute(env).await {
            Ok(()) => (JobStatus::Succeeded, None),
            Err(e) => {
                error!(node, correlation_id = %env.correlation_id(), error = %e, "job failed");
                (JobStatus::Failed, Some(e.to_string()))
            }
        };

        self.log(&format!(
            "=== {} end status={:?}{} ===",
            Utc::now().to_rfc3339(),
            status,
            reason
                .as_deref()
                .map(|r| format!(" reason={r}"))
                .unwrap_or_default()
        ));

        let event = self.completion_event(env, reason.as_deref());
        let published = match self.publisher.publish(event).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    node,
                    topic = %self.spec.topic,
                    correlation_id = %env.correlation_id(),
                    error = %e,
                    "failed to publish completion event"
                );
                false
            }
        };

        drop(token);

        Ok(JobResult {
            status,
            log_ref,
            published,
            reason,
        })
    }

    async fn execute(&self, env: &NodeEnvironment) -> Result<()> {
        std::fs::create_dir_all(&self.spec.work_dir)?;
        self.sync_code()?;

        let ctx = JobContext {
            env,
            store: self.store.as_ref(),
            sink: &self.sink,
            work_dir: &self.spec.work_dir,
        };
        self.body.execute(ctx).await
    }

    fn sync_code(&self) -> Result<()> {
        let Some(prefix) = self.spec.code_prefix.as_deref() else {
            return Ok(());
        };

        let bucket = self.spec.code_bucket;
        match self.store.sync(bucket, prefix, &self.spec.work_dir) {
            Ok(files) => {
                info!(bucket = %bucket, prefix, files = files.len(), "synchronised job code");
                Ok(())
            }
            Err(e @ BatchrelayError::ArtifactUnavailable { .. }) => Err(e),
            Err(e) => Err(BatchrelayError::ArtifactUnavailable {
                bucket: bucket.to_string(),
                key: prefix.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn completion_event(&self, env: &NodeEnvironment, failure: Option<&str>) -> Event {
        let correlation_id = env.correlation_id().clone();
        let event = match failure {
            None => Event::done(&self.spec.topic, correlation_id),
            Some(reason) => Event::failed(&self.spec.topic, correlation_id, reason),
        };
        event
            .with_metadata("node", env.node())
            .with_metadata("stage", env.stage().as_str())
            .with_metadata(META_RUN_DATE, env.run_date().format("%Y-%m-%d").to_string())
            .with_metadata("log", self.sink.reference())
    }

    fn log(&self, line: &str) {
        if let Err(e) = self.sink.append(line) {
            warn!(error = %e, log = %self.sink.reference(), "failed to append to log sink");
        }
    }
}
