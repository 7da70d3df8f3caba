// src/node/mod.rs

//! Node lifecycle: starting and stopping the ephemeral compute units.
//!
//! Backends share a [`NodeTable`] that makes start/stop idempotent and
//! reports every state change together with the activation's correlation id.
//!
//! - [`command`] drives real nodes through configured shell commands.
//! - [`local`] hosts nodes in-process and runs their job on boot.

pub mod command;
pub mod local;
mod table;

use std::future::Future;
use std::pin::Pin;

use chrono::NaiveDate;

use crate::errors::Result;
use crate::types::{CorrelationId, NodeState, StageId};

pub use command::CommandNodeBackend;
pub use local::{JobRecord, LocalNodeBackend};
pub use table::{HISTORY_LIMIT, NodeChange, NodeTable};

/// What a start request needs to boot a node for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRequest {
    pub node: String,
    pub stage: StageId,
    pub correlation_id: CorrelationId,
    /// Date the run works on, fixed when the run was scheduled.
    pub run_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Start,
    Stop,
}

/// The single lifecycle action a controller may issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleAction {
    pub kind: ActionKind,
    pub node: String,
    pub stage: StageId,
    pub correlation_id: CorrelationId,
    pub run_date: Option<NaiveDate>,
}

impl LifecycleAction {
    pub fn start(node: impl Into<String>, stage: StageId, correlation_id: CorrelationId) -> Self {
        Self {
            kind: ActionKind::Start,
            node: node.into(),
            stage,
            correlation_id,
            run_date: None,
        }
    }

    pub fn stop(node: impl Into<String>, stage: StageId, correlation_id: CorrelationId) -> Self {
        Self {
            kind: ActionKind::Stop,
            node: node.into(),
            stage,
            correlation_id,
            run_date: None,
        }
    }

    pub fn with_run_date(mut self, run_date: Option<NaiveDate>) -> Self {
        self.run_date = run_date;
        self
    }

    pub fn activation(&self) -> ActivationRequest {
        ActivationRequest {
            node: self.node.clone(),
            stage: self.stage,
            correlation_id: self.correlation_id.clone(),
            run_date: self.run_date,
        }
    }
}

pub type LifecycleFuture<'a> = Pin<Box<dyn Future<Output = Result<NodeState>> + Send + 'a>>;

/// Start/stop operations on nodes. Both must be idempotent: starting a node
/// that is already up, or stopping one that is already down, changes nothing
/// and reports the current state.
pub trait NodeBackend: Send + Sync {
    fn state(&self, node: &str) -> NodeState;

    fn start(&self, request: ActivationRequest) -> LifecycleFuture<'_>;

    fn stop<'a>(&'a self, node: &'a str) -> LifecycleFuture<'a>;
}

/// Carry out a controller's action on a backend.
pub async fn apply(backend: &dyn NodeBackend, action: &LifecycleAction) -> Result<NodeState> {
    match action.kind {
        ActionKind::Start => backend.start(action.activation()).await,
        ActionKind::Stop => backend.stop(&action.node).await,
    }
}
