// src/types.rs

//! Small shared vocabulary types used across the crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The two stages of the pipeline.
///
/// - `Collect` gathers raw data and publishes to topic A.
/// - `Process` consumes the collected artifacts and publishes to topic B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    Collect,
    Process,
}

impl StageId {
    pub const ALL: [StageId; 2] = [StageId::Collect, StageId::Process];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Collect => "collect",
            StageId::Process => "process",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "collect" => Ok(StageId::Collect),
            "process" => Ok(StageId::Process),
            other => Err(format!(
                "invalid stage: {other} (expected \"collect\" or \"process\")"
            )),
        }
    }
}

/// Lifecycle state of a compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl NodeState {
    /// Whether a start request should be a no-op in this state.
    pub fn is_up(&self) -> bool {
        matches!(self, NodeState::Starting | NodeState::Running)
    }

    /// Whether a stop request should be a no-op in this state.
    pub fn is_down(&self) -> bool {
        matches!(self, NodeState::Stopped | NodeState::Stopping)
    }
}

/// Status of a job bound to a node activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Status carried by a completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Done,
    Failed,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventStatus::Done => f.write_str("done"),
            EventStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Identifier threading every event and artifact of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh random id for a new run.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
