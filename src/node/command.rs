// src/node/command.rs

use tracing::{info, warn};

use super::{ActivationRequest, LifecycleFuture, NodeBackend, NodeTable};
use crate::config::ConfigFile;
use crate::errors::{BatchrelayError, Result};
use crate::exec::shell::{render_template, run_checked};
use crate::types::NodeState;

/// Starts and stops nodes by running `start_cmd` / `stop_cmd`.
///
/// A successful start command means the node accepted the boot request;
/// the node then runs its job and publishes on its own.
#[derive(Debug, Clone)]
pub struct CommandNodeBackend {
    table: NodeTable,
    start_cmd: String,
    stop_cmd: String,
}

impl CommandNodeBackend {
    pub fn new(table: NodeTable, start_cmd: impl Into<String>, stop_cmd: impl Into<String>) -> Self {
        Self {
            table,
            start_cmd: start_cmd.into(),
            stop_cmd: stop_cmd.into(),
        }
    }

    pub fn from_config(cfg: &ConfigFile, table: NodeTable) -> Result<Self> {
        let start = cfg.node.start_cmd.clone().ok_or_else(|| {
            BatchrelayError::ConfigError("[node].start_cmd is required for remote nodes".into())
        })?;
        let stop = cfg.node.stop_cmd.clone().ok_or_else(|| {
            BatchrelayError::ConfigError("[node].stop_cmd is required for remote nodes".into())
        })?;
        Ok(Self::new(table, start, stop))
    }

    pub fn table(&self) -> &NodeTable {
        &self.table
    }

    /// Placeholders: `{node}`, `{stage}`, `{correlation_id}` and `{run_date}`
    /// (empty when the run has no fixed date, and on stop).
    async fn run_lifecycle(&self, template: &str, placeholders: &[(&str, &str)]) -> Result<()> {
        let script = render_template(template, placeholders);
        run_checked(&script, &[]).await?;
        Ok(())
    }
}

impl NodeBackend for CommandNodeBackend {
    fn state(&self, node: &str) -> NodeState {
        self.table.state(node)
    }

    fn start(&self, request: ActivationRequest) -> LifecycleFuture<'_> {
        Box::pin(async move {
            let Some(previous) = self.table.begin_start(&request) else {
                return Ok(self.table.state(&request.node));
            };

            info!(node = %request.node, correlation_id = %request.correlation_id, "starting node");
            let run_date = request
                .run_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            let result = self
                .run_lifecycle(
                    &self.start_cmd,
                    &[
                        ("node", request.node.as_str()),
                        ("stage", request.stage.as_str()),
                        ("correlation_id", request.correlation_id.as_str()),
                        ("run_date", run_date.as_str()),
                    ],
                )
                .await;

            match result {
                Ok(()) => {
                    self.table.set(&request.node, NodeState::Running);
                    Ok(NodeState::Running)
                }
                Err(e) => {
                    warn!(node = %request.node, error = %e, "start command failed; reverting");
                    self.table.set(&request.node, previous);
                    Err(e)
                }
            }
        })
    }

    fn stop<'a>(&'a self, node: &'a str) -> LifecycleFuture<'a> {
        Box::pin(async move {
            let Some(previous) = self.table.begin_stop(node) else {
                return Ok(self.table.state(node));
            };

            let cid = self
                .table
                .activation(node)
                .map(|c| c.to_string())
                .unwrap_or_default();
            let stage = self
                .table
                .stage(node)
                .map(|s| s.to_string())
                .unwrap_or_default();

            info!(node, correlation_id = %cid, "stopping node");
            let placeholders = [
                ("node", node),
                ("stage", stage.as_str()),
                ("correlation_id", cid.as_str()),
                ("run_date", ""),
            ];
            match self.run_lifecycle(&self.stop_cmd, &placeholders).await {
                Ok(()) => {
                    self.table.set(node, NodeState::Stopped);
                    Ok(NodeState::Stopped)
                }
                Err(e) => {
                    warn!(node, error = %e, "stop command failed; reverting");
                    self.table.set(node, previous);
                    Err(e)
                }
            }
        })
    }
}
