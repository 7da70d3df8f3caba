use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use batchrelay::errors::BatchrelayError;
use batchrelay::node::{ActivationRequest, LifecycleFuture, NodeBackend, NodeTable};
use batchrelay::types::NodeState;

/// One call made on the fake backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Start(ActivationRequest),
    Stop(String),
}

/// A fake node backend that:
/// - records every start/stop call, including no-ops
/// - boots and stops nodes instantly through the shared `NodeTable`
/// - runs no jobs; tests publish completion events themselves.
#[derive(Debug, Clone, Default)]
pub struct FakeNodeBackend {
    table: NodeTable,
    calls: Arc<Mutex<Vec<FakeCall>>>,
    failing_starts: Arc<Mutex<HashSet<String>>>,
}

impl FakeNodeBackend {
    pub fn new(table: NodeTable) -> Self {
        Self {
            table,
            ..Self::default()
        }
    }

    pub fn table(&self) -> &NodeTable {
        &self.table
    }

    /// Make every start of `node` fail.
    pub fn fail_starts_of(&self, node: &str) {
        self.failing_starts.lock().unwrap().insert(node.to_string());
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Starts that actually changed the node's state.
    pub fn effective_starts(&self, node: &str) -> usize {
        self.count_transitions(node, NodeState::Starting)
    }

    /// Stops that actually changed the node's state.
    pub fn effective_stops(&self, node: &str) -> usize {
        self.count_transitions(node, NodeState::Stopping)
    }

    fn count_transitions(&self, node: &str, to: NodeState) -> usize {
        self.table
            .history()
            .iter()
            .filter(|c| c.node == node && c.to == to)
            .count()
    }
}

impl NodeBackend for FakeNodeBackend {
    fn state(&self, node: &str) -> NodeState {
        self.table.state(node)
    }

    fn start(&self, request: ActivationRequest) -> LifecycleFuture<'_> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push(FakeCall::Start(request.clone()));

            if self.failing_starts.lock().unwrap().contains(&request.node) {
                return Err(BatchrelayError::Other(anyhow::anyhow!(
                    "injected start failure for {}",
                    request.node
                )));
            }

            if self.table.begin_start(&request).is_none() {
                return Ok(self.table.state(&request.node));
            }
            self.table.set(&request.node, NodeState::Running);
            Ok(NodeState::Running)
        })
    }

    fn stop<'a>(&'a self, node: &'a str) -> LifecycleFuture<'a> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push(FakeCall::Stop(node.to_string()));

            if self.table.begin_stop(node).is_none() {
                return Ok(self.table.state(node));
            }
            self.table.set(node, NodeState::Stopped);
            Ok(NodeState::Stopped)
        })
    }
}
