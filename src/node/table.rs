// src/node/table.rs

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;

use super::ActivationRequest;
use crate::types::{CorrelationId, NodeState, StageId};

/// One observed node state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeChange {
    pub node: String,
    pub stage: StageId,
    pub from: NodeState,
    pub to: NodeState,
    /// Run the node was last activated for.
    pub correlation_id: Option<CorrelationId>,
}

#[derive(Debug, Clone)]
struct NodeEntry {
    state: NodeState,
    stage: StageId,
    correlation_id: Option<CorrelationId>,
}

/// Changes kept in the table history.
pub const HISTORY_LIMIT: usize = 1024;

#[derive(Debug, Default)]
struct TableState {
    nodes: HashMap<String, NodeEntry>,
    listeners: Vec<mpsc::UnboundedSender<NodeChange>>,
    history: VecDeque<NodeChange>,
}

/// Shared node state table. Clones see the same nodes.
#[derive(Debug, Clone, Default)]
pub struct NodeTable {
    inner: Arc<Mutex<TableState>>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown nodes are `Stopped`.
    pub fn state(&self, node: &str) -> NodeState {
        self.lock()
            .nodes
            .get(node)
            .map(|e| e.state)
            .unwrap_or_default()
    }

    pub fn activation(&self, node: &str) -> Option<CorrelationId> {
        self.lock()
            .nodes
            .get(node)
            .and_then(|e| e.correlation_id.clone())
    }

    pub fn stage(&self, node: &str) -> Option<StageId> {
        self.lock().nodes.get(node).map(|e| e.stage)
    }

    /// Subscribe to every change from now on.
    pub fn watch(&self) -> mpsc::UnboundedReceiver<NodeChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().listeners.push(tx);
        rx
    }

    /// The last [`HISTORY_LIMIT`] changes, oldest first.
    pub fn history(&self) -> Vec<NodeChange> {
        self.lock().history.iter().cloned().collect()
    }

    /// Move a down node to `Starting` for `request`.
    ///
    /// Returns the previous state, or `None` when the node is already up and
    /// the start is a no-op.
    pub fn begin_start(&self, request: &ActivationRequest) -> Option<NodeState> {
        let mut table = self.lock();
        let previous = table
            .nodes
            .get(&request.node)
            .map(|e| e.state)
            .unwrap_or_default();
        if previous.is_up() {
            return None;
        }

        table.nodes.insert(
            request.node.clone(),
            NodeEntry {
                state: previous,
                stage: request.stage,
                correlation_id: Some(request.correlation_id.clone()),
            },
        );
        transition(&mut table, &request.node, NodeState::Starting);
        Some(previous)
    }

    /// Move an up node to `Stopping`.
    ///
    /// Returns the previous state, or `None` when the node is already down.
    pub fn begin_stop(&self, node: &str) -> Option<NodeState> {
        let mut table = self.lock();
        let previous = table.nodes.get(node).map(|e| e.state).unwrap_or_default();
        if previous.is_down() {
            return None;
        }
        transition(&mut table, node, NodeState::Stopping);
        Some(previous)
    }

    /// Record a state reached by the backend.
    pub fn set(&self, node: &str, to: NodeState) {
        transition(&mut self.lock(), node, to);
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn transition(table: &mut TableState, node: &str, to: NodeState) {
    let Some(entry) = table.nodes.get_mut(node) else {
        return;
    };
    if entry.state == to {
        return;
    }

    let change = NodeChange {
        node: node.to_string(),
        stage: entry.stage,
        from: entry.state,
        to,
        correlation_id: entry.correlation_id.clone(),
    };
    entry.state = to;

    debug!(
        node,
        from = ?change.from,
        to = ?change.to,
        correlation_id = ?change.correlation_id,
        "node state changed"
    );

    table.listeners.retain(|tx| tx.send(change.clone()).is_ok());
    table.history.push_back(change);
    if table.history.len() > HISTORY_LIMIT {
        table.history.pop_front();
    }
}
