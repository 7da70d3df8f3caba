// src/guard/memory.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{ExecutionGuard, Holder, LockRecord, LockToken};
use crate::errors::Result;

type Held = HashMap<String, DateTime<Utc>>;

/// In-process guard: one table of held nodes shared by all clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryGuard {
    held: Arc<Mutex<Held>>,
}

impl MemoryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `node`'s lock, if any.
    pub fn holder(&self, node: &str) -> Option<LockRecord> {
        lock(&self.held).get(node).map(|since| LockRecord {
            node: node.to_string(),
            held_since: *since,
        })
    }
}

impl ExecutionGuard for MemoryGuard {
    fn try_acquire(&self, node: &str) -> Result<Option<LockToken>> {
        let mut held = lock(&self.held);
        if held.contains_key(node) {
            return Ok(None);
        }

        let held_since = Utc::now();
        held.insert(node.to_string(), held_since);

        Ok(Some(LockToken {
            record: LockRecord {
                node: node.to_string(),
                held_since,
            },
            _holder: Holder::Memory(Release {
                held: Arc::clone(&self.held),
                node: node.to_string(),
            }),
        }))
    }
}

/// Removes the node from the table when the token goes away.
#[derive(Debug)]
pub(super) struct Release {
    held: Arc<Mutex<Held>>,
    node: String,
}

impl Drop for Release {
    fn drop(&mut self) {
        lock(&self.held).remove(&self.node);
    }
}

fn lock(held: &Mutex<Held>) -> MutexGuard<'_, Held> {
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
