// src/guard/mod.rs

//! Per-node execution guard.
//!
//! A job body may only run while its node's guard is held. Acquisition never
//! blocks: if another execution holds the lock the caller gets `Ok(None)` and
//! is expected to skip quietly. The lock is released when the returned
//! [`LockToken`] is dropped, which also happens when the holding task is
//! aborted or the process dies.
//!
//! - [`file`] uses an OS advisory lock, so exclusion holds across processes
//!   and restarts.
//! - [`memory`] is an in-process table for single-process pipelines.

pub mod file;
pub mod memory;

use std::fmt::Debug;

use chrono::{DateTime, Utc};

use crate::errors::Result;

pub use file::FileLockGuard;
pub use memory::MemoryGuard;

/// Who holds a node's lock and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub node: String,
    pub held_since: DateTime<Utc>,
}

/// Mutual exclusion of job executions on one node.
pub trait ExecutionGuard: Send + Sync + Debug {
    /// Try to take the node's lock without waiting.
    ///
    /// `Ok(None)` means another execution already holds it.
    fn try_acquire(&self, node: &str) -> Result<Option<LockToken>>;
}

/// Proof of holding a node's lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockToken {
    record: LockRecord,
    _holder: Holder,
}

// Held only for its drop behaviour.
#[allow(dead_code)]
#[derive(Debug)]
enum Holder {
    /// The open, locked file; closing the descriptor releases the OS lock.
    File(std::fs::File),
    Memory(memory::Release),
}

impl LockToken {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn node(&self) -> &str {
        &self.record.node
    }
}
