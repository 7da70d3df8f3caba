// src/exec/mod.rs

//! Job execution layer.
//!
//! - [`runner`] owns the guard → sync → body → publish sequence of one node
//!   activation.
//! - [`body`] defines the `JobBody` seam and the shell implementation.
//! - [`sink`] is the append-only per-node log.
//! - [`shell`] holds process helpers shared with the bus and node backends.

pub mod body;
pub mod runner;
pub mod shell;
pub mod sink;

pub use body::{BodyFuture, JobBody, JobContext, ShellJob};
pub use runner::{JobResult, JobRunner, JobSpec};
pub use sink::LogSink;
