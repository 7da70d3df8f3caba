// src/engine/mod.rs

//! Orchestration engine for batchrelay.
//!
//! This module ties together:
//! - the per-run pipeline state machine ([`sequencer`])
//! - the watchdog that reaps nodes whose completion never arrives
//! - the daily schedule ([`schedule`])
//! - the runtime event loop that reacts to:
//!   - schedule ticks
//!   - completion events from the bus
//!   - node state changes and controller actions
//!   - watchdog expiries and shutdown signals
//!
//! The pure core lives in [`core`] and [`event_handlers`]; the async/IO shell
//! is implemented in [`runtime`] and wired up by [`orchestrator`].

use std::time::Duration;

use crate::bus::Event;
use crate::controller::{ControllerKind, ScheduleTick, Trigger};
use crate::node::{LifecycleAction, NodeChange};
use crate::types::{CorrelationId, StageId};

/// Reason carried by the synthetic failure of a timed-out stage.
pub const WATCHDOG_REASON: &str = "watchdog_timeout";

/// Runtime options used by both the core and the async shell.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// Exit once every run seen so far is settled (used for `--once`).
    pub exit_when_settled: bool,
    /// How long a started stage may go without a completion event.
    pub watchdog_timeout: Duration,
}

/// Events flowing into the runtime from the scheduler, bus, nodes and
/// controllers.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// The schedule fired for a new run.
    Tick(ScheduleTick),
    /// A completion event was delivered on a stage topic.
    BusEvent(Event),
    /// A node changed lifecycle state.
    NodeChanged(NodeChange),
    /// A controller is about to carry out `action` because of `trigger`.
    ActionIssued {
        controller: ControllerKind,
        action: LifecycleAction,
        trigger: Trigger,
    },
    /// The backend rejected a controller's action.
    ActionFailed {
        controller: ControllerKind,
        action: LifecycleAction,
        error: String,
    },
    /// No completion arrived for `stage` of a run within the timeout.
    WatchdogExpired {
        correlation_id: CorrelationId,
        stage: StageId,
    },
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

pub mod core;
pub mod event_handlers;
pub mod orchestrator;
pub mod runtime;
pub mod schedule;
pub mod sequencer;

pub use core::CoreRuntime;
pub use event_handlers::{CoreCommand, CoreStep, Wiring};
pub use orchestrator::{Orchestrator, OrchestratorHandle, Ticker};
pub use runtime::Runtime;
pub use schedule::{DailySchedule, spawn_scheduler};
pub use sequencer::{Anomaly, Applied, Observation, PipelinePhase, PipelineRun, Sequencer};
