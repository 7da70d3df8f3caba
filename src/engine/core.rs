// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! This module contains a synchronous, deterministic "core runtime" that
//! consumes [`RuntimeEvent`]s and produces:
//! - an updated view of every pipeline run
//! - a list of "commands" describing what the IO shell should do next
//!
//! The async/IO-heavy shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from channels
//! - running watchdog timers
//! - stopping nodes and publishing synthetic failures
//!
//! The core is intended to be unit tested without any Tokio, channels,
//! filesystem, or processes.

use crate::config::ConfigFile;
use crate::engine::event_handlers::{
    ArmedWatchdogs, CoreCommand, CoreStep, Wiring, handle_action_failed, handle_action_issued,
    handle_bus_event, handle_node_changed, handle_tick, handle_watchdog_expired,
};
use crate::engine::sequencer::{PipelineRun, Sequencer};
use crate::engine::{RuntimeEvent, RuntimeOptions};
use crate::types::{CorrelationId, StageId};

/// Pure core runtime state.
///
/// This owns:
/// - the sequencer (one state machine per correlation id)
/// - the set of armed watchdogs
/// - runtime options (e.g. `exit_when_settled`)
///
/// It has **no** channels, no Tokio types, and does not perform any IO.
#[derive(Debug)]
pub struct CoreRuntime {
    sequencer: Sequencer,
    wiring: Wiring,
    armed: ArmedWatchdogs,
    options: RuntimeOptions,
}

impl CoreRuntime {
    pub fn new(sequencer: Sequencer, wiring: Wiring, options: RuntimeOptions) -> Self {
        Self {
            sequencer,
            wiring,
            armed: ArmedWatchdogs::new(),
            options,
        }
    }

    pub fn from_config(cfg: &ConfigFile, options: RuntimeOptions) -> Self {
        Self::new(Sequencer::for_config(cfg), Wiring::from_config(cfg), options)
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn run(&self, correlation_id: &CorrelationId) -> Option<&PipelineRun> {
        self.sequencer.run(correlation_id)
    }

    pub fn is_armed(&self, correlation_id: &CorrelationId, stage: StageId) -> bool {
        self.armed.contains(&(correlation_id.clone(), stage))
    }

    /// Every run seen so far is settled.
    pub fn is_settled(&self) -> bool {
        !self.sequencer.is_empty() && self.sequencer.all_settled()
    }

    /// Handle a single runtime event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        let timeout = self.options.watchdog_timeout;
        let commands = match event {
            RuntimeEvent::Tick(tick) => {
                handle_tick(&mut self.sequencer, &mut self.armed, timeout, tick)
            }
            RuntimeEvent::BusEvent(event) => {
                handle_bus_event(&mut self.sequencer, &mut self.armed, &event)
            }
            RuntimeEvent::NodeChanged(change) => handle_node_changed(&mut self.sequencer, &change),
            RuntimeEvent::ActionIssued {
                controller,
                action,
                trigger,
            } => handle_action_issued(
                &mut self.sequencer,
                &mut self.armed,
                timeout,
                controller,
                &action,
                &trigger,
            ),
            RuntimeEvent::ActionFailed {
                controller,
                action,
                error,
            } => handle_action_failed(controller, &action, &error),
            RuntimeEvent::WatchdogExpired {
                correlation_id,
                stage,
            } => handle_watchdog_expired(
                &mut self.sequencer,
                &mut self.armed,
                &self.wiring,
                timeout,
                correlation_id,
                stage,
            ),
            RuntimeEvent::ShutdownRequested => {
                return CoreStep {
                    commands: vec![CoreCommand::RequestExit],
                    keep_running: false,
                };
            }
        };

        let mut step = CoreStep::continue_with(commands);
        if self.options.exit_when_settled && self.is_settled() {
            step.commands.push(CoreCommand::RequestExit);
            step.keep_running = false;
        }
        step
    }
}
