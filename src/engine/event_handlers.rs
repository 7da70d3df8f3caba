// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bus::Event;
use crate::config::ConfigFile;
use crate::controller::{ControllerKind, ScheduleTick, Trigger};
use crate::engine::WATCHDOG_REASON;
use crate::engine::sequencer::{Applied, Observation, Sequencer};
use crate::errors::BatchrelayError;
use crate::node::{ActionKind, LifecycleAction, NodeChange};
use crate::types::{CorrelationId, EventStatus, NodeState, StageId};

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreCommand {
    /// Start a timer that reports `WatchdogExpired` after `after`.
    ArmWatchdog {
        correlation_id: CorrelationId,
        stage: StageId,
        after: Duration,
    },
    /// Cancel a pending timer.
    DisarmWatchdog {
        correlation_id: CorrelationId,
        stage: StageId,
    },
    /// Stop a node whose completion never arrived.
    ForceStop {
        node: String,
        stage: StageId,
        correlation_id: CorrelationId,
    },
    /// Publish a synthetic completion on behalf of a node.
    PublishFailure(Event),
    /// Request that the runtime exits (used for `--once` when settled).
    RequestExit,
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone)]
pub struct CoreStep {
    /// Commands the IO shell should execute.
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl CoreStep {
    pub fn continue_with(commands: Vec<CoreCommand>) -> Self {
        Self {
            commands,
            keep_running: true,
        }
    }
}

/// Node and topic names of both stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wiring {
    pub collect_node: String,
    pub process_node: String,
    pub collect_topic: String,
    pub process_topic: String,
}

impl Wiring {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self {
            collect_node: cfg.node_of(StageId::Collect).to_string(),
            process_node: cfg.node_of(StageId::Process).to_string(),
            collect_topic: cfg.topic(StageId::Collect).to_string(),
            process_topic: cfg.topic(StageId::Process).to_string(),
        }
    }

    pub fn node(&self, stage: StageId) -> &str {
        match stage {
            StageId::Collect => &self.collect_node,
            StageId::Process => &self.process_node,
        }
    }

    pub fn topic(&self, stage: StageId) -> &str {
        match stage {
            StageId::Collect => &self.collect_topic,
            StageId::Process => &self.process_topic,
        }
    }
}

/// Armed watchdogs, one per (run, stage).
pub type ArmedWatchdogs = BTreeSet<(CorrelationId, StageId)>;

/// A schedule tick opens a run and arms the collect watchdog.
pub fn handle_tick(
    sequencer: &mut Sequencer,
    armed: &mut ArmedWatchdogs,
    timeout: Duration,
    tick: ScheduleTick,
) -> Vec<CoreCommand> {
    let cid = tick.correlation_id;
    match sequencer.observe(&cid, Observation::Scheduled) {
        Applied::Ignored => {
            debug!(correlation_id = %cid, "duplicate tick ignored");
            Vec::new()
        }
        _ => {
            info!(correlation_id = %cid, fired_at = %tick.fired_at, "pipeline run scheduled");
            arm(armed, cid, StageId::Collect, timeout)
                .into_iter()
                .collect()
        }
    }
}

/// A completion event moves its run forward and disarms that stage's
/// watchdog.
pub fn handle_bus_event(
    sequencer: &mut Sequencer,
    armed: &mut ArmedWatchdogs,
    event: &Event,
) -> Vec<CoreCommand> {
    let Some(stage) = sequencer.stage_of_topic(&event.topic) else {
        debug!(topic = %event.topic, "event on unrelated topic ignored");
        return Vec::new();
    };
    let cid = &event.correlation_id;

    match sequencer.observe(cid, Observation::Completed(stage, event.status)) {
        Applied::Ignored => {
            debug!(topic = %event.topic, correlation_id = %cid, "duplicate completion ignored");
            Vec::new()
        }
        Applied::Anomaly(anomaly) => {
            warn!(
                topic = %event.topic,
                correlation_id = %cid,
                phase = %anomaly.phase,
                "completion observed out of stage order; not applied"
            );
            Vec::new()
        }
        applied => {
            if let Applied::Advanced { from, to } = applied {
                info!(correlation_id = %cid, %from, %to, status = %event.status, "run advanced");
            }
            if event.status == EventStatus::Failed {
                warn!(
                    stage = %stage,
                    correlation_id = %cid,
                    reason = event.reason().unwrap_or("unknown"),
                    "stage reported failure"
                );
            }
            disarm(armed, cid, stage).into_iter().collect()
        }
    }
}

/// A controller acted. The triggering event is applied first, so the action
/// is always judged against what caused it.
pub fn handle_action_issued(
    sequencer: &mut Sequencer,
    armed: &mut ArmedWatchdogs,
    timeout: Duration,
    controller: ControllerKind,
    action: &LifecycleAction,
    trigger: &Trigger,
) -> Vec<CoreCommand> {
    let mut commands = match trigger {
        Trigger::Event(event) => handle_bus_event(sequencer, armed, event),
        Trigger::Tick(_) => Vec::new(),
    };

    if action.kind == ActionKind::Stop {
        debug!(controller = %controller, node = %action.node, correlation_id = %action.correlation_id, "stop issued");
        return commands;
    }

    let cid = &action.correlation_id;
    match sequencer.observe(cid, Observation::ActivationIssued(action.stage)) {
        Applied::Anomaly(anomaly) => {
            warn!(
                controller = %controller,
                node = %action.node,
                correlation_id = %cid,
                phase = %anomaly.phase,
                "activation issued before the previous stage completed; node will be stopped once up"
            );
        }
        Applied::Ignored => {}
        _ => commands.extend(arm(armed, cid.clone(), action.stage, timeout)),
    }
    commands
}

pub fn handle_action_failed(
    controller: ControllerKind,
    action: &LifecycleAction,
    error: &str,
) -> Vec<CoreCommand> {
    warn!(
        controller = %controller,
        node = %action.node,
        action = ?action.kind,
        correlation_id = %action.correlation_id,
        error,
        "lifecycle action failed; watchdog will reap the run if it stalls"
    );
    Vec::new()
}

pub fn handle_node_changed(sequencer: &mut Sequencer, change: &NodeChange) -> Vec<CoreCommand> {
    let Some(cid) = change.correlation_id.as_ref() else {
        return Vec::new();
    };
    let observation = match change.to {
        NodeState::Running => Observation::NodeRunning(change.stage),
        NodeState::Stopped => Observation::NodeStopped(change.stage),
        NodeState::Starting | NodeState::Stopping => return Vec::new(),
    };

    match sequencer.observe(cid, observation) {
        Applied::Advanced { from, to } => {
            info!(correlation_id = %cid, node = %change.node, %from, %to, "run advanced");
            Vec::new()
        }
        // Up without its stage being due: nothing will ever complete or
        // watch it, so take it down now.
        Applied::Anomaly(anomaly) if change.to == NodeState::Running => {
            warn!(
                correlation_id = %cid,
                node = %change.node,
                phase = %anomaly.phase,
                "node came up out of stage order; stopping it"
            );
            vec![CoreCommand::ForceStop {
                node: change.node.clone(),
                stage: change.stage,
                correlation_id: cid.clone(),
            }]
        }
        _ => Vec::new(),
    }
}

/// The stage never completed in time: time the run out, stop the node and
/// publish the failure the node could not.
pub fn handle_watchdog_expired(
    sequencer: &mut Sequencer,
    armed: &mut ArmedWatchdogs,
    wiring: &Wiring,
    timeout: Duration,
    correlation_id: CorrelationId,
    stage: StageId,
) -> Vec<CoreCommand> {
    if !armed.remove(&(correlation_id.clone(), stage)) {
        debug!(correlation_id = %correlation_id, stage = %stage, "stale watchdog expiry ignored");
        return Vec::new();
    }

    if !sequencer
        .observe(&correlation_id, Observation::WatchdogExpired(stage))
        .advanced()
    {
        return Vec::new();
    }

    let gap = BatchrelayError::EventDeliveryGap {
        topic: wiring.topic(stage).to_string(),
        correlation_id: correlation_id.to_string(),
        waited_secs: timeout.as_secs(),
    };
    warn!(stage = %stage, error = %gap, "watchdog expired");

    let started = sequencer
        .run(&correlation_id)
        .is_some_and(|run| run.was_started(stage));
    if !started {
        return Vec::new();
    }

    let node = wiring.node(stage).to_string();
    let failure = Event::failed(wiring.topic(stage), correlation_id.clone(), WATCHDOG_REASON)
        .with_metadata("node", node.clone())
        .with_metadata("stage", stage.as_str());

    vec![
        CoreCommand::ForceStop {
            node,
            stage,
            correlation_id,
        },
        CoreCommand::PublishFailure(failure),
    ]
}

fn arm(
    armed: &mut ArmedWatchdogs,
    correlation_id: CorrelationId,
    stage: StageId,
    after: Duration,
) -> Option<CoreCommand> {
    armed
        .insert((correlation_id.clone(), stage))
        .then_some(CoreCommand::ArmWatchdog {
            correlation_id,
            stage,
            after,
        })
}

fn disarm(armed: &mut ArmedWatchdogs, correlation_id: &CorrelationId, stage: StageId) -> Option<CoreCommand> {
    armed
        .remove(&(correlation_id.clone(), stage))
        .then(|| CoreCommand::DisarmWatchdog {
            correlation_id: correlation_id.clone(),
            stage,
        })
}
