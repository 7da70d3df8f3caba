// src/engine/sequencer.rs

//! Explicit per-run pipeline state machine.
//!
//! The protocol between controllers is emergent: nobody owns the pipeline's
//! state. The sequencer reconstructs it as one [`PipelineRun`] per
//! correlation id from what the orchestrator observes (ticks, issued actions,
//! node changes, completion events) or from a bus history.
//!
//! Observations are applied monotonically. A phase never moves backwards, so
//! stale or duplicated observations are simply ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::bus::Event;
use crate::config::ConfigFile;
use crate::types::{CorrelationId, EventStatus, StageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelinePhase {
    Scheduled,
    Activating(StageId),
    Running(StageId),
    Done(StageId),
    Idle,
    Failed(StageId),
    TimedOut(StageId),
}

impl PipelinePhase {
    /// Position in the phase order; a run never moves to a lower rank.
    pub fn rank(&self) -> u8 {
        let stage_base = |s: &StageId| match s {
            StageId::Collect => 0,
            StageId::Process => 3,
        };
        match self {
            PipelinePhase::Scheduled => 0,
            PipelinePhase::Activating(s) => 1 + stage_base(s),
            PipelinePhase::Running(s) => 2 + stage_base(s),
            PipelinePhase::Done(s) => 3 + stage_base(s),
            PipelinePhase::Idle => 7,
            PipelinePhase::Failed(_) | PipelinePhase::TimedOut(_) => 8,
        }
    }

    /// No further phase change is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelinePhase::Idle | PipelinePhase::Failed(_) | PipelinePhase::TimedOut(_)
        )
    }

    pub fn is_success(&self) -> bool {
        *self == PipelinePhase::Idle
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelinePhase::Scheduled => f.write_str("scheduled"),
            PipelinePhase::Activating(s) => write!(f, "{s}-activating"),
            PipelinePhase::Running(s) => write!(f, "{s}-running"),
            PipelinePhase::Done(s) => write!(f, "{s}-done"),
            PipelinePhase::Idle => f.write_str("idle"),
            PipelinePhase::Failed(s) => write!(f, "{s}-failed"),
            PipelinePhase::TimedOut(s) => write!(f, "{s}-timed-out"),
        }
    }
}

/// Something the orchestrator saw happen for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Scheduled,
    ActivationIssued(StageId),
    NodeRunning(StageId),
    Completed(StageId, EventStatus),
    NodeStopped(StageId),
    WatchdogExpired(StageId),
}

impl Observation {
    pub fn stage(&self) -> Option<StageId> {
        match self {
            Observation::Scheduled => None,
            Observation::ActivationIssued(s)
            | Observation::NodeRunning(s)
            | Observation::Completed(s, _)
            | Observation::NodeStopped(s)
            | Observation::WatchdogExpired(s) => Some(*s),
        }
    }
}

/// An observation that would break stage ordering. Kept for auditing, never
/// applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub correlation_id: CorrelationId,
    pub observation: Observation,
    pub phase: PipelinePhase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Advanced {
        from: PipelinePhase,
        to: PipelinePhase,
    },
    /// Bookkeeping changed but the phase did not.
    Recorded,
    Ignored,
    Anomaly(Anomaly),
}

impl Applied {
    pub fn advanced(&self) -> bool {
        matches!(self, Applied::Advanced { .. })
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRun {
    correlation_id: CorrelationId,
    phase: PipelinePhase,
    history: Vec<PipelinePhase>,
    started: BTreeSet<StageId>,
    stopped: BTreeSet<StageId>,
    completions: BTreeMap<StageId, EventStatus>,
    anomalies: Vec<Anomaly>,
}

impl PipelineRun {
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            phase: PipelinePhase::Scheduled,
            history: vec![PipelinePhase::Scheduled],
            started: BTreeSet::new(),
            stopped: BTreeSet::new(),
            completions: BTreeMap::new(),
            anomalies: Vec::new(),
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    /// Every phase the run has been in, in order.
    pub fn history(&self) -> &[PipelinePhase] {
        &self.history
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    pub fn completion(&self, stage: StageId) -> Option<EventStatus> {
        self.completions.get(&stage).copied()
    }

    pub fn was_started(&self, stage: StageId) -> bool {
        self.started.contains(&stage)
    }

    pub fn was_stopped(&self, stage: StageId) -> bool {
        self.stopped.contains(&stage)
    }

    /// Terminal, and every node started for this run has been stopped.
    pub fn is_settled(&self) -> bool {
        self.phase.is_terminal() && self.started.is_subset(&self.stopped)
    }

    pub fn apply(&mut self, observation: Observation) -> Applied {
        if observation.stage() == Some(StageId::Process)
            && !matches!(observation, Observation::NodeStopped(_))
            && self.completion(StageId::Collect) != Some(EventStatus::Done)
        {
            // The phase is untouched, but a node brought up out of order
            // still has to be stopped before the run can settle.
            if matches!(
                observation,
                Observation::ActivationIssued(_) | Observation::NodeRunning(_)
            ) {
                self.started.insert(StageId::Process);
            }
            let anomaly = Anomaly {
                correlation_id: self.correlation_id.clone(),
                observation,
                phase: self.phase,
            };
            self.anomalies.push(anomaly.clone());
            return Applied::Anomaly(anomaly);
        }

        match observation {
            Observation::Scheduled => Applied::Ignored,
            Observation::ActivationIssued(stage) => {
                let recorded = self.started.insert(stage);
                self.advance_or(PipelinePhase::Activating(stage), recorded)
            }
            Observation::NodeRunning(stage) => {
                let recorded = self.started.insert(stage);
                self.advance_or(PipelinePhase::Running(stage), recorded)
            }
            Observation::Completed(stage, status) => {
                // Too late: the stage was already timed out.
                if self.completions.contains_key(&stage)
                    || self.phase == PipelinePhase::TimedOut(stage)
                {
                    return Applied::Ignored;
                }
                self.completions.insert(stage, status);
                let target = match status {
                    EventStatus::Done => PipelinePhase::Done(stage),
                    EventStatus::Failed => PipelinePhase::Failed(stage),
                };
                let applied = self.advance_or(target, true);
                if stage == StageId::Process && self.stopped.contains(&StageId::Process) {
                    self.finish_if_done();
                }
                applied
            }
            Observation::NodeStopped(stage) => {
                if !self.stopped.insert(stage) {
                    return Applied::Ignored;
                }
                if stage == StageId::Process && self.finish_if_done() {
                    return Applied::Advanced {
                        from: PipelinePhase::Done(StageId::Process),
                        to: PipelinePhase::Idle,
                    };
                }
                Applied::Recorded
            }
            Observation::WatchdogExpired(stage) => {
                if self.completions.contains_key(&stage) {
                    return Applied::Ignored;
                }
                self.advance_or(PipelinePhase::TimedOut(stage), false)
            }
        }
    }

    fn advance_or(&mut self, target: PipelinePhase, recorded: bool) -> Applied {
        if self.phase.is_terminal() || target.rank() <= self.phase.rank() {
            return if recorded {
                Applied::Recorded
            } else {
                Applied::Ignored
            };
        }
        let from = self.phase;
        self.phase = target;
        self.history.push(target);
        Applied::Advanced { from, to: target }
    }

    fn finish_if_done(&mut self) -> bool {
        if self.phase == PipelinePhase::Done(StageId::Process) {
            self.phase = PipelinePhase::Idle;
            self.history.push(PipelinePhase::Idle);
            true
        } else {
            false
        }
    }
}

/// All runs seen so far, keyed by correlation id.
#[derive(Debug, Clone)]
pub struct Sequencer {
    topics: BTreeMap<String, StageId>,
    runs: BTreeMap<CorrelationId, PipelineRun>,
}

impl Sequencer {
    pub fn new(collect_topic: impl Into<String>, process_topic: impl Into<String>) -> Self {
        let mut topics = BTreeMap::new();
        topics.insert(collect_topic.into(), StageId::Collect);
        topics.insert(process_topic.into(), StageId::Process);
        Self {
            topics,
            runs: BTreeMap::new(),
        }
    }

    pub fn for_config(cfg: &ConfigFile) -> Self {
        Self::new(cfg.topic(StageId::Collect), cfg.topic(StageId::Process))
    }

    /// Rebuild runs from a bus history (e.g. [`InMemoryBus::history`]).
    ///
    /// [`InMemoryBus::history`]: crate::bus::InMemoryBus::history
    pub fn replay(&mut self, events: &[Event]) -> usize {
        events
            .iter()
            .filter(|e| !matches!(self.observe_event(e), Some(Applied::Ignored) | None))
            .count()
    }

    pub fn stage_of_topic(&self, topic: &str) -> Option<StageId> {
        self.topics.get(topic).copied()
    }

    /// Apply a completion event; `None` when its topic is not a stage topic.
    pub fn observe_event(&mut self, event: &Event) -> Option<Applied> {
        let stage = self.stage_of_topic(&event.topic)?;
        Some(self.observe(
            &event.correlation_id,
            Observation::Completed(stage, event.status),
        ))
    }

    pub fn observe(&mut self, correlation_id: &CorrelationId, observation: Observation) -> Applied {
        match self.runs.get_mut(correlation_id) {
            Some(run) => run.apply(observation),
            None => {
                let mut run = PipelineRun::new(correlation_id.clone());
                let applied = match observation {
                    Observation::Scheduled => Applied::Recorded,
                    other => run.apply(other),
                };
                self.runs.insert(correlation_id.clone(), run);
                applied
            }
        }
    }

    pub fn run(&self, correlation_id: &CorrelationId) -> Option<&PipelineRun> {
        self.runs.get(correlation_id)
    }

    pub fn runs(&self) -> impl Iterator<Item = &PipelineRun> {
        self.runs.values()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn all_settled(&self) -> bool {
        self.runs.values().all(PipelineRun::is_settled)
    }

    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.runs
            .values()
            .flat_map(|r| r.anomalies().iter().cloned())
            .collect()
    }
}
