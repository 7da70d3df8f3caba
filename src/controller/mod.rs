// src/controller/mod.rs

//! Reactive controllers.
//!
//! Each controller reacts to exactly one kind of trigger and issues at most
//! one lifecycle action per correlation id. [`Controller::decide`] is a pure
//! function of the trigger, the target node's current state, and the ids the
//! controller has already handled, so duplicate deliveries are harmless.

pub mod task;

use std::collections::{HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

use crate::bus::Event;
use crate::config::ConfigFile;
use crate::node::{ActionKind, LifecycleAction};
use crate::types::{CorrelationId, EventStatus, NodeState, StageId};

pub use task::{TriggerSource, spawn_controller};

/// A scheduled activation of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleTick {
    pub correlation_id: CorrelationId,
    pub fired_at: DateTime<Utc>,
}

impl ScheduleTick {
    /// A tick for a fresh run, fired now.
    pub fn now() -> Self {
        Self {
            correlation_id: CorrelationId::generate(),
            fired_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Tick(ScheduleTick),
    Event(Event),
}

impl Trigger {
    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            Trigger::Tick(t) => &t.correlation_id,
            Trigger::Event(e) => &e.correlation_id,
        }
    }

    /// Date of the run this trigger belongs to. A tick dates the run in
    /// `offset`; a completion carries the date its stage worked on.
    pub fn run_date(&self, offset: FixedOffset) -> Option<NaiveDate> {
        match self {
            Trigger::Tick(t) => Some(t.fired_at.with_timezone(&offset).date_naive()),
            Trigger::Event(e) => e.run_date(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControllerKind {
    ActivateCollect,
    DeactivateCollect,
    ActivateProcess,
    DeactivateProcess,
}

impl ControllerKind {
    pub const ALL: [ControllerKind; 4] = [
        ControllerKind::ActivateCollect,
        ControllerKind::DeactivateCollect,
        ControllerKind::ActivateProcess,
        ControllerKind::DeactivateProcess,
    ];

    /// Stage whose node this controller acts on.
    pub fn target(&self) -> StageId {
        match self {
            ControllerKind::ActivateCollect | ControllerKind::DeactivateCollect => StageId::Collect,
            ControllerKind::ActivateProcess | ControllerKind::DeactivateProcess => StageId::Process,
        }
    }

    pub fn action(&self) -> ActionKind {
        match self {
            ControllerKind::ActivateCollect | ControllerKind::ActivateProcess => ActionKind::Start,
            ControllerKind::DeactivateCollect | ControllerKind::DeactivateProcess => ActionKind::Stop,
        }
    }

    /// Stage whose completion topic triggers this controller; `None` for the
    /// schedule-driven one.
    pub fn listens_to(&self) -> Option<StageId> {
        match self {
            ControllerKind::ActivateCollect => None,
            ControllerKind::DeactivateCollect | ControllerKind::ActivateProcess => {
                Some(StageId::Collect)
            }
            ControllerKind::DeactivateProcess => Some(StageId::Process),
        }
    }

    /// Completion statuses that trigger the action.
    pub fn accepts(&self, status: EventStatus) -> bool {
        match self {
            ControllerKind::ActivateProcess => status == EventStatus::Done,
            _ => true,
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerKind::ActivateCollect => "activate-collect",
            ControllerKind::DeactivateCollect => "deactivate-collect",
            ControllerKind::ActivateProcess => "activate-process",
            ControllerKind::DeactivateProcess => "deactivate-process",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Wrong trigger kind, topic or status for this controller.
    NotMyTrigger,
    /// This correlation id was already handled.
    Duplicate,
    /// The node is already in the state the action would produce.
    AlreadyInState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Act(LifecycleAction),
    Ignore(IgnoreReason),
}

/// Number of most recent handled ids a controller remembers.
pub const HANDLED_CAPACITY: usize = 1024;

/// Insertion-ordered set that forgets its oldest ids past `capacity`.
#[derive(Debug, Clone)]
struct HandledIds {
    ids: HashSet<CorrelationId>,
    order: VecDeque<CorrelationId>,
    capacity: usize,
}

impl HandledIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, cid: &CorrelationId) -> bool {
        self.ids.contains(cid)
    }

    fn insert(&mut self, cid: &CorrelationId) {
        if !self.ids.insert(cid.clone()) {
            return;
        }
        self.order.push_back(cid.clone());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Controller {
    kind: ControllerKind,
    node: String,
    topic: Option<String>,
    utc_offset: FixedOffset,
    handled: HandledIds,
}

impl Controller {
    pub fn new(kind: ControllerKind, cfg: &ConfigFile) -> Self {
        Self {
            kind,
            node: cfg.node_of(kind.target()).to_string(),
            topic: kind.listens_to().map(|s| cfg.topic(s).to_string()),
            utc_offset: cfg.pipeline.utc_offset,
            handled: HandledIds::new(HANDLED_CAPACITY),
        }
    }

    /// The four controllers of the two-stage pipeline.
    pub fn pipeline(cfg: &ConfigFile) -> Vec<Controller> {
        ControllerKind::ALL
            .into_iter()
            .map(|kind| Controller::new(kind, cfg))
            .collect()
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Topic subscribed to, or `None` for the schedule-driven controller.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn decide(&mut self, trigger: &Trigger, node_state: NodeState) -> Decision {
        let cid = trigger.correlation_id();
        if !self.matches(trigger) {
            // A rejected status on our own topic still closes the run: once
            // collect has failed, a late `done` must not start process.
            if self.on_my_topic(trigger) {
                self.handled.insert(cid);
            }
            return Decision::Ignore(IgnoreReason::NotMyTrigger);
        }

        if self.handled.contains(cid) {
            return Decision::Ignore(IgnoreReason::Duplicate);
        }
        self.handled.insert(cid);

        let already = match self.kind.action() {
            ActionKind::Start => node_state.is_up(),
            ActionKind::Stop => node_state.is_down(),
        };
        if already {
            return Decision::Ignore(IgnoreReason::AlreadyInState);
        }

        let stage = self.kind.target();
        let action = match self.kind.action() {
            ActionKind::Start => LifecycleAction::start(&self.node, stage, cid.clone())
                .with_run_date(trigger.run_date(self.utc_offset)),
            ActionKind::Stop => LifecycleAction::stop(&self.node, stage, cid.clone()),
        };
        Decision::Act(action)
    }

    fn on_my_topic(&self, trigger: &Trigger) -> bool {
        match (trigger, self.topic.as_deref()) {
            (Trigger::Event(e), Some(topic)) => e.topic == topic,
            _ => false,
        }
    }

    fn matches(&self, trigger: &Trigger) -> bool {
        match (trigger, self.topic.as_deref()) {
            (Trigger::Tick(_), None) => true,
            (Trigger::Event(e), Some(topic)) => e.topic == topic && self.kind.accepts(e.status),
            _ => false,
        }
    }
}
