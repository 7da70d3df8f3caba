// src/bus/mod.rs

//! Event bus carrying completion notifications between stages.
//!
//! Delivery is at-least-once, only to subscribers present at publish time,
//! and unordered across topics. Every consumer must therefore tolerate
//! duplicates and must not assume it saw anything published before it
//! subscribed.
//!
//! - [`memory`] is the in-process bus used by the orchestrator and tests.
//! - [`command`] connects to an external bus through shell commands.

pub mod command;
pub mod memory;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::types::{CorrelationId, EventStatus};

pub use command::{CommandPublisher, spawn_event_source};
pub use memory::InMemoryBus;

/// Metadata key holding the failure reason on `failed` events.
pub const META_REASON: &str = "reason";

/// Metadata key holding the run date (`YYYY-MM-DD`) a stage worked on.
pub const META_RUN_DATE: &str = "run_date";

/// Immutable completion notification.
///
/// Wire form:
/// `{"topic":"collect-done","status":"done","timestamp":"...","correlationId":"...","metadata":{...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub topic: String,
    pub status: EventStatus,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Event {
    pub fn new(topic: impl Into<String>, status: EventStatus, correlation_id: CorrelationId) -> Self {
        Self {
            topic: topic.into(),
            status,
            timestamp: Utc::now(),
            correlation_id,
            metadata: BTreeMap::new(),
        }
    }

    pub fn done(topic: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self::new(topic, EventStatus::Done, correlation_id)
    }

    pub fn failed(
        topic: impl Into<String>,
        correlation_id: CorrelationId,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(topic, EventStatus::Failed, correlation_id).with_metadata(META_REASON, reason)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_done(&self) -> bool {
        self.status == EventStatus::Done
    }

    pub fn reason(&self) -> Option<&str> {
        self.metadata.get(META_REASON).map(String::as_str)
    }

    /// Run date stamped by the publishing stage; `None` when absent or
    /// malformed.
    pub fn run_date(&self) -> Option<NaiveDate> {
        self.metadata
            .get(META_RUN_DATE)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Fire-and-forget publication.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: Event) -> PublishFuture<'_>;
}

/// A publisher that can also hand out subscriptions.
pub trait EventBus: EventPublisher {
    /// Receive events published to `topic` from now on.
    fn subscribe(&self, topic: &str) -> Subscription;
}

/// Receiving end of one topic subscription.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    pub(crate) fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<Event>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next delivery; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next delivery if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
