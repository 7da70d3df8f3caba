// src/bus/memory.rs

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;

use super::{Event, EventBus, EventPublisher, PublishFuture, Subscription};

/// Events kept in the publication history by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

#[derive(Debug)]
struct BusState {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Event>>>,
    history: VecDeque<Event>,
    history_limit: usize,
}

impl Default for BusState {
    fn default() -> Self {
        Self {
            subscribers: HashMap::new(),
            history: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// In-process pub/sub.
///
/// `redeliveries` makes every delivery arrive `1 + redeliveries` times, which
/// is how tests exercise at-least-once semantics. The most recent publications
/// are kept so pipeline runs can be reconstructed after the fact.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
    redeliveries: Arc<AtomicUsize>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_redeliveries(self, redeliveries: usize) -> Self {
        self.set_redeliveries(redeliveries);
        self
    }

    pub fn set_redeliveries(&self, redeliveries: usize) {
        self.redeliveries.store(redeliveries, Ordering::SeqCst);
    }

    /// Keep at most `limit` events in the history, dropping the oldest.
    pub fn with_history_limit(self, limit: usize) -> Self {
        {
            let mut state = self.lock();
            state.history_limit = limit.max(1);
            let limit = state.history_limit;
            trim_front(&mut state.history, limit);
        }
        self
    }

    /// The retained publications, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .subscribers
            .get(topic)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Deliver synchronously; returns the number of deliveries made.
    pub fn publish_now(&self, event: Event) -> usize {
        let copies = 1 + self.redeliveries.load(Ordering::SeqCst);
        let mut state = self.lock();
        let limit = state.history_limit;
        state.history.push_back(event.clone());
        trim_front(&mut state.history, limit);

        let mut delivered = 0;
        if let Some(subs) = state.subscribers.get_mut(&event.topic) {
            subs.retain(|tx| !tx.is_closed());
            for tx in subs.iter() {
                for _ in 0..copies {
                    if tx.send(event.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }

        debug!(
            topic = %event.topic,
            status = %event.status,
            correlation_id = %event.correlation_id,
            delivered,
            "published event"
        );
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn trim_front(history: &mut VecDeque<Event>, limit: usize) {
    while history.len() > limit {
        history.pop_front();
    }
}

impl EventPublisher for InMemoryBus {
    fn publish(&self, event: Event) -> PublishFuture<'_> {
        self.publish_now(event);
        Box::pin(async { Ok(()) })
    }
}

impl EventBus for InMemoryBus {
    fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        debug!(topic, "new subscription");
        Subscription::new(topic, rx)
    }
}
