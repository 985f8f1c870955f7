//! EventLog - append-only record of a run's step events
//!
//! Attach one to a bus to keep the full lifecycle trail:
//! - Event: envelope with sequence id + relative timestamp + step event
//! - EventLog: thread-safe, append-only, cheap to clone (shared storage)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::bus::{EventBus, EventKind, StepEvent, SubscriptionId};

/// Single entry in the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since the log was created (ms)
    pub timestamp_ms: u64,
    pub event: StepEvent,
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a log and subscribe it to every event kind on `bus`
    pub fn attach(bus: &EventBus) -> (Self, SubscriptionId) {
        let log = Self::new();
        let sink = log.clone();
        let id = bus.subscribe_all(move |event| {
            sink.push(event.clone());
            Ok(())
        });
        (log, id)
    }

    /// Append an event (returns its sequence ID)
    pub fn push(&self, event: StepEvent) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            event,
        };
        self.events.write().push(entry);
        id
    }

    /// Get all events (cloned)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Events emitted by one step, in order
    pub fn filter_step(&self, key: &str) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event.key() == key)
            .cloned()
            .collect()
    }

    /// Kinds emitted by one step, in order
    pub fn kinds_for(&self, key: &str) -> Vec<EventKind> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event.key() == key)
            .map(|e| e.event.kind())
            .collect()
    }

    /// Serialize to JSON for persistence/debugging
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.events()).unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .finish()
    }
}
