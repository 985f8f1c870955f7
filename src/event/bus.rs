//! EventBus - per-run pub/sub for step lifecycle events
//!
//! One bus is created by the `Pipeline` and shared by reference (Arc) with
//! every step of its tree. Delivery is synchronous, in registration order.
//! A listener that returns an error or panics is logged and skipped; the
//! step and the remaining listeners are not affected.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::step::StepTime;

/// The five lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    StepStart,
    StepRecord,
    StepSuccess,
    StepError,
    StepComplete,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        Self::StepStart,
        Self::StepRecord,
        Self::StepSuccess,
        Self::StepError,
        Self::StepComplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepStart => "step-start",
            Self::StepRecord => "step-record",
            Self::StepSuccess => "step-success",
            Self::StepError => "step-error",
            Self::StepComplete => "step-complete",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle notification emitted by a step
///
/// Uses Arc<str> for keys so the same allocation is shared with the node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepEvent {
    #[serde(rename_all = "camelCase")]
    StepStart {
        key: Arc<str>,
        name: String,
        start_ts: i64,
    },
    #[serde(rename_all = "camelCase")]
    StepRecord {
        key: Arc<str>,
        record_key: String,
        value: Value,
    },
    StepSuccess {
        key: Arc<str>,
        result: Value,
    },
    StepError {
        key: Arc<str>,
        error: String,
    },
    StepComplete {
        key: Arc<str>,
        name: String,
        result: Option<Value>,
        error: Option<String>,
        time: StepTime,
        records: Map<String, Value>,
    },
}

impl StepEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StepStart { .. } => EventKind::StepStart,
            Self::StepRecord { .. } => EventKind::StepRecord,
            Self::StepSuccess { .. } => EventKind::StepSuccess,
            Self::StepError { .. } => EventKind::StepError,
            Self::StepComplete { .. } => EventKind::StepComplete,
        }
    }

    /// Key of the emitting step
    pub fn key(&self) -> &str {
        match self {
            Self::StepStart { key, .. }
            | Self::StepRecord { key, .. }
            | Self::StepSuccess { key, .. }
            | Self::StepError { key, .. }
            | Self::StepComplete { key, .. } => key,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&StepEvent) -> anyhow::Result<()> + Send + Sync>;

struct Listener {
    id: SubscriptionId,
    /// None = every kind
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    listeners: RwLock<Vec<Listener>>,
    next_id: AtomicU64,
}

/// Shared, synchronous event dispatcher (cheap to clone)
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event kind
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&StepEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(Some(kind), Arc::new(handler))
    }

    /// Register a listener for every event kind
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&StepEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    fn add(&self, kind: Option<EventKind>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner.listeners.write().push(Listener { id, kind, handler });
        id
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Deliver an event to every matching listener, in registration order.
    ///
    /// Returns the number of listeners that handled it without failing.
    pub fn publish(&self, event: &StepEvent) -> usize {
        let kind = event.kind();

        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<Handler> = self
            .inner
            .listeners
            .read()
            .iter()
            .filter(|l| l.kind.map_or(true, |k| k == kind))
            .map(|l| Arc::clone(&l.handler))
            .collect();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(kind = %kind, key = event.key(), error = %e, "event listener failed");
                }
                Err(panic) => {
                    warn!(
                        kind = %kind,
                        key = event.key(),
                        panic = panic_message(&*panic),
                        "event listener panicked"
                    );
                }
            }
        }
        delivered
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// True when both handles point at the same bus
    pub fn same_bus(&self, other: &EventBus) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn start(key: &str) -> StepEvent {
        StepEvent::StepStart {
            key: key.into(),
            name: key.into(),
            start_ts: 0,
        }
    }

    fn record(key: &str) -> StepEvent {
        StepEvent::StepRecord {
            key: key.into(),
            record_key: "foo".into(),
            value: json!("bar"),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // EventKind / StepEvent
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn event_kind_names_are_kebab_case() {
        let names: Vec<_> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            names,
            [
                "step-start",
                "step-record",
                "step-success",
                "step-error",
                "step-complete"
            ]
        );
    }

    #[test]
    fn step_event_serializes_with_type_tag() {
        let json = serde_json::to_value(record("main.demo")).unwrap();
        assert_eq!(json["type"], "step-record");
        assert_eq!(json["key"], "main.demo");
        assert_eq!(json["recordKey"], "foo");
        assert_eq!(json["value"], "bar");
    }

    // ═══════════════════════════════════════════════════════════════
    // Dispatch
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn delivers_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = Arc::clone(&seen);
            bus.subscribe_all(move |_| {
                seen.lock().push(i);
                Ok(())
            });
        }

        assert_eq!(bus.publish(&start("a")), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn kind_filter_only_matches_that_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe(EventKind::StepRecord, move |e| {
            assert_eq!(e.kind(), EventKind::StepRecord);
            *h.lock() += 1;
            Ok(())
        });

        bus.publish(&start("a"));
        bus.publish(&record("a"));
        bus.publish(&record("a"));
        assert_eq!(*hits.lock(), 2);
    }

    #[test]
    fn failing_listener_does_not_stop_others() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe_all(|_| anyhow::bail!("listener broke"));
        bus.subscribe_all(|_| panic!("listener exploded"));
        let s = Arc::clone(&seen);
        bus.subscribe_all(move |e| {
            s.lock().push(e.key().to_string());
            Ok(())
        });

        let delivered = bus.publish(&start("main"));
        assert_eq!(delivered, 1);
        assert_eq!(*seen.lock(), vec!["main".to_string()]);
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let bus = EventBus::new();
        let id = bus.subscribe_all(|_| Ok(()));
        assert_eq!(bus.listener_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(&start("a")), 0);
    }

    #[test]
    fn listener_may_subscribe_during_dispatch() {
        let bus = EventBus::new();
        let inner = bus.clone();
        bus.subscribe(EventKind::StepStart, move |_| {
            inner.subscribe_all(|_| Ok(()));
            Ok(())
        });

        bus.publish(&start("a"));
        assert_eq!(bus.listener_count(), 2);
    }

    #[test]
    fn clones_share_listeners() {
        let bus = EventBus::new();
        let cloned = bus.clone();
        cloned.subscribe_all(|_| Ok(()));
        assert_eq!(bus.listener_count(), 1);
        assert!(bus.same_bus(&cloned));
        assert!(!bus.same_bus(&EventBus::new()));
    }
}
