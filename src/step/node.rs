//! Step - one tracked unit of work
//!
//! A `Step` is a cheap handle (Arc) to a node of the run's tree. Parents own
//! their children; a child only keeps a `Weak` back-reference to its parent,
//! so the tree is torn down as a unit when the root is dropped.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::engine;
use crate::event::{EventBus, StepEvent};

/// Wall-clock timing of a step (epoch milliseconds)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTime {
    pub start_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<i64>,
    /// `end_ts - start_ts`, set at completion
    #[serde(
        rename = "timeUsageMs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub duration_ms: Option<i64>,
}

impl StepTime {
    pub fn started_now() -> Self {
        Self {
            start_ts: now_ms(),
            end_ts: None,
            duration_ms: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_ts.is_some()
    }
}

/// Derived status: running until `end_ts` is set, then failed/completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn derive(time: &StepTime, error: Option<&str>) -> Self {
        if time.end_ts.is_none() {
            Self::Running
        } else if error.is_some() {
            Self::Failed
        } else {
            Self::Completed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!(
                "unknown status '{}' (expected running, completed or failed)",
                other
            )),
        }
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Dots would make the key path ambiguous
pub fn sanitize_name(name: &str) -> String {
    name.replace('.', "_")
}

pub(crate) struct StepNode {
    name: String,
    key: Arc<str>,
    parent: Weak<StepNode>,
    bus: EventBus,
    state: Mutex<StepState>,
}

#[derive(Default)]
struct StepState {
    time: StepTime,
    records: Map<String, Value>,
    result: Option<Value>,
    error: Option<String>,
    children: Vec<Step>,
}

/// Handle to a tracked step (cheap to clone)
#[derive(Clone)]
pub struct Step {
    node: Arc<StepNode>,
}

impl Step {
    /// Create a parentless step; the start timestamp is taken now
    pub(crate) fn root(name: &str, bus: EventBus) -> Self {
        Self::build(name, sanitize_name(name).into(), Weak::new(), bus)
    }

    fn build(name: &str, key: Arc<str>, parent: Weak<StepNode>, bus: EventBus) -> Self {
        Self {
            node: Arc::new(StepNode {
                name: name.to_string(),
                key,
                parent,
                bus,
                state: Mutex::new(StepState {
                    time: StepTime::started_now(),
                    ..StepState::default()
                }),
            }),
        }
    }

    /// Create a child and append it to this step's children.
    ///
    /// A key already used by a sibling is allowed but logged.
    pub(crate) fn child(&self, name: &str) -> Step {
        let key: Arc<str> = format!("{}.{}", self.node.key, sanitize_name(name)).into();
        let child = Self::build(
            name,
            Arc::clone(&key),
            Arc::downgrade(&self.node),
            self.node.bus.clone(),
        );

        let (duplicate, parent_finished) = {
            let mut state = self.node.state.lock();
            let duplicate = state.children.iter().any(|c| c.node.key == key);
            state.children.push(child.clone());
            (duplicate, state.time.is_finished())
        };

        if duplicate {
            warn!(
                key = %key,
                parent = %self.node.key,
                "duplicate step key under the same parent; lookups by key are ambiguous"
            );
        }
        if parent_finished {
            warn!(key = %key, "step opened after its parent completed");
        }
        child
    }

    /// Run `body` as a tracked child step of this one.
    ///
    /// The child's error is handed back unchanged once it has been recorded.
    pub async fn step<F, Fut, T, E>(&self, name: &str, body: F) -> Result<T, E>
    where
        F: FnOnce(Step) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize,
        E: fmt::Display + fmt::Debug,
    {
        let child = self.child(name);
        engine::run_step(child, body).await
    }

    /// Attach an annotation (overwrites the same key) and publish it immediately
    pub fn record(&self, key: impl Into<String>, value: impl Into<Value>) {
        let record_key = key.into();
        let value = value.into();
        {
            let mut state = self.node.state.lock();
            if state.time.is_finished() {
                drop(state);
                warn!(
                    key = %self.node.key,
                    record = %record_key,
                    "record ignored: step already finished"
                );
                return;
            }
            state.records.insert(record_key.clone(), value.clone());
        }
        self.emit(StepEvent::StepRecord {
            key: Arc::clone(&self.node.key),
            record_key,
            value,
        });
    }

    // ═══════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn key(&self) -> &str {
        &self.node.key
    }

    pub(crate) fn key_arc(&self) -> Arc<str> {
        Arc::clone(&self.node.key)
    }

    pub fn parent(&self) -> Option<Step> {
        self.node.parent.upgrade().map(|node| Step { node })
    }

    /// Children in the order they were opened
    pub fn children(&self) -> Vec<Step> {
        self.node.state.lock().children.clone()
    }

    pub fn time(&self) -> StepTime {
        self.node.state.lock().time
    }

    pub fn records(&self) -> Map<String, Value> {
        self.node.state.lock().records.clone()
    }

    pub fn result(&self) -> Option<Value> {
        self.node.state.lock().result.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.node.state.lock().error.clone()
    }

    pub fn status(&self) -> StepStatus {
        let state = self.node.state.lock();
        StepStatus::derive(&state.time, state.error.as_deref())
    }

    pub fn is_running(&self) -> bool {
        !self.node.state.lock().time.is_finished()
    }

    pub fn bus(&self) -> &EventBus {
        &self.node.bus
    }

    /// Consistent copy of the node's own fields (children excluded)
    pub(crate) fn snapshot(&self) -> StepSnapshot {
        let state = self.node.state.lock();
        StepSnapshot {
            name: self.node.name.clone(),
            key: self.node.key.to_string(),
            time: state.time,
            records: state.records.clone(),
            result: state.result.clone(),
            error: state.error.clone(),
        }
    }

    // ═══════════════════════════════════════════
    // Engine hooks
    // ═══════════════════════════════════════════

    pub(crate) fn emit(&self, event: StepEvent) {
        self.node.bus.publish(&event);
    }

    pub(crate) fn set_result(&self, value: Value) {
        let mut state = self.node.state.lock();
        debug_assert!(state.result.is_none() && state.error.is_none());
        state.result = Some(value);
    }

    pub(crate) fn set_error(&self, error: String) {
        let mut state = self.node.state.lock();
        debug_assert!(state.result.is_none() && state.error.is_none());
        state.error = Some(error);
    }

    /// Stamp the end time and return the `step-complete` event.
    ///
    /// `end_ts` never precedes `start_ts` nor the end of a finished child,
    /// even if the wall clock stepped backwards.
    pub(crate) fn finish(&self) -> StepEvent {
        let mut state = self.node.state.lock();
        let latest_child = state
            .children
            .iter()
            .filter_map(|c| c.node.state.lock().time.end_ts)
            .max();
        let end_ts = now_ms()
            .max(state.time.start_ts)
            .max(latest_child.unwrap_or(i64::MIN));
        state.time.end_ts = Some(end_ts);
        state.time.duration_ms = Some(end_ts - state.time.start_ts);

        StepEvent::StepComplete {
            key: Arc::clone(&self.node.key),
            name: self.node.name.clone(),
            result: state.result.clone(),
            error: state.error.clone(),
            time: state.time,
            records: state.records.clone(),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("key", &self.key())
            .field("status", &self.status())
            .field("children", &self.children().len())
            .finish()
    }
}

/// Owned copy of a node's fields, taken under a single lock
pub(crate) struct StepSnapshot {
    pub name: String,
    pub key: String,
    pub time: StepTime,
    pub records: Map<String, Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
}
