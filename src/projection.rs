//! Output projections of a step tree
//!
//! - `to_hierarchy`: nested view, children in creation order
//! - `to_flattened`: pre-order list, self before descendants
//! - `spans` / `edges`: inputs for chart generators
//!
//! All projections are read-only and may be taken while steps are running.
//! The flattened order is the wire format consumed by storage adapters.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::step::{Step, StepStatus, StepTime};

/// One step as persisted and shown in the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMeta {
    pub name: String,
    pub key: String,
    pub time: StepTime,
    #[serde(default)]
    pub records: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepMeta {
    pub fn of(step: &Step) -> Self {
        let snap = step.snapshot();
        Self {
            name: snap.name,
            key: snap.key,
            time: snap.time,
            records: snap.records,
            result: snap.result,
            error: snap.error,
        }
    }

    pub fn status(&self) -> StepStatus {
        StepStatus::derive(&self.time, self.error.as_deref())
    }
}

/// Nested view: a `StepMeta` plus its children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepHierarchy {
    #[serde(flatten)]
    pub meta: StepMeta,
    pub children: Vec<StepHierarchy>,
}

impl StepHierarchy {
    /// Number of nodes in this subtree (self included)
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.node_count()).sum::<usize>()
    }
}

pub fn to_hierarchy(step: &Step) -> StepHierarchy {
    StepHierarchy {
        meta: StepMeta::of(step),
        children: step.children().iter().map(to_hierarchy).collect(),
    }
}

pub fn to_flattened(step: &Step) -> Vec<StepMeta> {
    let mut out = Vec::new();
    flatten_into(step, &mut out);
    out
}

fn flatten_into(step: &Step, out: &mut Vec<StepMeta>) {
    out.push(StepMeta::of(step));
    for child in step.children() {
        flatten_into(&child, out);
    }
}

/// Time span of a finished step (chart input)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub key: String,
    pub start_ts: i64,
    pub end_ts: i64,
}

/// Parent → child edge of the execution graph (chart input)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// Spans of finished steps, pre-order. Running steps are skipped.
pub fn spans(step: &Step) -> Vec<Span> {
    to_flattened(step)
        .into_iter()
        .filter_map(|meta| {
            meta.time.end_ts.map(|end_ts| Span {
                key: meta.key,
                start_ts: meta.time.start_ts,
                end_ts,
            })
        })
        .collect()
}

/// Parent → child edges, pre-order
pub fn edges(step: &Step) -> Vec<Edge> {
    let mut out = Vec::new();
    collect_edges(step, &mut out);
    out
}

fn collect_edges(step: &Step, out: &mut Vec<Edge>) {
    for child in step.children() {
        out.push(Edge {
            from: step.key().to_string(),
            to: child.key().to_string(),
        });
        collect_edges(&child, out);
    }
}
