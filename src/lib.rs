//! Pipetrace - step tracking for nested async pipelines
//!
//! A pipeline body receives a root [`Step`] and opens nested steps with
//! [`Step::step`]. Every step records timing, arbitrary records and its
//! outcome, and announces its lifecycle on an [`EventBus`]. Finished trees
//! project to a hierarchy or a flat pre-order list and can be persisted
//! through a [`StorageAdapter`].

// ═══════════════════════════════════════════════════════════════
// Layer 0: Errors + config
// ═══════════════════════════════════════════════════════════════
pub mod config;
pub mod error;

// ═══════════════════════════════════════════════════════════════
// Layer 1: Events
// ═══════════════════════════════════════════════════════════════
pub mod event;

// ═══════════════════════════════════════════════════════════════
// Layer 2: Step tree + execution
// ═══════════════════════════════════════════════════════════════
pub mod engine;
pub mod projection;
pub mod step;

// ═══════════════════════════════════════════════════════════════
// Layer 3: Persistence
// ═══════════════════════════════════════════════════════════════
pub mod storage;
pub mod tracker;

pub use config::PipetraceConfig;
pub use error::{FixSuggestion, PipetraceError, Result};
pub use event::{Event, EventBus, EventKind, EventLog, StepEvent, SubscriptionId};
pub use projection::{edges, spans, to_flattened, to_hierarchy, Edge, Span, StepHierarchy, StepMeta};
pub use step::{now_ms, sanitize_name, Pipeline, Step, StepStatus, StepTime};
pub use storage::{
    FsAdapter, KeyedSerializer, RunData, RunFilter, RunMeta, RunRecord, RunStatus, Settings,
    StorageAdapter, TimeRange, TimeseriesPoint, TimeseriesSummary,
};
pub use tracker::RunTracker;
