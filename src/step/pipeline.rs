//! Pipeline - the root of a tracked run
//!
//! Owns the run id and the `EventBus` shared by every step of its tree.
//! Subscribe on `bus()` before calling `run` to see the root's own events.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use super::node::{Step, StepStatus};
use crate::engine;
use crate::event::EventBus;
use crate::projection::{self, StepHierarchy, StepMeta};

pub struct Pipeline {
    name: String,
    run_id: Arc<str>,
    bus: EventBus,
    root: Mutex<Option<Step>>,
}

impl Pipeline {
    /// New pipeline with a generated run id (UUID v4)
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_run_id(name, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_run_id(name: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run_id: run_id.into().into(),
            bus: EventBus::new(),
            root: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Run `body` as the root step.
    ///
    /// A pipeline tracks one run; running it again replaces the previous tree.
    pub async fn run<F, Fut, T, E>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(Step) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize,
        E: fmt::Display + fmt::Debug,
    {
        let root = Step::root(&self.name, self.bus.clone());
        if self.root.lock().replace(root.clone()).is_some() {
            warn!(
                pipeline = %self.name,
                run_id = %self.run_id,
                "pipeline ran again; previous step tree replaced"
            );
        }

        info!(pipeline = %self.name, run_id = %self.run_id, "pipeline started");
        let outcome = engine::run_step(root.clone(), body).await;
        info!(
            pipeline = %self.name,
            run_id = %self.run_id,
            status = %root.status(),
            duration_ms = root.time().duration_ms.unwrap_or_default(),
            "pipeline finished"
        );
        outcome
    }

    /// Root step, once `run` has been called
    pub fn root(&self) -> Option<Step> {
        self.root.lock().clone()
    }

    pub fn status(&self) -> Option<StepStatus> {
        self.root().map(|r| r.status())
    }

    pub fn to_hierarchy(&self) -> Option<StepHierarchy> {
        self.root().map(|r| projection::to_hierarchy(&r))
    }

    pub fn to_flattened(&self) -> Option<Vec<StepMeta>> {
        self.root().map(|r| projection::to_flattened(&r))
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("run_id", &self.run_id)
            .field("status", &self.status())
            .finish()
    }
}
