//! RunTracker - persists a pipeline run through a StorageAdapter
//!
//! `initiate_run` before the root starts, `finish_run` with the flattened
//! dump once it returns. With step persistence on, step starts/completions
//! are forwarded from the bus to a background writer in emission order.
//!
//! Persistence errors are logged and counted; they never change the outcome
//! the pipeline body returns.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Map;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument};

use crate::error::Result;
use crate::event::{EventBus, StepEvent, SubscriptionId};
use crate::projection::StepMeta;
use crate::step::{Pipeline, Step, StepTime};
use crate::storage::{RunMeta, StorageAdapter};

enum StepUpdate {
    Started(StepMeta),
    Finished(StepMeta),
}

impl StepUpdate {
    fn from_event(event: &StepEvent) -> Option<Self> {
        match event {
            StepEvent::StepStart {
                key,
                name,
                start_ts,
            } => Some(Self::Started(StepMeta {
                name: name.clone(),
                key: key.to_string(),
                time: StepTime {
                    start_ts: *start_ts,
                    end_ts: None,
                    duration_ms: None,
                },
                records: Map::new(),
                result: None,
                error: None,
            })),
            StepEvent::StepComplete {
                key,
                name,
                result,
                error,
                time,
                records,
            } => Some(Self::Finished(StepMeta {
                name: name.clone(),
                key: key.to_string(),
                time: *time,
                records: records.clone(),
                result: result.clone(),
                error: error.clone(),
            })),
            _ => None,
        }
    }
}

/// Background writer for step-level persistence
struct StepWriter {
    subscription: SubscriptionId,
    handle: JoinHandle<usize>,
}

impl StepWriter {
    fn spawn(adapter: Arc<dyn StorageAdapter>, bus: &EventBus, run_id: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<StepUpdate>();

        let subscription = bus.subscribe_all(move |event| {
            if let Some(update) = StepUpdate::from_event(event) {
                tx.send(update)
                    .map_err(|_| anyhow::anyhow!("step writer stopped"))?;
            }
            Ok(())
        });

        let handle = tokio::spawn(async move {
            let mut failures = 0;
            while let Some(update) = rx.recv().await {
                let (op, outcome) = match &update {
                    StepUpdate::Started(step) => {
                        ("initiate_step", adapter.initiate_step(&run_id, step).await)
                    }
                    StepUpdate::Finished(step) => {
                        ("finish_step", adapter.finish_step(&run_id, step).await)
                    }
                };
                if let Err(e) = outcome {
                    failures += 1;
                    error!(run_id = %run_id, op, error = %e, "step persistence failed");
                }
            }
            failures
        });

        Self {
            subscription,
            handle,
        }
    }

    /// Stop listening and wait for queued writes; returns the failure count
    async fn finish(self, bus: &EventBus) -> Result<usize> {
        // Dropping the listener drops the sender, which ends the writer loop
        bus.unsubscribe(self.subscription);
        Ok(self.handle.await?)
    }
}

/// Drives a StorageAdapter around pipeline runs
#[derive(Clone)]
pub struct RunTracker {
    adapter: Arc<dyn StorageAdapter>,
    step_persistence: bool,
    failures: Arc<AtomicUsize>,
}

impl RunTracker {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            adapter,
            step_persistence: false,
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Also persist every step start/completion while the run is in flight
    pub fn with_step_persistence(mut self, enabled: bool) -> Self {
        self.step_persistence = enabled;
        self
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    /// Persistence calls that failed so far
    pub fn persistence_failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// Run `pipeline` with `body` and persist it. Returns the body's outcome.
    #[instrument(skip(self, pipeline, body), fields(pipeline = %pipeline.name(), run_id = %pipeline.run_id()))]
    pub async fn track<F, Fut, T, E>(&self, pipeline: &Pipeline, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Step) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        T: Serialize,
        E: fmt::Display + fmt::Debug,
    {
        let start = RunMeta::starting(pipeline);
        self.check("initiate_run", self.adapter.initiate_run(&start).await);

        let writer = self.step_persistence.then(|| {
            StepWriter::spawn(
                Arc::clone(&self.adapter),
                pipeline.bus(),
                pipeline.run_id().to_string(),
            )
        });

        let outcome = pipeline.run(body).await;

        if let Some(writer) = writer {
            match writer.finish(pipeline.bus()).await {
                Ok(failed) => {
                    self.failures.fetch_add(failed, Ordering::SeqCst);
                }
                Err(e) => self.check("step_writer", Err(e)),
            }
        }

        match RunMeta::from_pipeline(pipeline) {
            Ok(run) => {
                let status = run.status();
                self.check("finish_run", self.adapter.finish_run(&run, status).await);
                debug!(status = %status, steps = run.steps.len(), "run persisted");
            }
            Err(e) => self.check("finish_run", Err(e)),
        }

        outcome
    }

    fn check(&self, op: &str, outcome: Result<()>) {
        if let Err(e) = outcome {
            self.failures.fetch_add(1, Ordering::SeqCst);
            error!(op, error = %e, "run persistence failed");
        }
    }
}

impl fmt::Debug for RunTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunTracker")
            .field("step_persistence", &self.step_persistence)
            .field("failures", &self.persistence_failures())
            .finish()
    }
}
