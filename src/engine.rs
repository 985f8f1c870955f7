//! Execution engine - drives a step's body and its lifecycle events
//!
//! For every step the bus sees, in this order:
//! `step-start`, any number of `step-record`, `step-success` or `step-error`,
//! then `step-complete`. Failures are recorded and handed back unchanged.
//! A panicking body is recorded as a failure and the panic is resumed.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::event::StepEvent;
use crate::step::Step;

/// Run `body` as the work of `step`.
///
/// `step` must be freshly created (its start timestamp is already taken).
pub async fn run_step<F, Fut, T, E>(step: Step, body: F) -> Result<T, E>
where
    F: FnOnce(Step) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: Serialize,
    E: fmt::Display + fmt::Debug,
{
    step.emit(StepEvent::StepStart {
        key: step.key_arc(),
        name: step.name().to_string(),
        start_ts: step.time().start_ts,
    });
    debug!(key = step.key(), "step started");

    // Calling `body` may panic before any future exists
    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| body(step.clone()))) {
        Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
        Err(panic) => Err(panic),
    };

    match &outcome {
        Ok(Ok(value)) => {
            let result = serde_json::to_value(value).unwrap_or_else(|e| {
                warn!(key = step.key(), error = %e, "step result is not serializable");
                Value::Null
            });
            step.set_result(result.clone());
            step.emit(StepEvent::StepSuccess {
                key: step.key_arc(),
                result,
            });
        }
        Ok(Err(err)) => {
            let error = describe_failure(err);
            step.set_error(error.clone());
            step.emit(StepEvent::StepError {
                key: step.key_arc(),
                error,
            });
        }
        Err(panic) => {
            let error = format!("panic: {}", panic_text(&**panic));
            step.set_error(error.clone());
            step.emit(StepEvent::StepError {
                key: step.key_arc(),
                error,
            });
        }
    }

    let complete = step.finish();
    step.emit(complete);
    debug!(
        key = step.key(),
        status = %step.status(),
        duration_ms = step.time().duration_ms.unwrap_or_default(),
        "step finished"
    );

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Normalize a failure to a string: its message, else its debug form,
/// else the name of its type.
pub fn describe_failure<E>(err: &E) -> String
where
    E: fmt::Display + fmt::Debug + ?Sized,
{
    let message = err.to_string();
    if !message.trim().is_empty() {
        return message;
    }
    let debug = format!("{:?}", err);
    if !debug.trim().is_empty() && debug != "\"\"" {
        return debug;
    }
    short_type_name::<E>().to_string()
}

fn short_type_name<E: ?Sized>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic>".to_string()
    }
}
