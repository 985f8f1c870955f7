//! Event module - step lifecycle notifications
//!
//! - `bus`: per-run pub/sub dispatcher shared by the whole step tree
//! - `log`: append-only recorder that can be attached to a bus

mod bus;
mod log;

pub use bus::{EventBus, EventKind, StepEvent, SubscriptionId};
pub use log::{Event, EventLog};
