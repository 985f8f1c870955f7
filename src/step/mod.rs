//! Step tree - tracked units of work and the pipeline that roots them

mod node;
mod pipeline;

pub use node::{now_ms, sanitize_name, Step, StepStatus, StepTime};
pub use pipeline::Pipeline;
