// Transcode policy engine - independent of the CLI

pub mod core;
pub mod hardware;
pub mod plan;
pub mod probe;
pub mod progress;
pub mod tools;
pub mod validate;

pub use core::*;
pub use plan::{ExecutionFailure, ExecutionPlan, JobPlan, PlanError, RetrySuggestion, TranscodeEngine, assess_failure};
