// Execution engine and playbook runner

#[allow(clippy::module_inception)]
mod engine;
mod runner;

pub use engine::{Engine, ExecutionMode, ExecutionOptions, ImportedBatch};
pub use runner::{PlaybookRunner, RunRecap, TaskSummary};
