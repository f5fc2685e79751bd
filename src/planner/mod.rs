//! Planning and execution of runs.
//!
//! This module handles the comparison between declared resources and the
//! persisted state, builds the operation plan and executes it.

mod diff;
mod executor;
mod plan;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use executor::{ExecutedOperation, ExecutionResult, PlanExecutor, ResourceOutcome};
pub use plan::{OperationType, Plan, PlanSummary, PlannedOperation};
