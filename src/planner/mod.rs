//! Planning and apply.
//!
//! This module compares the declared graph with last-applied state, orders
//! the resulting changes into an execution plan, and applies that plan.

mod diff;
mod executor;
mod plan;

pub use diff::{Action, Change, ChangeSet, DiffEngine, FieldChange, ReplaceOrder};
pub use executor::{
    ApplyExecutor, ApplyResult, CancelToken, PendingDeposed, ResourceOutcome, StepReport,
};
pub use plan::{ExecutionPlan, PlanStep, Scheduler, StepOp};
