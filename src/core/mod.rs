//! Core domain models for the execution engine.
//!
//! Tasks are the caller's input, the execution plan is the approved grouping
//! of those tasks into phases and assignments, and the batch is the mutable
//! record of one run of that plan.

pub mod batch;
pub mod plan;
pub mod task;

pub use batch::{
    Batch, BatchId, BatchPhase, CriterionResult, MergeResult, ResolutionMethod, SlotStatus,
    TaskSlot, VerificationResult,
};
pub use plan::{AgentAssignment, ExecutionPlan, Phase};
pub use task::Task;
