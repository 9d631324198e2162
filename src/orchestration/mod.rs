//! Orchestration layer: agent runners, the planning collaborator, the
//! per-assignment attempt loop and the batch state machine that ties them to
//! workspaces.

mod claude;
mod dispatch;
mod orchestrator;
mod planner;
mod runner;

pub use claude::{runner_from_config, ClaudeRunner, CommandRunner};
pub use dispatch::{AssignmentJob, AssignmentOutcome, AttemptLoop, DispatchEvent, MAX_ATTEMPTS};
pub use orchestrator::{assignment_prompt, ExecutionOrchestrator, OrchestratorSettings};
pub use planner::{
    gather_project_context, parse_verification, planning_prompt, verification_prompt,
    ClaudePlanner, PlanReply, PlanRequest, PlanningCollaborator, VerificationRequest,
};
pub use runner::{detect_quota_exhausted, AgentRunner, AttemptResult};
