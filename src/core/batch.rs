//! Batch aggregate: the per-run record the orchestrator mutates and the
//! status projector publishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::plan::ExecutionPlan;
use super::task::Task;

/// Batch identifier: `par-<YYYYMMDDHHMMSS UTC>-<8 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn generate() -> Self {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("par-{}-{}", stamp, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Branch namespace for this batch's workspaces.
    pub fn branch_prefix(&self) -> String {
        format!("parallel/{}/", self.0)
    }

    pub fn branch_for(&self, task_index: usize) -> String {
        format!("{}{}", self.branch_prefix(), task_index)
    }

    pub fn is_valid(value: &str) -> bool {
        let Some(rest) = value.strip_prefix("par-") else {
            return false;
        };
        let Some((stamp, suffix)) = rest.split_once('-') else {
            return false;
        };
        stamp.len() == 14
            && stamp.chars().all(|c| c.is_ascii_digit())
            && suffix.len() == 8
            && suffix.chars().all(|c| c.is_ascii_hexdigit())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::BatchNotFound(s.to_string()))
        }
    }
}

/// Lifecycle phase of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    #[default]
    Idle,
    PreconditionCheck,
    Planning,
    PlanReview,
    Replanning,
    Executing,
    Merging,
    Verifying,
    Finalizing,
    Complete,
    Failed,
    Cancelled,
}

impl BatchPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchPhase::Complete | BatchPhase::Failed | BatchPhase::Cancelled
        )
    }

    /// Valid moves through the lifecycle.
    ///
    /// An approved plan skips straight from the precondition check to
    /// executing; `failed` and `cancelled` are reachable from any
    /// non-terminal phase.
    pub fn can_transition(&self, target: BatchPhase) -> bool {
        use BatchPhase::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(target, Failed | Cancelled) {
            return true;
        }
        matches!(
            (*self, target),
            (Idle, PreconditionCheck)
                | (PreconditionCheck, Planning)
                | (PreconditionCheck, Executing)
                | (Planning, PlanReview)
                | (PlanReview, Replanning)
                | (PlanReview, PreconditionCheck)
                | (PlanReview, Executing)
                | (Replanning, PlanReview)
                | (Executing, Merging)
                | (Merging, Executing)
                | (Merging, Verifying)
                | (Merging, Finalizing)
                | (Verifying, Finalizing)
                | (Finalizing, Complete)
        )
    }
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchPhase::Idle => "idle",
            BatchPhase::PreconditionCheck => "precondition_check",
            BatchPhase::Planning => "planning",
            BatchPhase::PlanReview => "plan_review",
            BatchPhase::Replanning => "replanning",
            BatchPhase::Executing => "executing",
            BatchPhase::Merging => "merging",
            BatchPhase::Verifying => "verifying",
            BatchPhase::Finalizing => "finalizing",
            BatchPhase::Complete => "complete",
            BatchPhase::Failed => "failed",
            BatchPhase::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl SlotStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SlotStatus::Succeeded | SlotStatus::Failed | SlotStatus::Cancelled
        )
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotStatus::Pending => "pending",
            SlotStatus::Running => "running",
            SlotStatus::Succeeded => "succeeded",
            SlotStatus::Failed => "failed",
            SlotStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Status record for one task within one assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSlot {
    pub task_index: usize,
    pub task_text: String,
    pub status: SlotStatus,
    pub output_tail: Option<String>,
    pub error: Option<String>,
    pub cost_estimate: Option<f64>,
    pub phase_id: u32,
    /// Id of the assignment that owns this task.
    pub group_id: u32,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Clean,
    Conflict,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub branch_name: String,
    pub success: bool,
    pub conflict_files: Vec<String>,
    pub resolution_method: ResolutionMethod,
    pub message: String,
}

impl MergeResult {
    pub fn clean(branch_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            branch_name: branch_name.into(),
            success: true,
            conflict_files: Vec::new(),
            resolution_method: ResolutionMethod::Clean,
            message: message.into(),
        }
    }

    pub fn conflict(
        branch_name: impl Into<String>,
        conflict_files: Vec<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            branch_name: branch_name.into(),
            success: false,
            conflict_files,
            resolution_method: ResolutionMethod::Conflict,
            message: message.into(),
        }
    }

    pub fn failed(branch_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            branch_name: branch_name.into(),
            success: false,
            conflict_files: Vec::new(),
            resolution_method: ResolutionMethod::Failed,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: String,
    pub passed: bool,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub overall_pass: bool,
    #[serde(default)]
    pub criteria_results: Vec<CriterionResult>,
    #[serde(default)]
    pub summary: String,
}

impl VerificationResult {
    /// Stand-in when the verification dispatch itself errors.
    pub fn empty_failed(summary: impl Into<String>) -> Self {
        Self {
            overall_pass: false,
            criteria_results: Vec::new(),
            summary: summary.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase: BatchPhase,
    pub entered_at: DateTime<Utc>,
}

/// One run of the engine for one set of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub phase: BatchPhase,
    pub plan: ExecutionPlan,
    pub tasks: Vec<Task>,
    pub slots: Vec<TaskSlot>,
    pub merge_results: Vec<MergeResult>,
    pub verification: Option<VerificationResult>,
    pub current_phase_id: Option<u32>,
    pub current_phase_name: Option<String>,
    pub max_concurrency: usize,
    pub total_cost: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub finalize_message: Option<String>,
    pub phase_history: Vec<PhaseHistoryEntry>,
}

impl Batch {
    pub fn new(id: BatchId, plan: ExecutionPlan, tasks: Vec<Task>, max_concurrency: usize) -> Self {
        let slots = build_slots(&plan, &tasks);
        let now = Utc::now();
        Self {
            id,
            phase: BatchPhase::Idle,
            plan,
            tasks,
            slots,
            merge_results: Vec::new(),
            verification: None,
            current_phase_id: None,
            current_phase_name: None,
            max_concurrency,
            total_cost: 0.0,
            started_at: now,
            finished_at: None,
            error: None,
            finalize_message: None,
            phase_history: vec![PhaseHistoryEntry {
                phase: BatchPhase::Idle,
                entered_at: now,
            }],
        }
    }

    pub fn transition(&mut self, target: BatchPhase) -> Result<()> {
        if !self.phase.can_transition(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.phase.to_string(),
                to: target.to_string(),
            });
        }
        let now = Utc::now();
        self.phase = target;
        self.phase_history.push(PhaseHistoryEntry {
            phase: target,
            entered_at: now,
        });
        if target.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.error = Some(error.into());
        self.transition(BatchPhase::Failed)
    }

    pub fn slots_for_mut(
        &mut self,
        phase_id: u32,
        group_id: u32,
    ) -> impl Iterator<Item = &mut TaskSlot> {
        self.slots
            .iter_mut()
            .filter(move |s| s.phase_id == phase_id && s.group_id == group_id)
    }

    pub fn slots_for(&self, phase_id: u32, group_id: u32) -> impl Iterator<Item = &TaskSlot> {
        self.slots
            .iter()
            .filter(move |s| s.phase_id == phase_id && s.group_id == group_id)
    }

    pub fn group_has_slots(&self, phase_id: u32, group_id: u32) -> bool {
        self.slots_for(phase_id, group_id).next().is_some()
    }

    pub fn group_succeeded(&self, phase_id: u32, group_id: u32) -> bool {
        let mut slots = self.slots_for(phase_id, group_id).peekable();
        slots.peek().is_some() && slots.all(|s| s.status == SlotStatus::Succeeded)
    }

    pub fn set_group_status(&mut self, phase_id: u32, group_id: u32, status: SlotStatus) {
        let now = Utc::now();
        for slot in self.slots_for_mut(phase_id, group_id) {
            slot.status = status;
            match status {
                SlotStatus::Running => {
                    if slot.started_at.is_none() {
                        slot.started_at = Some(now);
                    }
                }
                s if s.is_finished() => slot.finished_at = Some(now),
                _ => {}
            }
        }
    }

    /// Flip every pending slot to cancelled. Returns how many changed.
    pub fn cancel_pending(&mut self) -> usize {
        let now = Utc::now();
        let mut count = 0;
        for slot in self
            .slots
            .iter_mut()
            .filter(|s| s.status == SlotStatus::Pending)
        {
            slot.status = SlotStatus::Cancelled;
            slot.finished_at = Some(now);
            count += 1;
        }
        count
    }

    /// Succeeded tasks with no recorded problem. A succeeded slot whose
    /// branch failed to merge carries an error and is excluded.
    pub fn succeeded_task_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|s| s.status == SlotStatus::Succeeded && s.error.is_none())
            .map(|s| s.task_index)
            .collect()
    }

    pub fn count_status(&self, status: SlotStatus) -> usize {
        self.slots.iter().filter(|s| s.status == status).count()
    }

    pub fn conflict_count(&self) -> usize {
        self.merge_results
            .iter()
            .filter(|m| m.resolution_method == ResolutionMethod::Conflict)
            .count()
    }
}

/// One slot per task per assignment. A task index claimed by more than one
/// assignment keeps only its first claim.
pub fn build_slots(plan: &ExecutionPlan, tasks: &[Task]) -> Vec<TaskSlot> {
    let mut claimed = HashSet::new();
    let mut slots = Vec::new();
    for phase in &plan.phases {
        for assignment in &phase.assignments {
            for &task_index in &assignment.task_indices {
                if !claimed.insert(task_index) {
                    continue;
                }
                slots.push(TaskSlot {
                    task_index,
                    task_text: tasks
                        .get(task_index)
                        .map(|t| t.text.clone())
                        .unwrap_or_default(),
                    status: SlotStatus::Pending,
                    output_tail: None,
                    error: None,
                    cost_estimate: None,
                    phase_id: phase.id,
                    group_id: assignment.id,
                    attempts: 0,
                    started_at: None,
                    finished_at: None,
                });
            }
        }
    }
    slots
}
