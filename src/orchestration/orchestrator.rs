//! Batch state machine.
//!
//! One `execute` call owns one `Batch` from the precondition check to a
//! terminal phase. Phases run in plan order; each phase dispatches its
//! assignments (bounded fan-out for parallel phases, one shared workspace for
//! sequential ones), then removes and merges workspaces one at a time in
//! assignment order. The trunk is only touched from this control flow.

use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{
    AgentAssignment, Batch, BatchPhase, MergeResult, Phase, ResolutionMethod, SlotStatus, Task,
    VerificationResult,
};
use crate::error::{Error, Result};
use crate::registry::Lease;
use crate::status::StatusProjector;
use crate::tracking;
use crate::util::blocking;
use crate::workspace::{WorkspaceHandle, WorkspaceManager};
use crate::{flog, flog_error, flog_warn};

use super::dispatch::{AssignmentJob, AssignmentOutcome, AttemptLoop, DispatchEvent};
use super::planner::{PlanningCollaborator, VerificationRequest};
use super::runner::AgentRunner;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub tail_lines: usize,
    /// Tracking document path relative to the project root.
    pub tracking_document: String,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tail_lines: config.output_tail_lines(),
            tracking_document: config.tracking_document().to_string(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A workspace produced by one phase, waiting to be merged.
struct WorkspaceRun {
    handle: WorkspaceHandle,
    merge: bool,
    phase_id: u32,
    groups: Vec<u32>,
}

pub struct ExecutionOrchestrator {
    workspaces: WorkspaceManager,
    runner: Arc<dyn AgentRunner>,
    collaborator: Arc<dyn PlanningCollaborator>,
    projector: StatusProjector,
    settings: OrchestratorSettings,
}

impl ExecutionOrchestrator {
    pub fn new(
        workspaces: WorkspaceManager,
        runner: Arc<dyn AgentRunner>,
        collaborator: Arc<dyn PlanningCollaborator>,
        projector: StatusProjector,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            workspaces,
            runner,
            collaborator,
            projector,
            settings,
        }
    }

    pub fn projector(&self) -> &StatusProjector {
        &self.projector
    }

    /// Run `batch` to a terminal phase. Batch workspaces are swept and the
    /// lease released before the terminal snapshot is published, no matter
    /// how the run ended.
    pub async fn execute(
        &self,
        mut batch: Batch,
        cancel: CancellationToken,
        lease: Lease,
    ) -> Batch {
        flog!(
            "Batch {} starting: {} phase(s), {} slot(s), max concurrency {}",
            batch.id,
            batch.plan.phases.len(),
            batch.slots.len(),
            batch.max_concurrency
        );

        let outcome = self.run(&mut batch, &cancel).await;

        match self.workspaces.cleanup_batch(&batch.id).await {
            Ok(report) if !report.is_success() => {
                flog_warn!("Cleanup of {} left {:?}", batch.id, report.failed);
            }
            Ok(_) => {}
            Err(e) => flog_warn!("Cleanup of {} failed: {}", batch.id, e),
        }
        lease.release().await;

        let settled = outcome.and_then(|terminal| batch.transition(terminal));
        if let Err(e) = settled {
            flog_error!("Batch {} failed: {}", batch.id, e);
            if !batch.phase.is_terminal() {
                if let Err(te) = batch.fail(e.to_string()) {
                    flog_error!("Could not mark {} failed: {}", batch.id, te);
                }
            }
        }

        self.projector.publish(&batch).await;
        flog!(
            "Batch {} finished: {} ({} merged, {} failed slot(s), cost ${:.2})",
            batch.id,
            batch.phase,
            batch.merge_results.iter().filter(|m| m.success).count(),
            batch.count_status(SlotStatus::Failed),
            batch.total_cost
        );
        batch
    }

    /// Drive the batch up to, but not into, its terminal phase, which is
    /// returned.
    async fn run(&self, batch: &mut Batch, cancel: &CancellationToken) -> Result<BatchPhase> {
        self.step(batch, BatchPhase::PreconditionCheck).await?;
        batch.plan.validate(batch.tasks.len())?;
        let dirty = self.workspaces.dirty_files().await?;
        if !dirty.is_empty() {
            return Err(Error::Precondition { dirty_files: dirty });
        }
        let trunk = self.workspaces.trunk_branch().await?;

        let phases = batch.plan.phases.clone();
        for phase in &phases {
            if cancel.is_cancelled() {
                break;
            }
            batch.current_phase_id = Some(phase.id);
            batch.current_phase_name = Some(phase.name.clone());
            self.step(batch, BatchPhase::Executing).await?;

            let base = self.workspaces.head_commit().await?;
            let runs = if phase.runs_concurrently() {
                self.run_parallel(batch, phase, &base, cancel).await
            } else {
                self.run_sequential(batch, phase, &base, cancel).await
            };

            self.step(batch, BatchPhase::Merging).await?;
            self.merge_phase(batch, runs, &trunk).await?;
        }

        if cancel.is_cancelled() {
            let flipped = batch.cancel_pending();
            flog!("Batch {} cancelled, {} pending slot(s) dropped", batch.id, flipped);
            return Ok(BatchPhase::Cancelled);
        }

        if batch.conflict_count() > 0 {
            flog_warn!(
                "Skipping verification for {}: {} unresolved conflict(s)",
                batch.id,
                batch.conflict_count()
            );
        } else {
            self.step(batch, BatchPhase::Verifying).await?;
            let request = VerificationRequest {
                plan: batch.plan.clone(),
                slots: batch.slots.clone(),
            };
            let verification = match self.collaborator.verify(request).await {
                Ok(result) => result,
                Err(e) => {
                    flog_warn!("Verification for {} errored: {}", batch.id, e);
                    VerificationResult::empty_failed(format!("Verification failed: {}", e))
                }
            };
            batch.verification = Some(verification);
        }

        self.step(batch, BatchPhase::Finalizing).await?;
        self.finalize(batch).await;
        batch.error = completion_note(batch);
        Ok(BatchPhase::Complete)
    }

    async fn step(&self, batch: &mut Batch, phase: BatchPhase) -> Result<()> {
        batch.transition(phase)?;
        flog!("Batch {} -> {}", batch.id, phase);
        self.projector.publish(batch).await;
        Ok(())
    }

    fn attempt_loop<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        events: &'a mpsc::UnboundedSender<DispatchEvent>,
    ) -> AttemptLoop<'a> {
        AttemptLoop {
            runner: self.runner.as_ref(),
            workspaces: &self.workspaces,
            cancel,
            events,
            tail_lines: self.settings.tail_lines,
        }
    }

    async fn run_parallel(
        &self,
        batch: &mut Batch,
        phase: &Phase,
        base: &str,
        cancel: &CancellationToken,
    ) -> Vec<WorkspaceRun> {
        let mut jobs = Vec::new();
        for assignment in &phase.assignments {
            if cancel.is_cancelled() {
                break;
            }
            let Some(first) = first_task(batch, phase.id, assignment.id) else {
                flog_warn!("Assignment {} owns no tasks, skipping", assignment.id);
                continue;
            };
            match self.workspaces.create_workspace(&batch.id, first, base).await {
                Ok(handle) => jobs.push(build_job(batch, phase, assignment, handle)),
                Err(e) => fail_group(
                    batch,
                    phase.id,
                    assignment.id,
                    format!("Workspace creation failed: {}", e),
                ),
            }
        }
        self.projector.publish(batch).await;

        let semaphore = Semaphore::new(batch.max_concurrency.max(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let attempts = self.attempt_loop(cancel, &tx);
        let outcomes = {
            let semaphore = &semaphore;
            let attempts = &attempts;
            let futures = jobs.iter().map(move |job| async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire() => permit.ok(),
                };
                match permit {
                    Some(_permit) => attempts.run(job).await,
                    None => AssignmentOutcome {
                        phase_id: job.phase_id,
                        group_id: job.group_id,
                        cancelled: true,
                        ..Default::default()
                    },
                }
            });
            self.drive(batch, join_all(futures), &mut rx).await
        };

        for outcome in &outcomes {
            apply_outcome(batch, outcome);
        }
        self.projector.publish(batch).await;

        jobs.into_iter()
            .zip(outcomes)
            .map(|(job, outcome)| WorkspaceRun {
                handle: job.workspace,
                merge: outcome.success,
                phase_id: job.phase_id,
                groups: vec![job.group_id],
            })
            .collect()
    }

    async fn run_sequential(
        &self,
        batch: &mut Batch,
        phase: &Phase,
        base: &str,
        cancel: &CancellationToken,
    ) -> Vec<WorkspaceRun> {
        let groups: Vec<&AgentAssignment> = phase
            .assignments
            .iter()
            .filter(|a| batch.group_has_slots(phase.id, a.id))
            .collect();
        let Some(first) = groups
            .first()
            .and_then(|a| first_task(batch, phase.id, a.id))
        else {
            return Vec::new();
        };
        if cancel.is_cancelled() {
            return Vec::new();
        }

        let handle = match self.workspaces.create_workspace(&batch.id, first, base).await {
            Ok(handle) => handle,
            Err(e) => {
                for assignment in &groups {
                    fail_group(
                        batch,
                        phase.id,
                        assignment.id,
                        format!("Workspace creation failed: {}", e),
                    );
                }
                self.projector.publish(batch).await;
                return Vec::new();
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let attempts = self.attempt_loop(cancel, &tx);
        let mut any_success = false;
        let group_ids: Vec<u32> = groups.iter().map(|a| a.id).collect();
        for assignment in groups {
            let job = build_job(batch, phase, assignment, handle.clone());
            let outcome = self.drive(batch, attempts.run(&job), &mut rx).await;
            apply_outcome(batch, &outcome);
            self.projector.publish(batch).await;
            any_success |= outcome.success;
        }

        vec![WorkspaceRun {
            handle,
            merge: any_success,
            phase_id: phase.id,
            groups: group_ids,
        }]
    }

    /// Await `work` while folding its progress events into the batch.
    async fn drive<F: Future>(
        &self,
        batch: &mut Batch,
        work: F,
        events: &mut mpsc::UnboundedReceiver<DispatchEvent>,
    ) -> F::Output {
        tokio::pin!(work);
        let output = loop {
            tokio::select! {
                output = &mut work => break output,
                Some(event) = events.recv() => {
                    apply_event(batch, event);
                    self.projector.publish(batch).await;
                }
            }
        };
        while let Ok(event) = events.try_recv() {
            apply_event(batch, event);
        }
        output
    }

    /// Remove each workspace, then merge or discard its branch, strictly in
    /// assignment order.
    async fn merge_phase(
        &self,
        batch: &mut Batch,
        runs: Vec<WorkspaceRun>,
        trunk: &str,
    ) -> Result<()> {
        for run in runs {
            if let Err(e) = self.workspaces.remove_workspace(&run.handle).await {
                flog_error!("Workspace {} could not be removed: {}", run.handle.branch, e);
                if run.merge {
                    let result = MergeResult::failed(
                        &run.handle.branch,
                        format!("Workspace could not be removed before merge: {}", e),
                    );
                    note_unmerged(batch, &run, &result);
                    batch.merge_results.push(result);
                    self.projector.publish(batch).await;
                }
                continue;
            }

            if run.merge {
                let result = self.workspaces.merge_and_delete(&run.handle, trunk).await?;
                if result.resolution_method == ResolutionMethod::Conflict {
                    flog_warn!(
                        "Conflict merging {}: {:?}",
                        result.branch_name,
                        result.conflict_files
                    );
                }
                if !result.success {
                    note_unmerged(batch, &run, &result);
                }
                batch.merge_results.push(result);
                self.projector.publish(batch).await;
            } else if let Err(e) = self.workspaces.discard_branch(&run.handle).await {
                flog_warn!("Could not delete {}: {}", run.handle.branch, e);
            }
        }
        Ok(())
    }

    /// Mark succeeded tasks in the tracking document and commit everything
    /// outstanding on the trunk.
    async fn finalize(&self, batch: &mut Batch) {
        let texts: Vec<String> = batch
            .succeeded_task_indices()
            .into_iter()
            .filter_map(|i| batch.tasks.get(i))
            .filter(|t| !t.done)
            .map(|t| t.text.clone())
            .collect();
        let doc = self
            .workspaces
            .repo_path()
            .join(&self.settings.tracking_document);
        let marked = match blocking(move || {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            tracking::mark_complete(&doc, &refs)
        })
        .await
        {
            Ok(n) => n,
            Err(e) => {
                flog_warn!("Could not update tracking document: {}", e);
                0
            }
        };

        let summary = match batch.plan.summary.trim() {
            "" => format!("batch {}", batch.id),
            s => s.to_string(),
        };
        let mut message = match self
            .workspaces
            .commit_trunk(&format!("feat(parallel): {}", summary))
            .await
        {
            Ok(Some(sha)) => format!("Committed as {:.7}. Marked {} item(s) complete.", sha, marked),
            Ok(None) => format!("Nothing to commit. Marked {} item(s) complete.", marked),
            Err(e) => {
                flog_error!("Finalize commit for {} failed: {}", batch.id, e);
                format!("Finalize commit failed: {}. Marked {} item(s) complete.", e, marked)
            }
        };
        if let Some(v) = batch.verification.as_ref().filter(|v| !v.overall_pass) {
            let _ = write!(message, " Verification noted issues: {}", v.summary);
        }
        flog!("Batch {} finalized: {}", batch.id, message);
        batch.finalize_message = Some(message);
    }
}

/// Succeeded slots whose work did not reach the trunk keep their status but
/// carry the merge message, which also keeps them out of completion marking.
fn note_unmerged(batch: &mut Batch, run: &WorkspaceRun, result: &MergeResult) {
    for &group in &run.groups {
        for slot in batch.slots_for_mut(run.phase_id, group) {
            if slot.status == SlotStatus::Succeeded {
                slot.error = Some(format!("Not merged: {}", result.message));
            }
        }
    }
}

fn first_task(batch: &Batch, phase_id: u32, group_id: u32) -> Option<usize> {
    batch.slots_for(phase_id, group_id).map(|s| s.task_index).next()
}

fn build_job(
    batch: &Batch,
    phase: &Phase,
    assignment: &AgentAssignment,
    workspace: WorkspaceHandle,
) -> AssignmentJob {
    AssignmentJob {
        phase_id: phase.id,
        group_id: assignment.id,
        theme: assignment.theme.clone(),
        prompt: assignment_prompt(assignment, &batch.tasks),
        workspace,
        commit_message: format!("Agent work for batch {}: {}", batch.id, assignment.theme),
    }
}

/// The assignment's detailed prompt followed by the prompts of its tasks.
pub fn assignment_prompt(assignment: &AgentAssignment, tasks: &[Task]) -> String {
    let mut prompt = assignment.detailed_prompt.trim().to_string();
    let listed: Vec<&Task> = assignment
        .task_indices
        .iter()
        .filter_map(|&i| tasks.get(i))
        .collect();
    if !listed.is_empty() {
        if !prompt.is_empty() {
            prompt.push_str("\n\n");
        }
        prompt.push_str("## Tasks\n");
        for task in listed {
            let _ = writeln!(prompt, "- {}", task.prompt());
        }
    }
    prompt
}

fn fail_group(batch: &mut Batch, phase_id: u32, group_id: u32, error: String) {
    flog_warn!("Assignment {} failed: {}", group_id, error);
    batch.set_group_status(phase_id, group_id, SlotStatus::Failed);
    for slot in batch.slots_for_mut(phase_id, group_id) {
        slot.error = Some(error.clone());
    }
}

fn apply_event(batch: &mut Batch, event: DispatchEvent) {
    match event {
        DispatchEvent::AttemptStarted {
            phase_id,
            group_id,
            attempt,
        } => {
            batch.set_group_status(phase_id, group_id, SlotStatus::Running);
            for slot in batch.slots_for_mut(phase_id, group_id) {
                slot.attempts = attempt;
            }
        }
        DispatchEvent::AttemptFinished {
            phase_id,
            group_id,
            output_tail,
            cost,
            error,
            ..
        } => {
            let share = cost.map(|c| {
                batch.total_cost += c;
                c / batch.slots_for(phase_id, group_id).count().max(1) as f64
            });
            for slot in batch.slots_for_mut(phase_id, group_id) {
                if output_tail.is_some() {
                    slot.output_tail = output_tail.clone();
                }
                if let Some(share) = share {
                    *slot.cost_estimate.get_or_insert(0.0) += share;
                }
                slot.error = error.clone();
            }
        }
    }
}

fn apply_outcome(batch: &mut Batch, outcome: &AssignmentOutcome) {
    let status = if outcome.success {
        SlotStatus::Succeeded
    } else if outcome.cancelled {
        SlotStatus::Cancelled
    } else {
        SlotStatus::Failed
    };
    batch.set_group_status(outcome.phase_id, outcome.group_id, status);
    for slot in batch.slots_for_mut(outcome.phase_id, outcome.group_id) {
        slot.error = match status {
            SlotStatus::Succeeded => None,
            SlotStatus::Cancelled => Some("Cancelled before dispatch".to_string()),
            _ => outcome.error.clone(),
        };
        if outcome.output_tail.is_some() {
            slot.output_tail = outcome.output_tail.clone();
        }
    }
}

/// Informational error for a batch that completed with problems.
fn completion_note(batch: &Batch) -> Option<String> {
    let conflicts = batch.conflict_count();
    let failed_merges = batch
        .merge_results
        .iter()
        .filter(|m| m.resolution_method == ResolutionMethod::Failed)
        .count();
    let failed_tasks = batch.count_status(SlotStatus::Failed);

    let mut parts = Vec::new();
    if conflicts > 0 {
        parts.push(format!(
            "{} merge conflict(s) need manual resolution",
            conflicts
        ));
    }
    if failed_merges > 0 {
        parts.push(format!("{} merge(s) failed", failed_merges));
    }
    if failed_tasks > 0 {
        parts.push(format!("{} task(s) failed", failed_tasks));
    }
    if parts.is_empty() {
        return None;
    }
    let headline = if conflicts > 0 {
        "Completed with conflicts"
    } else {
        "Completed with failures"
    };
    Some(format!("{}: {}", headline, parts.join("; ")))
}
