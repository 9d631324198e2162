//! Per-assignment attempt loop.
//!
//! An assignment gets at most `MAX_ATTEMPTS` dispatches. The workspace is
//! reset to where the assignment started between attempts. Non-retryable
//! failures (usage-limit exhaustion, missing binary) end the loop at once.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::util::output_tail;
use crate::workspace::{expected_output_exists, WorkspaceHandle, WorkspaceManager};
use crate::{flog, flog_debug, flog_warn};

use super::runner::AgentRunner;

pub const MAX_ATTEMPTS: u32 = 3;

/// Progress reported while an assignment runs.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    AttemptStarted {
        phase_id: u32,
        group_id: u32,
        attempt: u32,
    },
    AttemptFinished {
        phase_id: u32,
        group_id: u32,
        attempt: u32,
        output_tail: Option<String>,
        cost: Option<f64>,
        error: Option<String>,
    },
}

/// One assignment bound to a workspace.
#[derive(Debug, Clone)]
pub struct AssignmentJob {
    pub phase_id: u32,
    pub group_id: u32,
    pub theme: String,
    pub prompt: String,
    pub workspace: WorkspaceHandle,
    pub commit_message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentOutcome {
    pub phase_id: u32,
    pub group_id: u32,
    pub success: bool,
    /// Cancellation was observed before the first dispatch.
    pub cancelled: bool,
    pub attempts: u32,
    pub error: Option<String>,
    pub output_tail: Option<String>,
    pub cost: f64,
    pub commit: Option<String>,
}

pub struct AttemptLoop<'a> {
    pub runner: &'a dyn AgentRunner,
    pub workspaces: &'a WorkspaceManager,
    pub cancel: &'a CancellationToken,
    pub events: &'a mpsc::UnboundedSender<DispatchEvent>,
    pub tail_lines: usize,
}

impl AttemptLoop<'_> {
    pub async fn run(&self, job: &AssignmentJob) -> AssignmentOutcome {
        let mut outcome = AssignmentOutcome {
            phase_id: job.phase_id,
            group_id: job.group_id,
            ..Default::default()
        };

        let start_rev = match self.workspaces.head_of(&job.workspace).await {
            Ok(rev) => rev,
            Err(e) => {
                outcome.error = Some(format!("Workspace unavailable: {}", e));
                return outcome;
            }
        };

        for attempt in 1..=MAX_ATTEMPTS {
            if self.cancel.is_cancelled() {
                flog_debug!("Assignment {} not dispatched: batch cancelled", job.group_id);
                outcome.cancelled = outcome.attempts == 0;
                break;
            }

            if attempt > 1 {
                if let Err(e) = self.workspaces.reset_clean(&job.workspace, &start_rev).await {
                    flog_warn!("Reset before retry failed for {}: {}", job.workspace.branch, e);
                    outcome.error = Some(format!("Workspace reset failed: {}", e));
                    break;
                }
            }

            outcome.attempts = attempt;
            flog!(
                "Dispatching assignment {} ({}) attempt {}/{}",
                job.group_id,
                job.theme,
                attempt,
                MAX_ATTEMPTS
            );
            let _ = self.events.send(DispatchEvent::AttemptStarted {
                phase_id: job.phase_id,
                group_id: job.group_id,
                attempt,
            });

            let result = self.runner.dispatch(&job.prompt, &job.workspace.path).await;
            let (tail, cost, error, retryable, success) = match result {
                Ok(res) => {
                    let tail = output_tail(&res.output, self.tail_lines);
                    (tail, res.cost_usd, res.error.clone(), true, res.success)
                }
                Err(e) => (None, None, Some(e.to_string()), e.is_retryable(), false),
            };
            outcome.cost += cost.unwrap_or(0.0);
            if tail.is_some() {
                outcome.output_tail = tail.clone();
            }
            let _ = self.events.send(DispatchEvent::AttemptFinished {
                phase_id: job.phase_id,
                group_id: job.group_id,
                attempt,
                output_tail: tail,
                cost,
                error: error.clone(),
            });

            if !success {
                let message = error.unwrap_or_else(|| "Agent attempt failed".to_string());
                flog_warn!(
                    "Assignment {} attempt {} failed: {}",
                    job.group_id,
                    attempt,
                    message
                );
                outcome.error = Some(message);
                if !retryable {
                    break;
                }
                continue;
            }

            match self.settle(job, &start_rev).await {
                Ok(commit) => {
                    outcome.success = true;
                    outcome.commit = commit;
                    outcome.error = None;
                    break;
                }
                Err(message) => {
                    flog_warn!("Assignment {} attempt {}: {}", job.group_id, attempt, message);
                    outcome.error = Some(message);
                }
            }
        }

        if !outcome.success && !outcome.cancelled && outcome.attempts > 0 {
            // Leave the workspace as it was for whatever runs next in it.
            if let Err(e) = self.workspaces.reset_clean(&job.workspace, &start_rev).await {
                flog_warn!("Reset after failure failed for {}: {}", job.workspace.branch, e);
            }
        }
        outcome
    }

    /// Decide whether a successful attempt actually produced work, and commit it.
    async fn settle(&self, job: &AssignmentJob, start_rev: &str) -> Result<Option<String>, String> {
        let changed = self
            .workspaces
            .has_changes(&job.workspace, start_rev)
            .await
            .map_err(|e| format!("Could not inspect workspace: {}", e))?;
        if changed {
            return self
                .workspaces
                .commit(&job.workspace, &job.commit_message)
                .await
                .map_err(|e| format!("Commit failed: {}", e));
        }
        if expected_output_exists(&job.prompt, &job.workspace.path) {
            flog!(
                "Assignment {} made no changes but its output already exists",
                job.group_id
            );
            return Ok(None);
        }
        Err("Agent reported success but made no changes".to_string())
    }
}
