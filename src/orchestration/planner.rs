//! Planning collaborator contract and the Claude-backed implementation.
//!
//! The engine treats the planner as a black box: it hands over the task list
//! plus project context and gets back an `ExecutionPlan` (or an error). The
//! same collaborator is asked once, after all merges, to check the plan's
//! success criteria.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use git2::Repository;

use crate::core::plan::extract_json;
use crate::core::{ExecutionPlan, Task, TaskSlot, VerificationResult};
use crate::error::{Error, Result};
use crate::{flog, flog_debug};

use super::runner::AgentRunner;

const CONVENTIONS_MAX_CHARS: usize = 12_000;
const TRACKING_MAX_CHARS: usize = 2_000;
const FILE_TREE_MAX_CHARS: usize = 8_000;

#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub tasks: Vec<Task>,
    /// Heading the tasks belong to, e.g. a milestone title.
    pub milestone: String,
    pub project_context: String,
    pub previous_plan: Option<ExecutionPlan>,
    pub feedback: Option<String>,
}

impl PlanRequest {
    pub fn is_replan(&self) -> bool {
        self.previous_plan.is_some() && self.feedback.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct PlanReply {
    pub plan: ExecutionPlan,
    /// Raw collaborator output, kept for status tails.
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub plan: ExecutionPlan,
    pub slots: Vec<TaskSlot>,
}

#[async_trait]
pub trait PlanningCollaborator: Send + Sync {
    async fn plan(&self, request: PlanRequest) -> Result<PlanReply>;

    async fn verify(&self, request: VerificationRequest) -> Result<VerificationResult>;
}

/// Collaborator that prompts an `AgentRunner` and parses JSON from its output.
pub struct ClaudePlanner {
    runner: Arc<dyn AgentRunner>,
    project_root: PathBuf,
}

impl ClaudePlanner {
    pub fn new(runner: Arc<dyn AgentRunner>, project_root: &Path) -> Self {
        Self {
            runner,
            project_root: project_root.to_path_buf(),
        }
    }
}

#[async_trait]
impl PlanningCollaborator for ClaudePlanner {
    async fn plan(&self, request: PlanRequest) -> Result<PlanReply> {
        let prompt = planning_prompt(&request)?;
        flog!(
            "Planning {} task(s) with {} (replan={})",
            request.tasks.len(),
            self.runner.name(),
            request.is_replan()
        );
        let attempt = self.runner.dispatch(&prompt, &self.project_root).await?;
        if !attempt.success {
            return Err(Error::Dispatch(
                attempt
                    .error
                    .unwrap_or_else(|| "planning agent failed".to_string()),
            ));
        }
        let plan = ExecutionPlan::from_output(&attempt.output)?;
        Ok(PlanReply {
            plan,
            output: attempt.output,
        })
    }

    async fn verify(&self, request: VerificationRequest) -> Result<VerificationResult> {
        let prompt = verification_prompt(&request);
        flog_debug!("Verification prompt is {} chars", prompt.len());
        let attempt = self.runner.dispatch(&prompt, &self.project_root).await?;
        if !attempt.success {
            return Err(Error::Dispatch(format!(
                "verification agent failed: {}",
                attempt.error.unwrap_or_default()
            )));
        }
        parse_verification(&attempt.output)
    }
}

pub fn parse_verification(output: &str) -> Result<VerificationResult> {
    let value = extract_json(output)?;
    Ok(serde_json::from_value(value)?)
}

/// Context handed to the planner: conventions file, tracking document head,
/// and the tracked file list, each truncated.
pub fn gather_project_context(project_root: &Path, tracking_document: &str) -> String {
    let mut ctx = String::new();
    let conventions = read_truncated(&project_root.join("CLAUDE.md"), CONVENTIONS_MAX_CHARS)
        .unwrap_or_else(|| "(no CLAUDE.md found)".to_string());
    let tracking = read_truncated(&project_root.join(tracking_document), TRACKING_MAX_CHARS)
        .unwrap_or_else(|| format!("(no {} found)", tracking_document));
    let tree = tracked_files(project_root).unwrap_or_else(|_| "(file list unavailable)".to_string());

    let _ = writeln!(ctx, "## Project Conventions\n{}\n", conventions);
    let _ = writeln!(ctx, "## Tracking Document\n{}\n", tracking);
    let _ = write!(ctx, "## Project Files\n{}", tree);
    ctx
}

fn read_truncated(path: &Path, max_chars: usize) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    Some(truncate(&text, max_chars))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("\n... (truncated)");
    out
}

fn tracked_files(project_root: &Path) -> Result<String> {
    let repo = Repository::discover(project_root)?;
    let index = repo.index()?;
    let files: Vec<String> = index
        .iter()
        .map(|e| String::from_utf8_lossy(&e.path).to_string())
        .collect();
    Ok(truncate(&files.join("\n"), FILE_TREE_MAX_CHARS))
}

pub fn planning_prompt(request: &PlanRequest) -> Result<String> {
    if let (Some(previous), Some(feedback)) = (&request.previous_plan, &request.feedback) {
        let previous_json = serde_json::to_string_pretty(previous)?;
        return Ok(format!(
            "You are revising a parallel execution plan.\n\n\
             ## Previous Plan\n{}\n\n\
             ## Feedback\n{}\n\n\
             {}\n\n\
             ## Instructions\n\
             Briefly describe what you are changing, then output the revised plan as a \
             ```json fenced block in the same format as the previous plan. Keep the same \
             level of detail in every detailed_prompt.",
            previous_json, feedback, request.project_context
        ));
    }

    let mut tasks = String::new();
    for (i, task) in request.tasks.iter().enumerate() {
        let _ = writeln!(tasks, "{}. {}", i, task.text);
        if let Some(prompt) = task.prompt.as_deref().filter(|p| *p != task.text) {
            let _ = writeln!(tasks, "     Custom prompt: {}", prompt);
        }
    }

    Ok(format!(
        "You are planning the parallel execution of a set of tasks.\n\n\
         {}\n\n\
         ## Milestone: {}\n\
         ## Tasks (0-based indices)\n{}\n\
         ## Your Job\n\
         Group the tasks by theme into agents, order them into phases so that a task \
         only runs after the tasks it depends on, and write a detailed implementation \
         prompt for every agent naming the files it should create or modify and what \
         the other agents in the same phase are doing.\n\n\
         Output the plan as a ```json fenced block:\n\
         {{\n  \"summary\": \"...\",\n  \"phases\": [\n    {{\"id\": 0, \"name\": \"...\", \
         \"description\": \"...\", \"is_parallel\": true,\n     \"assignments\": [{{\"id\": 0, \
         \"theme\": \"...\", \"task_indices\": [0, 2], \"rationale\": \"...\", \
         \"detailed_prompt\": \"...\"}}]}}\n  ],\n  \"success_criteria\": [\"...\"],\n  \
         \"warnings\": []\n}}\n\n\
         Rules:\n\
         - Every task index appears in exactly one assignment\n\
         - Phase ids increase; all ids are plain integers\n\
         - Target 2-5 agents in total, never one agent per task\n\
         - Success criteria must be concrete and checkable\n\
         - Do not write files; print the plan to stdout",
        request.project_context, request.milestone, tasks
    ))
}

pub fn verification_prompt(request: &VerificationRequest) -> String {
    let mut criteria = String::new();
    for (i, c) in request.plan.success_criteria.iter().enumerate() {
        let _ = writeln!(criteria, "{}. {}", i + 1, c);
    }

    let mut statuses = String::new();
    for slot in &request.slots {
        let _ = write!(
            statuses,
            "- Agent {} (phase {}): {}",
            slot.group_id, slot.phase_id, slot.status
        );
        if let Some(err) = &slot.error {
            let _ = write!(statuses, " ({})", err);
        }
        let _ = writeln!(statuses, " | task: {}", slot.task_text);
    }
    let succeeded = request
        .slots
        .iter()
        .filter(|s| s.status == crate::core::SlotStatus::Succeeded)
        .count();

    format!(
        "You are verifying whether an implementation meets its success criteria.\n\n\
         ## Success Criteria\n{}\n\
         ## Agent Execution Results\n{}\n\
         Total tasks: {}, succeeded: {}. Use these results as the source of truth for \
         any criterion about tasks completing without errors.\n\n\
         ## Instructions\n\
         Check each criterion against the codebase and give evidence (file paths, \
         command output). Output ONLY JSON:\n\
         {{\"overall_pass\": true, \"criteria_results\": [{{\"criterion\": \"...\", \
         \"passed\": true, \"evidence\": \"...\", \"notes\": \"...\"}}], \"summary\": \"...\"}}",
        criteria,
        statuses,
        request.slots.len(),
        succeeded
    )
}
