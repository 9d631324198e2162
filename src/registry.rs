//! Hosting-side entry points.
//!
//! `Engine` is the surface a host process talks to: planning jobs, batch
//! execution, polling, cancellation and orphan cleanup. Running batches and
//! the exclusive-execution lease live in a `BatchRegistry` that can be shared
//! between engines serving different repositories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{clamp_concurrency, Config};
use crate::core::{Batch, BatchId, ExecutionPlan, Task};
use crate::orchestration::{
    gather_project_context, runner_from_config, AgentRunner, ClaudePlanner, ExecutionOrchestrator,
    OrchestratorSettings, PlanRequest, PlanningCollaborator,
};
use crate::status::{BatchLookup, StatusProjector};
use crate::util::{blocking, output_tail};
use crate::workspace::{CleanupReport, WorkspaceManager};
use crate::{flog, flog_debug, flog_warn, Error, Result};

pub const PLAN_JOB_PREFIX: &str = "plan-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanJobStatus {
    Running,
    Complete,
    Failed,
}

/// Polling view of one planning or replanning request.
#[derive(Debug, Clone, Serialize)]
pub struct PlanJob {
    pub id: String,
    pub status: PlanJobStatus,
    pub plan: Option<ExecutionPlan>,
    pub output_tail: Option<String>,
    pub error: Option<String>,
    /// Set once the plan was handed to execution; the job can no longer be replanned.
    pub approved: bool,
    pub tasks: Vec<Task>,
    pub milestone: String,
    pub created_at: DateTime<Utc>,
}

fn plan_job_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}{}", PLAN_JOB_PREFIX, &hex[..12])
}

struct PlanJobEntry {
    job: PlanJob,
    cancel: CancellationToken,
}

#[derive(Clone, Default)]
struct PlanJobs {
    jobs: Arc<Mutex<HashMap<String, PlanJobEntry>>>,
}

impl PlanJobs {
    async fn insert(&self, job: PlanJob) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.jobs.lock().await.insert(
            job.id.clone(),
            PlanJobEntry {
                job,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    async fn get(&self, id: &str) -> Result<PlanJob> {
        self.jobs
            .lock()
            .await
            .get(id)
            .map(|e| e.job.clone())
            .ok_or_else(|| Error::PlanJobNotFound(id.to_string()))
    }

    /// Apply a terminal update unless the job already reached one.
    async fn settle(&self, id: &str, update: impl FnOnce(&mut PlanJob)) {
        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.get_mut(id) {
            if entry.job.status == PlanJobStatus::Running {
                update(&mut entry.job);
            }
        }
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| Error::PlanJobNotFound(id.to_string()))?;
        entry.cancel.cancel();
        if entry.job.status == PlanJobStatus::Running {
            entry.job.status = PlanJobStatus::Failed;
            entry.job.error = Some("Cancelled by user".to_string());
        }
        Ok(())
    }

    async fn approve(&self, id: &str) -> Result<PlanJob> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| Error::PlanJobNotFound(id.to_string()))?;
        if entry.job.approved {
            return Err(Error::PlanLocked(id.to_string()));
        }
        if entry.job.status != PlanJobStatus::Complete || entry.job.plan.is_none() {
            return Err(Error::InvalidPlan(format!("plan job {} has no plan", id)));
        }
        entry.job.approved = true;
        Ok(entry.job.clone())
    }
}

/// A batch's exclusive hold on one repository.
pub struct Lease {
    registry: BatchRegistry,
    repo: PathBuf,
    batch_id: BatchId,
}

impl Lease {
    pub async fn release(self) {
        self.registry.release_lease(&self.repo, &self.batch_id).await;
    }
}

struct BatchEntry {
    cancel: CancellationToken,
    handle: Option<JoinHandle<Batch>>,
}

/// Running batches and the per-repository execution lease.
#[derive(Clone, Default)]
pub struct BatchRegistry {
    leases: Arc<Mutex<HashMap<PathBuf, BatchId>>>,
    batches: Arc<Mutex<HashMap<BatchId, BatchEntry>>>,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire_lease(&self, repo: &Path, batch_id: &BatchId) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if let Some(holder) = leases.get(repo) {
            return Err(Error::LeaseHeld {
                repo: repo.display().to_string(),
                batch_id: holder.to_string(),
            });
        }
        leases.insert(repo.to_path_buf(), batch_id.clone());
        flog_debug!("Lease on {} taken by {}", repo.display(), batch_id);
        Ok(())
    }

    /// Take the lease as a guard handed to the batch that runs under it.
    pub async fn lease(&self, repo: &Path, batch_id: &BatchId) -> Result<Lease> {
        self.acquire_lease(repo, batch_id).await?;
        Ok(Lease {
            registry: self.clone(),
            repo: repo.to_path_buf(),
            batch_id: batch_id.clone(),
        })
    }

    /// Release the lease if `batch_id` holds it.
    pub async fn release_lease(&self, repo: &Path, batch_id: &BatchId) -> bool {
        let mut leases = self.leases.lock().await;
        if leases.get(repo) == Some(batch_id) {
            leases.remove(repo);
            flog_debug!("Lease on {} released by {}", repo.display(), batch_id);
            return true;
        }
        false
    }

    pub async fn lease_holder(&self, repo: &Path) -> Option<BatchId> {
        self.leases.lock().await.get(repo).cloned()
    }

    async fn insert(&self, id: BatchId, entry: BatchEntry) {
        self.batches.lock().await.insert(id, entry);
    }

    /// Signal cancellation. Returns false for unknown batches.
    pub async fn cancel(&self, id: &BatchId) -> bool {
        match self.batches.lock().await.get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn take_handle(&self, id: &BatchId) -> Option<JoinHandle<Batch>> {
        self.batches
            .lock()
            .await
            .get_mut(id)
            .and_then(|e| e.handle.take())
    }

    async fn forget(&self, ids: &[BatchId]) {
        let mut batches = self.batches.lock().await;
        for id in ids {
            batches.remove(id);
        }
    }
}

pub struct Engine {
    config: Config,
    workspaces: WorkspaceManager,
    collaborator: Arc<dyn PlanningCollaborator>,
    orchestrator: Arc<ExecutionOrchestrator>,
    projector: StatusProjector,
    registry: BatchRegistry,
    plans: PlanJobs,
}

impl Engine {
    pub fn new(
        config: Config,
        project_root: &Path,
        runner: Arc<dyn AgentRunner>,
        collaborator: Arc<dyn PlanningCollaborator>,
    ) -> Result<Self> {
        let workspaces = WorkspaceManager::new(project_root, &config.worktree_root(project_root))?;
        let projector = StatusProjector::new();
        let orchestrator = ExecutionOrchestrator::new(
            workspaces.clone(),
            runner,
            collaborator.clone(),
            projector.clone(),
            OrchestratorSettings::from_config(&config),
        );
        flog!(
            "Engine ready for {} (workspaces in {})",
            workspaces.repo_path().display(),
            workspaces.root().display()
        );
        Ok(Self {
            config,
            workspaces,
            collaborator,
            orchestrator: Arc::new(orchestrator),
            projector,
            registry: BatchRegistry::new(),
            plans: PlanJobs::default(),
        })
    }

    /// Engine backed by the configured CLI runner and the Claude planner.
    pub fn from_config(config: Config, project_root: &Path) -> Result<Self> {
        let runner = runner_from_config(&config)?;
        let collaborator = Arc::new(ClaudePlanner::new(runner.clone(), project_root));
        Self::new(config, project_root, runner, collaborator)
    }

    /// Share the lease table and batch registry with other engines.
    pub fn with_registry(mut self, registry: BatchRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &BatchRegistry {
        &self.registry
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn repo_path(&self) -> &Path {
        self.workspaces.repo_path()
    }

    async fn ensure_clean(&self) -> Result<()> {
        let dirty = self.workspaces.dirty_files().await?;
        if dirty.is_empty() {
            Ok(())
        } else {
            Err(Error::Precondition { dirty_files: dirty })
        }
    }

    /// Start planning `tasks` in the background. Refused on a dirty tree.
    pub async fn start_planning(&self, tasks: Vec<Task>, milestone: &str) -> Result<String> {
        self.ensure_clean().await?;
        let root = self.repo_path().to_path_buf();
        let tracking = self.config.tracking_document().to_string();
        let project_context = blocking(move || Ok(gather_project_context(&root, &tracking))).await?;
        let request = PlanRequest {
            tasks,
            milestone: milestone.to_string(),
            project_context,
            ..Default::default()
        };
        Ok(self.spawn_plan_job(request).await)
    }

    /// Ask for a revised plan. Only allowed before the job's plan was approved.
    pub async fn replan(
        &self,
        job_id: &str,
        previous_plan: ExecutionPlan,
        feedback: &str,
    ) -> Result<String> {
        let job = self.plans.get(job_id).await?;
        if job.approved {
            return Err(Error::PlanLocked(job_id.to_string()));
        }
        let root = self.repo_path().to_path_buf();
        let tracking = self.config.tracking_document().to_string();
        let project_context = blocking(move || Ok(gather_project_context(&root, &tracking))).await?;
        let request = PlanRequest {
            tasks: job.tasks,
            milestone: job.milestone,
            project_context,
            previous_plan: Some(previous_plan),
            feedback: Some(feedback.to_string()),
        };
        Ok(self.spawn_plan_job(request).await)
    }

    async fn spawn_plan_job(&self, request: PlanRequest) -> String {
        let id = plan_job_id();
        let task_count = request.tasks.len();
        let cancel = self
            .plans
            .insert(PlanJob {
                id: id.clone(),
                status: PlanJobStatus::Running,
                plan: None,
                output_tail: None,
                error: None,
                approved: false,
                tasks: request.tasks.clone(),
                milestone: request.milestone.clone(),
                created_at: Utc::now(),
            })
            .await;
        flog!(
            "Plan job {} started for {} task(s) (replan={})",
            id,
            task_count,
            request.is_replan()
        );

        let collaborator = self.collaborator.clone();
        let plans = self.plans.clone();
        let tail_lines = self.config.output_tail_lines();
        let job_id = id.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = collaborator.plan(request) => result,
            };
            match result.and_then(|reply| Ok((reply.plan.accept(task_count)?, reply.output))) {
                Ok((plan, output)) => {
                    flog!(
                        "Plan job {} complete: {} phase(s), {} warning(s)",
                        job_id,
                        plan.phases.len(),
                        plan.warnings.len()
                    );
                    plans
                        .settle(&job_id, |job| {
                            job.status = PlanJobStatus::Complete;
                            job.plan = Some(plan);
                            job.output_tail = output_tail(&output, tail_lines);
                        })
                        .await;
                }
                Err(e) => {
                    flog_warn!("Plan job {} failed: {}", job_id, e);
                    plans
                        .settle(&job_id, |job| {
                            job.status = PlanJobStatus::Failed;
                            job.error = Some(e.to_string());
                        })
                        .await;
                }
            }
        });
        id
    }

    pub async fn plan_status(&self, job_id: &str) -> Result<PlanJob> {
        self.plans.get(job_id).await
    }

    /// Execute the plan of a completed plan job and lock it against replanning.
    pub async fn approve_job(&self, job_id: &str, max_concurrency: Option<usize>) -> Result<BatchId> {
        let job = self.plans.approve(job_id).await?;
        let plan = job
            .plan
            .ok_or_else(|| Error::InvalidPlan(format!("plan job {} has no plan", job_id)))?;
        self.approve_and_execute(plan, job.tasks, max_concurrency).await
    }

    /// Validate `plan`, take the repository lease and start the batch in the
    /// background.
    pub async fn approve_and_execute(
        &self,
        plan: ExecutionPlan,
        tasks: Vec<Task>,
        max_concurrency: Option<usize>,
    ) -> Result<BatchId> {
        self.purge_expired().await;
        let plan = plan.accept(tasks.len())?;
        let max_concurrency = max_concurrency
            .map(clamp_concurrency)
            .unwrap_or_else(|| self.config.effective_max_concurrency());

        let id = BatchId::generate();
        let lease = self.registry.lease(self.repo_path(), &id).await?;
        self.projector.register(&id).await;

        let batch = Batch::new(id.clone(), plan, tasks, max_concurrency);
        let cancel = CancellationToken::new();
        let orchestrator = self.orchestrator.clone();
        let token = cancel.clone();
        let handle =
            tokio::spawn(async move { orchestrator.execute(batch, token, lease).await });
        self.registry
            .insert(
                id.clone(),
                BatchEntry {
                    cancel,
                    handle: Some(handle),
                },
            )
            .await;
        flog!("Batch {} approved with max concurrency {}", id, max_concurrency);
        Ok(id)
    }

    pub async fn poll_batch_status(&self, id: &BatchId) -> BatchLookup {
        self.purge_expired().await;
        self.projector.lookup(id).await
    }

    /// Best-effort cancel of a plan job or a batch.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        if id.starts_with(PLAN_JOB_PREFIX) {
            flog!("Cancelling plan job {}", id);
            return self.plans.cancel(id).await;
        }
        let batch_id: BatchId = id.parse()?;
        if self.registry.cancel(&batch_id).await {
            flog!("Cancellation requested for {}", batch_id);
            Ok(())
        } else {
            Err(Error::BatchNotFound(id.to_string()))
        }
    }

    /// Sweep workspaces and branches left behind by earlier processes.
    pub async fn cleanup_orphans(&self) -> Result<CleanupReport> {
        let repo = self.repo_path();
        if let Some(holder) = self.registry.lease_holder(repo).await {
            return Err(Error::LeaseHeld {
                repo: repo.display().to_string(),
                batch_id: holder.to_string(),
            });
        }
        self.workspaces.cleanup_orphans().await
    }

    pub async fn lease_holder(&self) -> Option<BatchId> {
        self.registry.lease_holder(self.repo_path()).await
    }

    /// Wait for a batch started by this engine and return its final state.
    pub async fn wait_for_batch(&self, id: &BatchId) -> Result<Batch> {
        match self.registry.take_handle(id).await {
            Some(handle) => handle.await.map_err(|e| Error::TaskJoin(e.to_string())),
            None => self
                .projector
                .lookup(id)
                .await
                .snapshot()
                .filter(|b| b.phase.is_terminal())
                .ok_or_else(|| Error::BatchNotFound(id.to_string())),
        }
    }

    async fn purge_expired(&self) {
        let purged = self.projector.purge_finished(self.config.retention()).await;
        if !purged.is_empty() {
            flog_debug!("Purged {} finished batch(es)", purged.len());
            self.registry.forget(&purged).await;
        }
    }
}
