use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

use fanout::config::Config;
use fanout::core::{Batch, BatchPhase, ExecutionPlan, SlotStatus, Task};
use fanout::{flog, BatchLookup, Engine, PlanJobStatus, Result};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Fanout - run a task list as parallel agent assignments in isolated git worktrees
#[derive(Parser, Debug)]
#[command(name = "fanout")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FANOUT_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.fanout/fanout.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Project root (defaults to the current directory)
    #[arg(short = 'C', long, global = true)]
    pub project: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Report whether the working tree is clean enough to execute
    Check,

    /// Remove workspaces and branches left behind by earlier runs
    CleanupOrphans,

    /// Ask the planning agent to group tasks into a phased plan
    Plan {
        /// JSON array of tasks ({"text": ..., "done": false, "prompt": ...})
        #[arg(long)]
        tasks: PathBuf,

        /// Heading the tasks belong to
        #[arg(long, default_value = "")]
        milestone: String,

        /// Write the plan here instead of stdout
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },

    /// Execute an approved plan
    Execute {
        /// Plan JSON produced by `fanout plan`
        #[arg(long)]
        plan: PathBuf,

        /// The task list the plan was made for
        #[arg(long)]
        tasks: PathBuf,

        /// Concurrent assignments per parallel phase (1-8)
        #[arg(long)]
        max_concurrency: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    fanout::log::init_with_debug(cli.debug);

    let project = match cli.project {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let config = Config::load()?;
    flog!("fanout {:?} in {}", cli.command, project.display());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let engine = Engine::from_config(config, &project)?;
        match cli.command {
            Command::Check => run_check(&engine).await,
            Command::CleanupOrphans => run_cleanup(&engine).await,
            Command::Plan {
                tasks,
                milestone,
                out,
            } => run_plan(&engine, &tasks, &milestone, out.as_deref()).await,
            Command::Execute {
                plan,
                tasks,
                max_concurrency,
            } => run_execute(&engine, &plan, &tasks, max_concurrency).await,
        }
    })
}

fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

async fn run_check(engine: &Engine) -> Result<()> {
    let workspaces = engine.workspaces();
    println!("Repository:  {}", workspaces.repo_path().display());
    println!("Trunk:       {}", workspaces.trunk_branch().await?);
    println!("Workspaces:  {}", workspaces.root().display());
    let dirty = workspaces.dirty_files().await?;
    if dirty.is_empty() {
        println!("Status:      clean");
        return Ok(());
    }
    println!("Status:      {} uncommitted change(s)", dirty.len());
    for file in &dirty {
        println!("  {}", file);
    }
    Err(fanout::Error::Precondition { dirty_files: dirty })
}

async fn run_cleanup(engine: &Engine) -> Result<()> {
    let report = engine.cleanup_orphans().await?;
    if report.is_empty() {
        println!("Nothing to clean up.");
        return Ok(());
    }
    for path in &report.removed_workspaces {
        println!("Removed workspace {}", path.display());
    }
    for branch in &report.deleted_branches {
        println!("Deleted branch {}", branch);
    }
    for (item, error) in &report.failed {
        eprintln!("Failed to remove {}: {}", item, error);
    }
    Ok(())
}

async fn run_plan(engine: &Engine, tasks: &Path, milestone: &str, out: Option<&Path>) -> Result<()> {
    let tasks = load_tasks(tasks)?;
    let job_id = engine.start_planning(tasks, milestone).await?;
    eprintln!("Planning ({})...", job_id);

    let job = loop {
        let job = engine.plan_status(&job_id).await?;
        if job.status != PlanJobStatus::Running {
            break job;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    let plan = match (job.status, job.plan) {
        (PlanJobStatus::Complete, Some(plan)) => plan,
        _ => {
            if let Some(tail) = &job.output_tail {
                eprintln!("{}", tail);
            }
            return Err(fanout::Error::InvalidPlan(
                job.error.unwrap_or_else(|| "planning failed".to_string()),
            ));
        }
    };

    print_plan(&plan);
    let json = serde_json::to_string_pretty(&plan)?;
    match out {
        Some(path) => {
            fs::write(path, json)?;
            eprintln!("Plan written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn print_plan(plan: &ExecutionPlan) {
    eprintln!();
    eprintln!("  {}", plan.summary);
    for phase in &plan.phases {
        let mode = if phase.runs_concurrently() { "parallel" } else { "sequential" };
        eprintln!();
        eprintln!("  Phase {}: {} ({})", phase.id, phase.name, mode);
        if !phase.description.is_empty() {
            eprintln!("    {}", phase.description);
        }
        for a in &phase.assignments {
            eprintln!("    [{}] {} -> tasks {:?}", a.id, a.theme, a.task_indices);
            if !a.rationale.is_empty() {
                eprintln!("        {}", a.rationale);
            }
        }
    }
    for warning in &plan.warnings {
        eprintln!("  warning: {}", warning);
    }
    eprintln!();
}

async fn run_execute(
    engine: &Engine,
    plan: &Path,
    tasks: &Path,
    max_concurrency: Option<usize>,
) -> Result<()> {
    let plan: ExecutionPlan = serde_json::from_str(&fs::read_to_string(plan)?)?;
    let tasks = load_tasks(tasks)?;

    let report = engine.cleanup_orphans().await?;
    if !report.is_empty() {
        eprintln!(
            "Cleaned up {} stale workspace(s) and {} branch(es)",
            report.removed_workspaces.len(),
            report.deleted_branches.len()
        );
    }

    let batch_id = engine.approve_and_execute(plan, tasks, max_concurrency).await?;
    println!("Batch {}", batch_id);

    let mut last: Option<(BatchPhase, Option<u32>)> = None;
    loop {
        if let BatchLookup::Snapshot(batch) = engine.poll_batch_status(&batch_id).await {
            let current = (batch.phase, batch.current_phase_id);
            if last != Some(current) {
                println!("  {}", progress_line(&batch));
                last = Some(current);
            }
            if batch.phase.is_terminal() {
                break;
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let batch = engine.wait_for_batch(&batch_id).await?;
    print_summary(&batch);
    Ok(())
}

fn progress_line(batch: &Batch) -> String {
    let running = batch.count_status(SlotStatus::Running);
    let done = batch.slots.iter().filter(|s| s.status.is_finished()).count();
    match &batch.current_phase_name {
        Some(name) => format!(
            "{} | phase {} ({}) | {}/{} done, {} running",
            batch.phase,
            batch.current_phase_id.unwrap_or_default(),
            name,
            done,
            batch.slots.len(),
            running
        ),
        None => format!("{}", batch.phase),
    }
}

fn print_summary(batch: &Batch) {
    println!();
    println!("  Batch:       {}", batch.id);
    println!("  Result:      {}", batch.phase);
    println!(
        "  Tasks:       {} succeeded, {} failed, {} cancelled",
        batch.count_status(SlotStatus::Succeeded),
        batch.count_status(SlotStatus::Failed),
        batch.count_status(SlotStatus::Cancelled)
    );
    println!("  Cost:        ${:.2}", batch.total_cost);
    for slot in batch.slots.iter().filter(|s| s.status == SlotStatus::Failed) {
        println!(
            "    task {} failed: {}",
            slot.task_index,
            slot.error.as_deref().unwrap_or("unknown error")
        );
    }
    for merge in batch.merge_results.iter().filter(|m| !m.success) {
        println!("    {}: {}", merge.branch_name, merge.message);
        for file in &merge.conflict_files {
            println!("      {}", file);
        }
    }
    if let Some(verification) = &batch.verification {
        let verdict = if verification.overall_pass { "passed" } else { "failed" };
        println!("  Verify:      {} - {}", verdict, verification.summary);
    }
    if let Some(message) = &batch.finalize_message {
        println!("  Finalize:    {}", message);
    }
    if let Some(error) = &batch.error {
        println!("  Note:        {}", error);
    }
    println!();
}
