//! Isolated per-assignment workspaces.
//!
//! Each workspace is a git worktree under the configured root, checked out on
//! its own `parallel/<batch id>/<task index>` branch. Directory names are
//! `<batch id>-<task index>` so a crashed run can be swept by name alone.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::core::{BatchId, MergeResult};
use crate::git::{self, GitOps, MergeOutcome};
use crate::util::blocking;
use crate::{flog, flog_debug, flog_error, flog_warn, Error, Result};

const REMOVE_ATTEMPTS: u32 = 3;
const REMOVE_BACKOFF: Duration = Duration::from_millis(250);
/// Files at or below this size do not count as produced output.
const TRIVIAL_FILE_BYTES: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceHandle {
    pub batch_id: BatchId,
    pub task_index: usize,
    pub branch: String,
    pub path: PathBuf,
    /// Commit the branch was created from.
    pub base_rev: String,
}

/// What a cleanup sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed_workspaces: Vec<PathBuf>,
    pub deleted_branches: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.removed_workspaces.is_empty()
            && self.deleted_branches.is_empty()
            && self.failed.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.removed_workspaces.extend(other.removed_workspaces);
        self.deleted_branches.extend(other.deleted_branches);
        self.failed.extend(other.failed);
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    repo_path: PathBuf,
    root: PathBuf,
}

impl WorkspaceManager {
    /// `root` is where workspace directories are created. When it sits inside
    /// the repository it is added to `.git/info/exclude`.
    pub fn new(repo_path: &Path, root: &Path) -> Result<Self> {
        let ops = GitOps::new(repo_path)?;
        ops.ensure_excluded(root)?;
        Ok(Self {
            repo_path: ops.repo_path().to_path_buf(),
            root: root.to_path_buf(),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ops(&self) -> Result<GitOps> {
        GitOps::new(&self.repo_path)
    }

    pub fn workspace_path(&self, batch_id: &BatchId, task_index: usize) -> PathBuf {
        self.root.join(format!("{}-{}", batch_id, task_index))
    }

    pub async fn trunk_branch(&self) -> Result<String> {
        let ops = self.ops()?;
        blocking(move || ops.current_branch()).await
    }

    pub async fn head_commit(&self) -> Result<String> {
        let ops = self.ops()?;
        blocking(move || ops.head_commit()).await
    }

    pub async fn dirty_files(&self) -> Result<Vec<String>> {
        let ops = self.ops()?;
        blocking(move || ops.dirty_files()).await
    }

    pub async fn create_workspace(
        &self,
        batch_id: &BatchId,
        task_index: usize,
        base_rev: &str,
    ) -> Result<WorkspaceHandle> {
        let handle = WorkspaceHandle {
            batch_id: batch_id.clone(),
            task_index,
            branch: batch_id.branch_for(task_index),
            path: self.workspace_path(batch_id, task_index),
            base_rev: base_rev.to_string(),
        };
        let ops = self.ops()?;
        let (branch, path, base) = (
            handle.branch.clone(),
            handle.path.clone(),
            handle.base_rev.clone(),
        );
        blocking(move || ops.add_worktree(&branch, &path, &base)).await?;
        flog!(
            "Workspace created: {} at {}",
            handle.branch,
            handle.path.display()
        );
        Ok(handle)
    }

    /// Remove the workspace directory, retrying with backoff.
    pub async fn remove_workspace(&self, handle: &WorkspaceHandle) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=REMOVE_ATTEMPTS {
            let ops = self.ops()?;
            let path = handle.path.clone();
            match blocking(move || ops.remove_worktree(&path)).await {
                Ok(()) => {
                    flog_debug!("Workspace removed: {}", handle.path.display());
                    return Ok(());
                }
                Err(e) => {
                    flog_warn!(
                        "Removing {} failed (attempt {}/{}): {}",
                        handle.path.display(),
                        attempt,
                        REMOVE_ATTEMPTS,
                        e
                    );
                    last_err = Some(e);
                    tokio::time::sleep(REMOVE_BACKOFF * attempt).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Workspace("workspace removal failed".to_string())))
    }

    /// Merge the workspace branch into `target` and delete the branch.
    ///
    /// The workspace must already be removed. Conflicts and merge errors are
    /// reported in the returned `MergeResult`; the branch is deleted either
    /// way.
    pub async fn merge_and_delete(
        &self,
        handle: &WorkspaceHandle,
        target: &str,
    ) -> Result<MergeResult> {
        let ops = self.ops()?;
        let branch = handle.branch.clone();
        let target = target.to_string();
        blocking(move || {
            if ops.worktree_for_branch(&branch)?.is_some() {
                return Err(Error::WorkspaceCheckedOut(branch));
            }
            let tip = ops.branch_tip(&branch)?.unwrap_or_default();
            let result = match ops.merge_no_ff(&branch, &target) {
                Ok(MergeOutcome::Merged { commit }) => {
                    flog!("Merged {} into {} as {:.7}", branch, target, commit);
                    MergeResult::clean(&branch, format!("Merged as {}", commit))
                }
                Ok(MergeOutcome::UpToDate) => {
                    flog!("{} had nothing to merge", branch);
                    MergeResult::clean(&branch, "Already up to date")
                }
                Ok(MergeOutcome::Conflicts(files)) => {
                    let message = format!(
                        "Merge conflicts in {} file(s); branch tip was {}",
                        files.len(),
                        tip
                    );
                    MergeResult::conflict(&branch, files, message)
                }
                Err(e) => {
                    flog_error!("Merge of {} failed: {}", branch, e);
                    MergeResult::failed(&branch, e.to_string())
                }
            };
            if let Err(e) = ops.delete_branch(&branch) {
                flog_warn!("Could not delete {}: {}", branch, e);
            }
            Ok(result)
        })
        .await
    }

    /// Delete a workspace branch without merging it.
    pub async fn discard_branch(&self, handle: &WorkspaceHandle) -> Result<()> {
        let ops = self.ops()?;
        let branch = handle.branch.clone();
        blocking(move || ops.delete_branch(&branch).map(|_| ())).await
    }

    /// Discard everything in the workspace since `rev`.
    pub async fn reset_clean(&self, handle: &WorkspaceHandle, rev: &str) -> Result<()> {
        let path = handle.path.clone();
        let rev = rev.to_string();
        blocking(move || git::reset_clean(&path, &rev)).await
    }

    pub async fn head_of(&self, handle: &WorkspaceHandle) -> Result<String> {
        let path = handle.path.clone();
        blocking(move || git::head_commit_at(&path)).await
    }

    /// Uncommitted changes, or commits made since `since`.
    pub async fn has_changes(&self, handle: &WorkspaceHandle, since: &str) -> Result<bool> {
        let path = handle.path.clone();
        let since = since.to_string();
        blocking(move || Ok(git::has_changes(&path)? || git::head_commit_at(&path)? != since)).await
    }

    pub async fn commit(&self, handle: &WorkspaceHandle, message: &str) -> Result<Option<String>> {
        let path = handle.path.clone();
        let message = message.to_string();
        blocking(move || git::commit_all(&path, &message)).await
    }

    /// Commit outstanding changes on the trunk.
    pub async fn commit_trunk(&self, message: &str) -> Result<Option<String>> {
        let path = self.repo_path.clone();
        let message = message.to_string();
        blocking(move || git::commit_all(&path, &message)).await
    }

    /// Remove every workspace and branch belonging to `batch_id`. Idempotent.
    pub async fn cleanup_batch(&self, batch_id: &BatchId) -> Result<CleanupReport> {
        let ops = self.ops()?;
        let root = self.root.clone();
        let dir_prefix = format!("{}-", batch_id);
        let branch_prefix = batch_id.branch_prefix();
        let report = blocking(move || {
            sweep(&ops, &root, |name| name.starts_with(&dir_prefix), &branch_prefix)
        })
        .await?;
        log_report(&format!("cleanup_batch {}", batch_id), &report);
        Ok(report)
    }

    /// Remove every workspace and branch left by any batch. Intended to run
    /// once at startup; a second call finds nothing.
    pub async fn cleanup_orphans(&self) -> Result<CleanupReport> {
        let ops = self.ops()?;
        let root = self.root.clone();
        let report = blocking(move || sweep(&ops, &root, is_workspace_dir_name, "parallel/par-")).await?;
        log_report("cleanup_orphans", &report);
        Ok(report)
    }
}

fn log_report(label: &str, report: &CleanupReport) {
    if report.is_empty() {
        flog_debug!("{}: nothing to clean", label);
        return;
    }
    flog!(
        "{}: removed {} workspace(s), deleted {} branch(es), {} failure(s)",
        label,
        report.removed_workspaces.len(),
        report.deleted_branches.len(),
        report.failed.len()
    );
}

/// `<batch id>-<task index>`
fn is_workspace_dir_name(name: &str) -> bool {
    match name.rsplit_once('-') {
        Some((batch, index)) => {
            BatchId::is_valid(batch) && !index.is_empty() && index.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

fn sweep(
    ops: &GitOps,
    root: &Path,
    matches_dir: impl Fn(&str) -> bool,
    branch_prefix: &str,
) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let mut targets: BTreeSet<PathBuf> = BTreeSet::new();

    for (name, path) in ops.list_worktrees()? {
        if matches_dir(&name) {
            targets.insert(path);
        }
    }
    if root.is_dir() {
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if matches_dir(name) {
                    targets.insert(root.join(name));
                }
            }
        }
    }

    for path in targets {
        match ops.remove_worktree(&path) {
            Ok(()) => report.removed_workspaces.push(path),
            Err(e) => report
                .failed
                .push((path.display().to_string(), e.to_string())),
        }
    }
    ops.prune_worktrees()?;

    for branch in ops.list_branches(branch_prefix)? {
        match ops.delete_branch(&branch) {
            Ok(true) => report.deleted_branches.push(branch),
            Ok(false) => {}
            Err(e) => report.failed.push((branch, e.to_string())),
        }
    }
    Ok(report)
}

fn path_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:[A-Za-z0-9_.-]+/)*[A-Za-z0-9_-][A-Za-z0-9_.-]*\.[A-Za-z][A-Za-z0-9]{0,7}\b")
            .expect("static regex")
    })
}

/// File paths mentioned in a prompt, in order of first appearance.
pub fn paths_in_prompt(prompt: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    path_token_re()
        .find_iter(prompt)
        .map(|m| m.as_str().trim_start_matches("./").to_string())
        .filter(|p| !p.starts_with('.') && !p.contains("..") && seen.insert(p.clone()))
        .collect()
}

/// Whether a prompt's work already appears to be present in `workspace`:
/// at least half of the files it names exist with non-trivial content.
pub fn expected_output_exists(prompt: &str, workspace: &Path) -> bool {
    let paths = paths_in_prompt(prompt);
    if paths.is_empty() {
        return false;
    }
    let present = paths
        .iter()
        .filter(|p| {
            fs::metadata(workspace.join(p))
                .map(|m| m.is_file() && m.len() > TRIVIAL_FILE_BYTES)
                .unwrap_or(false)
        })
        .count();
    present * 2 >= paths.len()
}
