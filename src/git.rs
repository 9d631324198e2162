use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use git2::{
    BranchType, ErrorCode, IndexAddOption, Repository, ResetType, Signature, Status,
    StatusOptions, WorktreePruneOptions,
};

use crate::{flog_debug, flog_warn, Error, Result};

/// Outcome of a no-fast-forward merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { commit: String },
    UpToDate,
    /// The merge was aborted; the target branch is back where it started.
    Conflicts(Vec<String>),
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        flog_debug!("GitOps::new path={}", repo_path.display());
        let repo = Repository::discover(repo_path)
            .map_err(|_| Error::NotARepository(repo_path.display().to_string()))?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| Error::NotARepository(repo_path.display().to_string()))?;
        Ok(Self {
            repo_path: workdir.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn current_branch(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        if head.is_branch() {
            if let Some(name) = head.shorthand() {
                return Ok(name.to_string());
            }
        }
        let commit = head.peel_to_commit()?;
        Ok(format!("{:.7}", commit.id()))
    }

    pub fn head_commit(&self) -> Result<String> {
        head_commit_at(&self.repo_path)
    }

    /// Tracked paths with staged or unstaged modifications. Untracked files
    /// are ignored.
    pub fn dirty_files(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(false).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        let tracked_change = Status::INDEX_NEW
            | Status::INDEX_MODIFIED
            | Status::INDEX_DELETED
            | Status::INDEX_RENAMED
            | Status::INDEX_TYPECHANGE
            | Status::WT_MODIFIED
            | Status::WT_DELETED
            | Status::WT_RENAMED
            | Status::WT_TYPECHANGE
            | Status::CONFLICTED;
        Ok(statuses
            .iter()
            .filter(|entry| entry.status().intersects(tracked_change))
            .filter_map(|entry| entry.path().map(String::from))
            .collect())
    }

    /// Add `path` to `.git/info/exclude` when it lives inside the work tree.
    pub fn ensure_excluded(&self, path: &Path) -> Result<()> {
        let Ok(relative) = path.strip_prefix(&self.repo_path) else {
            return Ok(());
        };
        let pattern = format!("/{}/", relative.to_string_lossy().trim_end_matches('/'));
        if pattern == "//" {
            return Ok(());
        }

        let repo = self.repo()?;
        let info_dir = repo.commondir().join("info");
        fs::create_dir_all(&info_dir)?;
        let exclude = info_dir.join("exclude");
        let existing = fs::read_to_string(&exclude).unwrap_or_default();
        if existing.lines().any(|l| l.trim() == pattern) {
            return Ok(());
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&exclude)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{}", pattern)?;
        flog_debug!("Added {} to {}", pattern, exclude.display());
        Ok(())
    }

    /// Create `branch` at `base_rev` and check it out into `worktree_path`.
    ///
    /// An existing branch or directory is a leftover from an earlier run and
    /// is reported as `WorkspaceExists` rather than reused.
    pub fn add_worktree(&self, branch: &str, worktree_path: &Path, base_rev: &str) -> Result<()> {
        flog_debug!(
            "GitOps::add_worktree branch={} path={} base={}",
            branch,
            worktree_path.display(),
            base_rev
        );
        if self.branch_exists(branch)? || worktree_path.exists() {
            return Err(Error::WorkspaceExists(branch.to_string()));
        }
        if let Some(parent) = worktree_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let repo = self.repo()?;
        let commit = repo.revparse_single(base_rev)?.peel_to_commit()?;
        let branch_ref = repo.branch(branch, &commit, false)?.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes, so the directory name doubles as the worktree name.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Workspace(format!("bad path {}", worktree_path.display())))?;
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        flog_debug!("Worktree {} created at {}", worktree_name, commit.id());
        Ok(())
    }

    /// Remove a worktree directory and its admin entry so the branch is no
    /// longer considered checked out.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        flog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);

        let worktree_name = repo
            .worktrees()?
            .iter()
            .flatten()
            .find(|name| {
                Some(*name) == folder_name.as_deref()
                    || repo
                        .find_worktree(name)
                        .map(|wt| wt.path() == worktree_path)
                        .unwrap_or(false)
            })
            .map(String::from);

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(&mut prune_all())) {
                    flog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            fs::remove_dir_all(worktree_path)?;
        }

        // A leftover .git/worktrees/<name> keeps the branch checked out.
        for name in worktree_name.iter().chain(folder_name.iter()) {
            let admin_dir = repo.commondir().join("worktrees").join(name);
            if admin_dir.exists() {
                flog_debug!("Removing worktree admin dir {}", admin_dir.display());
                fs::remove_dir_all(&admin_dir)?;
            }
        }
        Ok(())
    }

    /// Prune admin entries whose directories no longer exist.
    pub fn prune_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                if !wt.path().exists() && wt.prune(Some(&mut prune_all())).is_ok() {
                    flog_debug!("Pruned stale worktree {}", name);
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }

    /// Worktrees registered with the repository, as `(name, path)`.
    pub fn list_worktrees(&self) -> Result<Vec<(String, PathBuf)>> {
        let repo = self.repo()?;
        let mut out = Vec::new();
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                out.push((name.to_string(), wt.path().to_path_buf()));
            }
        }
        Ok(out)
    }

    /// Path of the worktree that has `branch` checked out, if any.
    pub fn worktree_for_branch(&self, branch: &str) -> Result<Option<PathBuf>> {
        let repo = self.repo()?;
        let wanted = format!("refs/heads/{}", branch);
        for name in repo.worktrees()?.iter().flatten() {
            let Ok(wt) = repo.find_worktree(name) else {
                continue;
            };
            if !wt.path().exists() {
                continue;
            }
            let Ok(wt_repo) = Repository::open_from_worktree(&wt) else {
                continue;
            };
            let checked_out = wt_repo
                .head()
                .ok()
                .and_then(|h| h.name().map(String::from));
            if checked_out.as_deref() == Some(wanted.as_str()) {
                return Ok(Some(wt.path().to_path_buf()));
            }
        }
        Ok(None)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        exists
    }

    pub fn branch_tip(&self, branch: &str) -> Result<Option<String>> {
        let repo = self.repo()?;
        let tip = match repo.find_branch(branch, BranchType::Local) {
            Ok(b) => Some(b.get().peel_to_commit()?.id().to_string()),
            Err(e) if e.code() == ErrorCode::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(tip)
    }

    /// Local branch names starting with `prefix`.
    pub fn list_branches(&self, prefix: &str) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let mut names = Vec::new();
        for entry in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = entry?;
            if let Some(name) = branch.name()? {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete a local branch. Returns `false` when it did not exist.
    pub fn delete_branch(&self, branch: &str) -> Result<bool> {
        flog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        let deleted = match repo.find_branch(branch, BranchType::Local) {
            Ok(mut b) => {
                b.delete()?;
                true
            }
            Err(e) if e.code() == ErrorCode::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok(deleted)
    }

    /// Merge `branch` into `target` with a merge commit even when a
    /// fast-forward would be possible. Conflicts abort the merge.
    pub fn merge_no_ff(&self, branch: &str, target: &str) -> Result<MergeOutcome> {
        flog_debug!("GitOps::merge_no_ff branch={} target={}", branch, target);
        let repo = self.repo()?;

        let target_ref = repo.find_branch(target, BranchType::Local)?.into_reference();
        let target_name = target_ref
            .name()
            .ok_or_else(|| Error::Workspace(format!("invalid target branch {}", target)))?
            .to_string();
        let ours = target_ref.peel_to_commit()?;
        if repo.head()?.name() != Some(target_name.as_str()) {
            repo.checkout_tree(ours.as_object(), None)?;
            repo.set_head(&target_name)?;
        }

        let theirs = repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        let annotated = repo.find_annotated_commit(theirs.id())?;
        let (analysis, _) = repo.merge_analysis(&[&annotated])?;
        if analysis.is_up_to_date() {
            return Ok(MergeOutcome::UpToDate);
        }

        repo.merge(&[&annotated], None, None)?;

        let mut index = repo.index()?;
        if index.has_conflicts() {
            let mut files = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                if let Some(entry) = conflict
                    .our
                    .as_ref()
                    .or(conflict.their.as_ref())
                    .or(conflict.ancestor.as_ref())
                {
                    files.push(String::from_utf8_lossy(&entry.path).to_string());
                }
            }
            files.sort();
            files.dedup();
            repo.cleanup_state()?;
            repo.reset(ours.as_object(), ResetType::Hard, None)?;
            flog_warn!("Merge of {} aborted, {} conflicting file(s)", branch, files.len());
            return Ok(MergeOutcome::Conflicts(files));
        }

        let tree = repo.find_tree(index.write_tree()?)?;
        let sig = signature(&repo)?;
        let message = format!("Merge branch '{}' into {}", branch, target);
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&ours, &theirs])?;
        repo.cleanup_state()?;
        flog_debug!("Merge commit {} created", commit_id);
        Ok(MergeOutcome::Merged {
            commit: commit_id.to_string(),
        })
    }
}

fn prune_all() -> WorktreePruneOptions {
    let mut opts = WorktreePruneOptions::new();
    opts.valid(true).working_tree(true).locked(true);
    opts
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    Ok(repo
        .signature()
        .or_else(|_| Signature::now("fanout", "fanout@localhost"))?)
}

pub fn head_commit_at(path: &Path) -> Result<String> {
    let repo = Repository::open(path)?;
    let commit = repo.head()?.peel_to_commit()?;
    Ok(commit.id().to_string())
}

/// Any tracked modification or untracked (non-ignored) file in the tree.
pub fn has_changes(path: &Path) -> Result<bool> {
    let repo = Repository::open(path)?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).include_ignored(false);
    let dirty = !repo.statuses(Some(&mut opts))?.is_empty();
    Ok(dirty)
}

/// Hard-reset to `rev` and delete untracked files.
pub fn reset_clean(path: &Path, rev: &str) -> Result<()> {
    let repo = Repository::open(path)?;
    let target = repo.revparse_single(rev)?.peel_to_commit()?;
    repo.reset(target.as_object(), ResetType::Hard, None)?;

    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(false)
        .include_ignored(false);
    let untracked: Vec<PathBuf> = repo
        .statuses(Some(&mut opts))?
        .iter()
        .filter(|e| e.status().contains(Status::WT_NEW))
        .filter_map(|e| e.path().map(|p| path.join(p)))
        .collect();
    for file in untracked {
        if file.is_dir() {
            fs::remove_dir_all(&file)?;
        } else if file.exists() {
            fs::remove_file(&file)?;
        }
    }
    Ok(())
}

/// Stage everything and commit. Returns `None` when there was nothing to commit.
pub fn commit_all(path: &Path, message: &str) -> Result<Option<String>> {
    flog_debug!("commit_all path={} message={}", path.display(), message);
    let repo = Repository::open(path)?;
    let mut index = repo.index()?;
    index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["."].iter(), None)?;
    index.write()?;

    let tree = repo.find_tree(index.write_tree()?)?;
    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(e) if e.code() == ErrorCode::UnbornBranch => None,
        Err(e) => return Err(e.into()),
    };
    if let Some(ref p) = parent {
        if p.tree_id() == tree.id() {
            return Ok(None);
        }
    }

    let sig = signature(&repo)?;
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    flog_debug!("Commit created: {}", commit_id);
    Ok(Some(commit_id.to_string()))
}
