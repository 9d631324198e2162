use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{flog_debug, Error, Result};

pub const DEFAULT_MAX_CONCURRENCY: usize = 3;
pub const MAX_CONCURRENCY_LIMIT: usize = 8;
pub const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_WORKTREE_DIR: &str = ".fanout-worktrees";
pub const DEFAULT_TRACKING_DOCUMENT: &str = ".claude/planning/ROADMAP.md";
pub const DEFAULT_RETENTION_SECS: u64 = 3600;
pub const DEFAULT_OUTPUT_TAIL_LINES: usize = 80;

/// Which CLI tool backs agent attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Claude,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub max_concurrency: Option<usize>,
    pub attempt_timeout_secs: Option<u64>,
    #[serde(default)]
    pub backend: Backend,
    /// Command line for the `command` backend. The prompt is appended as the last argument.
    pub command: Option<String>,
    /// Workspace root; relative paths resolve against the project root.
    pub worktree_dir: Option<String>,
    pub tracking_document: Option<String>,
    pub retention_secs: Option<u64>,
    pub output_tail_lines: Option<usize>,
}

impl Config {
    pub fn fanout_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".fanout"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::fanout_dir()?.join("fanout.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        flog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            flog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        flog_debug!(
            "Config loaded: backend={:?}, max_concurrency={:?}, worktree_dir={:?}",
            config.backend,
            config.max_concurrency,
            config.worktree_dir
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::fanout_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        flog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn effective_max_concurrency(&self) -> usize {
        clamp_concurrency(self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(
            self.attempt_timeout_secs
                .unwrap_or(DEFAULT_ATTEMPT_TIMEOUT_SECS),
        )
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs.unwrap_or(DEFAULT_RETENTION_SECS))
    }

    pub fn output_tail_lines(&self) -> usize {
        self.output_tail_lines.unwrap_or(DEFAULT_OUTPUT_TAIL_LINES)
    }

    pub fn tracking_document(&self) -> &str {
        self.tracking_document
            .as_deref()
            .unwrap_or(DEFAULT_TRACKING_DOCUMENT)
    }

    /// Resolve the workspace root for a project.
    pub fn worktree_root(&self, project_root: &Path) -> PathBuf {
        match self.worktree_dir.as_deref() {
            Some(dir) => {
                let expanded = expand_tilde(dir);
                if expanded.is_absolute() {
                    expanded
                } else {
                    project_root.join(expanded)
                }
            }
            None => project_root.join(DEFAULT_WORKTREE_DIR),
        }
    }
}

/// Clamp a requested concurrency into the supported 1..=8 range.
pub fn clamp_concurrency(requested: usize) -> usize {
    requested.clamp(1, MAX_CONCURRENCY_LIMIT)
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
