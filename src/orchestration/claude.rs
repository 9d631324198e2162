//! Runners backed by external CLI tools.
//!
//! `ClaudeRunner` drives Claude Code in headless mode (`-p` with JSON
//! output). `CommandRunner` runs any other CLI with the prompt appended as the
//! final argument and judges success by exit status.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::{Backend, Config};
use crate::error::{Error, Result};
use crate::{flog_debug, flog_trace};

use super::runner::{detect_quota_exhausted, AgentRunner, AttemptResult};

#[derive(Debug, Deserialize)]
struct RawClaudeResponse {
    subtype: Option<String>,
    result: Option<String>,
    total_cost_usd: Option<f64>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClaudeRunner {
    binary: PathBuf,
    timeout: Duration,
}

impl ClaudeRunner {
    /// Locate `claude` on `PATH`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let binary = which::which("claude")
            .map_err(|_| Error::AgentBinaryNotFound("claude".to_string()))?;
        Ok(Self { binary, timeout })
    }

    pub fn with_binary(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Interpret `--output-format json` output. Falls back to treating
    /// non-JSON stdout as plain text.
    pub fn parse_output(stdout: &str, stderr: &str, exit_ok: bool) -> AttemptResult {
        if let Ok(raw) = serde_json::from_str::<RawClaudeResponse>(stdout.trim()) {
            let text = raw.result.clone().unwrap_or_default();
            let failed = raw.is_error
                || raw.error.is_some()
                || matches!(raw.subtype.as_deref(), Some(s) if s != "success");
            return if failed {
                let message = raw
                    .error
                    .or(raw.result)
                    .or(raw.subtype)
                    .unwrap_or_else(|| "Claude reported an error".to_string());
                AttemptResult::failed(text, message).with_cost(raw.total_cost_usd)
            } else {
                AttemptResult::succeeded(text).with_cost(raw.total_cost_usd)
            };
        }

        let combined = join_output(stdout, stderr);
        if exit_ok {
            AttemptResult::succeeded(combined)
        } else {
            let message = if stderr.trim().is_empty() {
                "Claude exited with a non-zero status".to_string()
            } else {
                stderr.trim().to_string()
            };
            AttemptResult::failed(combined, message)
        }
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    fn name(&self) -> &str {
        "claude"
    }

    async fn dispatch(&self, prompt: &str, workspace: &Path) -> Result<AttemptResult> {
        flog_debug!(
            "ClaudeRunner::dispatch cwd={} prompt_len={}",
            workspace.display(),
            prompt.len()
        );
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .arg("-p")
                .arg(prompt)
                .arg("--output-format")
                .arg("json")
                .arg("--dangerously-skip-permissions")
                .current_dir(workspace)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        flog_trace!("claude stdout: {}", stdout);

        if let Some(line) = detect_quota_exhausted(&join_output(&stdout, &stderr)) {
            return Err(Error::QuotaExhausted(line));
        }
        Ok(Self::parse_output(&stdout, &stderr, output.status.success()))
    }
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRunner {
    /// `command_line` is split on whitespace; the prompt becomes the last argument.
    pub fn new(command_line: &str, timeout: Duration) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(String::from);
        let program = parts
            .next()
            .ok_or_else(|| Error::Dispatch("empty command for command backend".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }
}

#[async_trait]
impl AgentRunner for CommandRunner {
    fn name(&self) -> &str {
        &self.program
    }

    async fn dispatch(&self, prompt: &str, workspace: &Path) -> Result<AttemptResult> {
        flog_debug!(
            "CommandRunner::dispatch program={} cwd={}",
            self.program,
            workspace.display()
        );
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program)
                .args(&self.args)
                .arg(prompt)
                .current_dir(workspace)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::AgentBinaryNotFound(self.program.clone()),
            _ => Error::Io(e),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = join_output(&stdout, &stderr);
        flog_trace!("{} output: {}", self.program, combined);

        if let Some(line) = detect_quota_exhausted(&combined) {
            return Err(Error::QuotaExhausted(line));
        }
        if output.status.success() {
            Ok(AttemptResult::succeeded(combined))
        } else {
            let code = output.status.code().unwrap_or(-1);
            Ok(AttemptResult::failed(
                combined,
                format!("{} exited with status {}", self.program, code),
            ))
        }
    }
}

fn join_output(stdout: &str, stderr: &str) -> String {
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (false, false) => format!("{}\n{}", stdout.trim_end(), stderr.trim_end()),
        (false, true) => stdout.trim_end().to_string(),
        (true, _) => stderr.trim_end().to_string(),
    }
}

/// Build the runner named by `config.backend`.
pub fn runner_from_config(config: &Config) -> Result<Arc<dyn AgentRunner>> {
    let timeout = config.attempt_timeout();
    match config.backend {
        Backend::Claude => Ok(Arc::new(ClaudeRunner::new(timeout)?)),
        Backend::Command => {
            let line = config.command.as_deref().ok_or_else(|| {
                Error::Dispatch("backend = \"command\" requires a `command` setting".to_string())
            })?;
            Ok(Arc::new(CommandRunner::new(line, timeout)?))
        }
    }
}
