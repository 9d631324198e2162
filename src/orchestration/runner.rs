//! Capability interface for the CLI tools that carry out agent attempts.

use std::path::Path;

use async_trait::async_trait;

use crate::Result;

/// Outcome of one attempt that ran to completion.
///
/// Ordinary agent failures come back as `success == false`. Timeouts, a
/// missing binary and usage-limit exhaustion come back as `Err` so the retry
/// loop can tell them apart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub cost_usd: Option<f64>,
}

impl AttemptResult {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failed(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(error.into()),
            cost_usd: None,
        }
    }

    pub fn with_cost(mut self, cost: Option<f64>) -> Self {
        self.cost_usd = cost;
        self
    }
}

/// One implementation per backing tool, selected by configuration.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Run `prompt` with `workspace` as the working directory.
    async fn dispatch(&self, prompt: &str, workspace: &Path) -> Result<AttemptResult>;
}

const QUOTA_PHRASES: &[&str] = &[
    "you've exceeded your usage limit",
    "you have exceeded your usage limit",
    "please wait until your limit resets",
    "your claude.ai usage limit",
];

const ERROR_MARKERS: &[&str] = &["error", "failed", "exceeded", "reached"];

/// Usage-limit exhaustion reported by the tool. A phrase only counts when the
/// same line also reads like an error, so agent prose quoting it is ignored.
pub fn detect_quota_exhausted(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let lower = line.to_lowercase();
        let phrase = QUOTA_PHRASES.iter().any(|p| lower.contains(p));
        let marker = ERROR_MARKERS.iter().any(|m| lower.contains(m));
        (phrase && marker).then(|| line.trim().to_string())
    })
}
