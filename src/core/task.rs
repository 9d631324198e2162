//! Caller-supplied work items.

use serde::{Deserialize, Serialize};

/// A pending work item. Immutable once handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// The item as it appears in the tracking document.
    pub text: String,
    /// Already checked off in the tracking document.
    #[serde(default)]
    pub done: bool,
    /// Detailed instruction; falls back to `text`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl Task {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            done: false,
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = Some(prompt.to_string());
        self
    }

    pub fn prompt(&self) -> &str {
        self.prompt.as_deref().unwrap_or(&self.text)
    }
}
