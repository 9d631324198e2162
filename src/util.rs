//! Shared utility functions.

use std::sync::OnceLock;

use regex::Regex;
use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Maximum characters kept in an output tail.
pub const TAIL_MAX_CHARS: usize = 6000;

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b\[[0-9;?]*[ -/]*[@-~]")
            .expect("static regex")
    })
}

pub fn strip_ansi(value: &str) -> String {
    ansi_re().replace_all(value, "").into_owned()
}

/// Pull the `message` field out of a JSONL log line, or return the line as-is.
fn jsonl_message(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(trimmed) {
            if let Some(serde_json::Value::String(msg)) = map.get("message") {
                return msg.clone();
            }
        }
    }
    line.to_string()
}

/// Human-readable tail of agent output: ANSI stripped, JSONL unwrapped,
/// last `max_lines` non-empty lines, at most `TAIL_MAX_CHARS` characters.
pub fn output_tail(output: &str, max_lines: usize) -> Option<String> {
    let cleaned = strip_ansi(output);
    let lines: Vec<String> = cleaned
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(jsonl_message)
        .collect();
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(max_lines);
    let text = lines[start..].join("\n");
    let count = text.chars().count();
    if count > TAIL_MAX_CHARS {
        Some(text.chars().skip(count - TAIL_MAX_CHARS).collect())
    } else {
        Some(text)
    }
}
