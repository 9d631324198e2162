//! Checkbox marking in the project's tracking document.

use std::fs;
use std::path::Path;

use crate::{flog_debug, Result};

/// Mark `- [ ] <text>` items whose text matches one of `texts` as done.
/// Returns the rewritten document and how many items changed.
pub fn mark_items(content: &str, texts: &[&str]) -> (String, usize) {
    let wanted: Vec<&str> = texts.iter().map(|t| t.trim()).collect();
    let mut marked = 0;
    let mut out = String::with_capacity(content.len());
    for line in content.split_inclusive('\n') {
        let body = line.trim_end_matches(['\n', '\r']);
        let ending = &line[body.len()..];
        let indent_len = body.len() - body.trim_start().len();
        let (indent, rest) = body.split_at(indent_len);

        let item = ["- [ ] ", "* [ ] "]
            .iter()
            .find_map(|prefix| rest.strip_prefix(prefix).map(|t| (&prefix[..1], t)));
        match item {
            Some((bullet, text)) if wanted.contains(&text.trim()) => {
                out.push_str(indent);
                out.push_str(bullet);
                out.push_str(" [x] ");
                out.push_str(text);
                out.push_str(ending);
                marked += 1;
            }
            _ => out.push_str(line),
        }
    }
    (out, marked)
}

/// Rewrite the tracking document at `path` in place. A missing document marks
/// nothing.
pub fn mark_complete(path: &Path, texts: &[&str]) -> Result<usize> {
    if texts.is_empty() || !path.exists() {
        flog_debug!("mark_complete: nothing to do for {}", path.display());
        return Ok(0);
    }
    let content = fs::read_to_string(path)?;
    let (updated, marked) = mark_items(&content, texts);
    if marked > 0 {
        fs::write(path, updated)?;
    }
    flog_debug!("mark_complete: {} item(s) in {}", marked, path.display());
    Ok(marked)
}
