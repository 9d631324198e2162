//! Phased execution plans.
//!
//! A plan is produced by the planning collaborator and only validated here:
//! the engine never decides how tasks are grouped. Plans arrive either as
//! typed values from a caller or as free-form collaborator output that
//! contains a JSON object somewhere in it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::error::{Error, Result};

/// A themed group of tasks given to one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAssignment {
    #[serde(alias = "agent_id")]
    pub id: u32,
    #[serde(default)]
    pub theme: String,
    pub task_indices: Vec<usize>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default, alias = "agent_prompt")]
    pub detailed_prompt: String,
}

/// An ordered stage of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    #[serde(alias = "phase_id")]
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "parallel")]
    pub is_parallel: bool,
    #[serde(alias = "agents")]
    pub assignments: Vec<AgentAssignment>,
}

impl Phase {
    /// Parallel phases with more than one assignment get one workspace per
    /// assignment; everything else shares a single workspace.
    pub fn runs_concurrently(&self) -> bool {
        self.is_parallel && self.assignments.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionPlan {
    #[serde(default)]
    pub summary: String,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Task indices that break the one-assignment-per-task partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanCoverage {
    pub unassigned: Vec<usize>,
    pub duplicated: Vec<usize>,
}

impl PlanCoverage {
    pub fn is_partition(&self) -> bool {
        self.unassigned.is_empty() && self.duplicated.is_empty()
    }
}

impl ExecutionPlan {
    pub fn assignment_count(&self) -> usize {
        self.phases.iter().map(|p| p.assignments.len()).sum()
    }

    /// Shape check run before a plan is accepted.
    pub fn validate(&self, task_count: usize) -> Result<()> {
        if self.phases.is_empty() {
            return Err(Error::InvalidPlan("plan has no phases".to_string()));
        }

        let mut previous: Option<u32> = None;
        for phase in &self.phases {
            if let Some(prev) = previous {
                if phase.id <= prev {
                    return Err(Error::InvalidPlan(format!(
                        "phase ids must increase: {} follows {}",
                        phase.id, prev
                    )));
                }
            }
            previous = Some(phase.id);

            if phase.assignments.is_empty() {
                return Err(Error::InvalidPlan(format!(
                    "phase {} ({}) has no assignments",
                    phase.id, phase.name
                )));
            }

            let mut ids = HashSet::new();
            for assignment in &phase.assignments {
                if !ids.insert(assignment.id) {
                    return Err(Error::InvalidPlan(format!(
                        "phase {} has more than one assignment with id {}",
                        phase.id, assignment.id
                    )));
                }
                if assignment.task_indices.is_empty() {
                    return Err(Error::InvalidPlan(format!(
                        "assignment {} in phase {} has no tasks",
                        assignment.id, phase.id
                    )));
                }
                if let Some(bad) = assignment
                    .task_indices
                    .iter()
                    .find(|&&idx| idx >= task_count)
                {
                    return Err(Error::InvalidPlan(format!(
                        "assignment {} references task {} but only {} task(s) exist",
                        assignment.id, bad, task_count
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn coverage(&self, task_count: usize) -> PlanCoverage {
        let mut seen: BTreeMap<usize, usize> = BTreeMap::new();
        for phase in &self.phases {
            for assignment in &phase.assignments {
                for &idx in &assignment.task_indices {
                    *seen.entry(idx).or_default() += 1;
                }
            }
        }
        PlanCoverage {
            unassigned: (0..task_count).filter(|i| !seen.contains_key(i)).collect(),
            duplicated: seen
                .iter()
                .filter(|(_, &count)| count > 1)
                .map(|(&idx, _)| idx)
                .collect(),
        }
    }

    /// Validate and fold partition problems into `warnings`.
    pub fn accept(mut self, task_count: usize) -> Result<Self> {
        self.validate(task_count)?;
        let coverage = self.coverage(task_count);
        if !coverage.unassigned.is_empty() {
            self.warnings.push(format!(
                "Tasks not assigned to any agent: {:?}",
                coverage.unassigned
            ));
        }
        if !coverage.duplicated.is_empty() {
            self.warnings.push(format!(
                "Tasks assigned more than once (first assignment wins): {:?}",
                coverage.duplicated
            ));
        }
        Ok(self)
    }

    /// Parse collaborator output that embeds a plan object somewhere in text.
    pub fn from_output(output: &str) -> Result<Self> {
        let value = extract_json(output)?;
        Ok(Self::from_value(&value))
    }

    /// Lenient conversion: missing fields default, non-numeric ids fall back
    /// to their position.
    pub fn from_value(value: &Value) -> Self {
        let phases = array(value, &["phases"])
            .iter()
            .enumerate()
            .map(|(pos, phase)| {
                let mut assignments: Vec<AgentAssignment> = array(phase, &["assignments", "agents"])
                    .iter()
                    .enumerate()
                    .map(|(apos, a)| AgentAssignment {
                        id: numeric_id(a, &["id", "agent_id"], apos),
                        theme: string(a, &["theme"]),
                        task_indices: array(a, &["task_indices"])
                            .iter()
                            .filter_map(|v| v.as_u64().map(|n| n as usize))
                            .collect(),
                        rationale: string(a, &["rationale"]),
                        detailed_prompt: string(a, &["detailed_prompt", "agent_prompt"]),
                    })
                    .collect();
                dedupe_ids(&mut assignments);
                Phase {
                    id: numeric_id(phase, &["id", "phase_id"], pos),
                    name: string(phase, &["name"]),
                    description: string(phase, &["description"]),
                    is_parallel: field(phase, &["is_parallel", "parallel"])
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    assignments,
                }
            })
            .collect();

        Self {
            summary: string(value, &["summary"]),
            phases,
            success_criteria: strings(value, &["success_criteria"]),
            warnings: strings(value, &["warnings"]),
        }
    }
}

fn field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| value.get(*k))
}

fn array<'a>(value: &'a Value, keys: &[&str]) -> &'a [Value] {
    field(value, keys)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn string(value: &Value, keys: &[&str]) -> String {
    field(value, keys)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn strings(value: &Value, keys: &[&str]) -> Vec<String> {
    array(value, keys)
        .iter()
        .filter_map(|v| v.as_str().map(String::from))
        .collect()
}

fn numeric_id(value: &Value, keys: &[&str], position: usize) -> u32 {
    match field(value, keys) {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(position as u32),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(position as u32),
        _ => position as u32,
    }
}

/// Coerced ids can collide with explicit ones. Later duplicates move past
/// the largest id in the phase.
fn dedupe_ids(assignments: &mut [AgentAssignment]) {
    let mut next = assignments.iter().map(|a| a.id).max().unwrap_or(0);
    let mut seen = HashSet::new();
    for assignment in assignments.iter_mut() {
        if !seen.insert(assignment.id) {
            next = next.saturating_add(1);
            assignment.id = next;
            seen.insert(next);
        }
    }
}

/// Find the first JSON object in mixed text output.
///
/// Fenced ```json blocks win; otherwise the first `{` is scanned with brace
/// counting that ignores braces inside string literals.
pub fn extract_json(output: &str) -> Result<Value> {
    if let Some(block) = fenced_json(output) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            return Ok(value);
        }
    }

    let start = output
        .find('{')
        .ok_or_else(|| Error::InvalidPlan("no JSON object found in output".to_string()))?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in output[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Ok(serde_json::from_str(&output[start..end])?);
                }
            }
            _ => {}
        }
    }
    Err(Error::InvalidPlan(
        "no complete JSON object found in output".to_string(),
    ))
}

fn fenced_json(output: &str) -> Option<&str> {
    let open = output.find("```")?;
    let after = &output[open + 3..];
    let body_start = after.find('\n')? + 1;
    let lang = after[..body_start].trim();
    if !lang.is_empty() && lang != "json" {
        return None;
    }
    let body = &after[body_start..];
    let close = body.find("```")?;
    let block = body[..close].trim();
    block.starts_with('{').then_some(block)
}
