//! Task prompt rendering for the code-generation agent.
//!
//! The template marks each section as required or droppable. When the
//! rendered prompt exceeds the byte budget, droppable sections are removed
//! (plan summary first), then the last remaining section is truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{ExecutionPlan, Milestone, Task, TaskStatus};

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

const DROP_ORDER: [&str; 3] = ["plan", "milestone", "failure"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
});

#[derive(Debug, Clone, Serialize)]
struct MilestoneContext<'a> {
    id: &'a str,
    name: &'a str,
    description: Option<&'a str>,
}

/// Everything the task prompt can mention.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub task: &'a Task,
    pub milestone: Option<&'a Milestone>,
    /// Compact listing of the whole plan (see [`plan_summary`]).
    pub plan_summary: String,
    /// Error recorded by the previous failed attempt at this task.
    pub previous_failure: Option<String>,
}

/// Renders task prompts within a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("task", TASK_TEMPLATE)
            .expect("task template should be valid");
        Self { env, budget_bytes }
    }

    pub fn build(&self, input: &PromptInputs<'_>) -> Result<String> {
        let milestone = input.milestone.map(|m| MilestoneContext {
            id: &m.id,
            name: &m.name,
            description: m.description.as_deref(),
        });
        let rendered = self
            .env
            .get_template("task")?
            .render(context! {
                task => input.task,
                milestone => milestone,
                failure => input.previous_failure.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                plan => Some(input.plan_summary.trim()).filter(|s| !s.is_empty()),
            })
            .context("render task prompt")?;

        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

/// One line per task: checkbox, id, title, milestone.
pub fn plan_summary(plan: &ExecutionPlan) -> String {
    let mut lines = Vec::new();
    for milestone in &plan.milestones {
        lines.push(format!(
            "{} ({}/{}) {}",
            milestone.id, milestone.completed_count, milestone.total_count, milestone.name
        ));
        for task in &milestone.tasks {
            let mark = match task.status {
                TaskStatus::Completed => 'x',
                TaskStatus::Skipped => '~',
                TaskStatus::Running => '>',
                TaskStatus::Failed => '!',
                TaskStatus::Pending => ' ',
            };
            lines.push(format!("  [{mark}] {}: {}", task.id, task.title));
        }
    }
    lines.join("\n")
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (idx, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(total_len(rest));
    const MARKER: &str = "\n[truncated]";
    let keep = floor_char_boundary(&last.content, allowed.saturating_sub(MARKER.len()));
    debug!(section = %last.key, before = last.content.len(), after = keep, "truncated prompt section");
    last.content.truncate(keep);
    last.content.push_str(MARKER);
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0)
}
