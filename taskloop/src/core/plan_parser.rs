//! Markdown plan parser.
//!
//! Two layers feed one [`ExecutionPlan`]:
//!
//! - the **index** document holds milestone headings and checkbox task lines
//!   (`## M1: Foundation`, `- [ ] 001: Set up project`). It decides plan
//!   membership, ordering, and task status.
//! - **detail** documents (one per milestone, any file name) hold
//!   `## <task-id>: <title>` sections with description, `Verification:` and
//!   `Depends:` fields.
//!
//! Parsing never fails: unknown or malformed lines are skipped.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{ExecutionPlan, Milestone, Task, TaskStatus};

/// Milestone id used for index task lines that precede any milestone heading.
pub const DEFAULT_MILESTONE_ID: &str = "default";

static INDEX_MILESTONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^##\s+(?:Milestone\s+)?([A-Za-z0-9][A-Za-z0-9._-]*)\s*(?::|-|–|—)\s*(.+?)\s*$",
    )
    .unwrap()
});

static INDEX_TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*[-*]\s+\[([ xX~!>])\]\s+(?:\*\*)?([A-Za-z0-9][A-Za-z0-9._-]*)(?:\*\*)?\s*(?::|-|–|—|\.)\s*(.+?)\s*$",
    )
    .unwrap()
});

static DETAIL_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#\s+(?:Milestone\s+)?([A-Za-z0-9][A-Za-z0-9._-]*)\s*(?::|-|–|—)\s*(.+?)\s*$")
        .unwrap()
});

static DETAIL_TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^##\s+(?:Task\s+)?(?:\*\*)?([A-Za-z0-9][A-Za-z0-9._-]*)(?:\*\*)?\s*(?::|-|–|—|\.)\s*(.+?)\s*$",
    )
    .unwrap()
});

static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:[-*]\s+)?(?:\*\*)?(verification|verify|depends\s+on|depends|dependencies)(?:\*\*)?\s*:(?:\*\*)?\s*(.*?)\s*$",
    )
    .unwrap()
});

static DEPENDENCY_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

/// Map a checkbox mark to a task status.
pub fn status_from_mark(mark: char) -> Option<TaskStatus> {
    match mark {
        ' ' => Some(TaskStatus::Pending),
        'x' | 'X' => Some(TaskStatus::Completed),
        '~' => Some(TaskStatus::Skipped),
        '!' => Some(TaskStatus::Failed),
        '>' => Some(TaskStatus::Running),
        _ => None,
    }
}

/// A checkbox task line recognized in the index document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTaskLine {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
}

/// Recognize a single index task line (`- [x] 001: Title`).
pub fn parse_index_task_line(line: &str) -> Option<IndexTaskLine> {
    let caps = INDEX_TASK_RE.captures(line)?;
    let mark = caps.get(1)?.as_str().chars().next()?;
    Some(IndexTaskLine {
        id: caps.get(2)?.as_str().to_string(),
        title: caps.get(3)?.as_str().to_string(),
        status: status_from_mark(mark)?,
    })
}

/// Parse the index document and merge in detail documents.
///
/// `details` is a list of `(file name, contents)` pairs, processed in the given
/// order. The first detail section seen for a task id wins.
pub fn parse_plan(index: &str, details: &[(String, String)]) -> ExecutionPlan {
    let mut milestones = parse_index(index);

    let docs: Vec<DetailDoc> = details
        .iter()
        .map(|(name, text)| parse_detail(name, text))
        .collect();

    let mut milestone_info: HashMap<&str, &DetailDoc> = HashMap::new();
    let mut task_info: HashMap<&str, &DetailTask> = HashMap::new();
    for doc in &docs {
        milestone_info.entry(doc.milestone_id.as_str()).or_insert(doc);
        for task in &doc.tasks {
            task_info.entry(task.id.as_str()).or_insert(task);
        }
    }

    for milestone in &mut milestones {
        if let Some(doc) = milestone_info.get(milestone.id.as_str()) {
            milestone.description = doc.description.clone();
            if milestone.name.is_empty()
                && let Some(name) = &doc.name
            {
                milestone.name = name.clone();
            }
        }
        for task in &mut milestone.tasks {
            if let Some(detail) = task_info.get(task.id.as_str()) {
                task.description = detail.description.clone();
                task.verification = detail.verification.clone();
                task.depends = detail.depends.clone();
            }
        }
    }

    ExecutionPlan::new(milestones)
}

fn parse_index(index: &str) -> Vec<Milestone> {
    let mut milestones: Vec<Milestone> = Vec::new();
    let mut current: Option<usize> = None;

    for line in index.lines() {
        if let Some(caps) = INDEX_MILESTONE_RE.captures(line) {
            let id = caps[1].to_string();
            let name = caps[2].to_string();
            current = Some(match milestones.iter().position(|m| m.id == id) {
                Some(pos) => pos,
                None => {
                    milestones.push(Milestone::new(id, name));
                    milestones.len() - 1
                }
            });
            continue;
        }

        let Some(parsed) = parse_index_task_line(line) else {
            continue;
        };
        let pos = match current {
            Some(pos) => pos,
            None => {
                milestones.push(Milestone::new(DEFAULT_MILESTONE_ID, ""));
                let pos = milestones.len() - 1;
                current = Some(pos);
                pos
            }
        };
        let milestone = &mut milestones[pos];
        milestone.tasks.push(Task {
            id: parsed.id,
            title: parsed.title,
            description: None,
            verification: None,
            status: parsed.status,
            milestone_id: milestone.id.clone(),
            depends: Vec::new(),
        });
    }

    milestones
}

#[derive(Debug, Default)]
struct DetailDoc {
    milestone_id: String,
    name: Option<String>,
    description: Option<String>,
    tasks: Vec<DetailTask>,
}

#[derive(Debug, Default)]
struct DetailTask {
    id: String,
    description: Option<String>,
    verification: Option<String>,
    depends: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Description,
    Verification,
    Depends,
}

#[derive(Default)]
struct TaskBuilder {
    id: String,
    description: Vec<String>,
    verification: Vec<String>,
    depends: Vec<String>,
}

impl TaskBuilder {
    fn push(&mut self, field: Field, text: &str) {
        match field {
            Field::Description => self.description.push(text.to_string()),
            Field::Verification => {
                if !text.trim().is_empty() {
                    self.verification.push(text.trim().to_string());
                }
            }
            Field::Depends => self.depends.extend(parse_dependency_list(text)),
        }
    }

    fn finish(self) -> DetailTask {
        let mut depends = Vec::new();
        for dep in self.depends {
            if !depends.contains(&dep) {
                depends.push(dep);
            }
        }
        DetailTask {
            id: self.id,
            description: join_block(&self.description),
            verification: join_block(&self.verification),
            depends,
        }
    }
}

fn parse_detail(file_name: &str, text: &str) -> DetailDoc {
    let mut doc = DetailDoc {
        milestone_id: file_stem(file_name),
        ..DetailDoc::default()
    };
    let mut preamble: Vec<String> = Vec::new();
    let mut current: Option<TaskBuilder> = None;
    let mut field = Field::Description;
    // Inline fields (`Verification: ...`) end at a blank line; sub-headings do not.
    let mut inline_field = false;
    let mut seen_title = false;

    for line in text.lines() {
        let trimmed = line.trim();

        if !seen_title && current.is_none() && trimmed.starts_with("# ") {
            seen_title = true;
            if let Some(caps) = DETAIL_TITLE_RE.captures(trimmed) {
                doc.milestone_id = caps[1].to_string();
                doc.name = Some(caps[2].to_string());
            } else {
                doc.name = Some(trimmed.trim_start_matches('#').trim().to_string());
            }
            continue;
        }

        if let Some(caps) = DETAIL_TASK_RE.captures(trimmed) {
            if let Some(task) = current.take() {
                doc.tasks.push(task.finish());
            }
            current = Some(TaskBuilder {
                id: caps[1].to_string(),
                ..TaskBuilder::default()
            });
            field = Field::Description;
            inline_field = false;
            continue;
        }

        let Some(task) = current.as_mut() else {
            preamble.push(line.to_string());
            continue;
        };

        if let Some(heading) = trimmed.strip_prefix("### ") {
            match subsection_field(heading) {
                Some(next) => {
                    field = next;
                    inline_field = false;
                }
                None => task.push(Field::Description, line),
            }
            continue;
        }

        if let Some(caps) = FIELD_RE.captures(line) {
            let name = caps[1].to_ascii_lowercase();
            field = if name.starts_with("verif") {
                Field::Verification
            } else {
                Field::Depends
            };
            inline_field = true;
            task.push(field, &caps[2]);
            continue;
        }

        if trimmed.is_empty() && inline_field {
            field = Field::Description;
            inline_field = false;
        }

        task.push(field, line);
    }

    if let Some(task) = current.take() {
        doc.tasks.push(task.finish());
    }
    doc.description = join_block(&preamble);
    doc
}

fn subsection_field(heading: &str) -> Option<Field> {
    let lower = heading.trim().trim_end_matches(':').to_ascii_lowercase();
    match lower.as_str() {
        "description" | "details" | "context" => Some(Field::Description),
        "verification" | "verify" | "acceptance" | "acceptance criteria" => {
            Some(Field::Verification)
        }
        "depends" | "depends on" | "dependencies" => Some(Field::Depends),
        _ => None,
    }
}

fn parse_dependency_list(text: &str) -> Vec<String> {
    text.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(|token| {
            token
                .trim()
                .trim_start_matches(['-', '*', '#'])
                .trim_matches(['`', '"', '\'', '(', ')', '[', ']', '.'])
        })
        .filter(|token| !token.is_empty())
        .filter(|token| {
            let lower = token.to_ascii_lowercase();
            lower != "none" && lower != "n/a" && lower != "and"
        })
        .filter(|token| DEPENDENCY_ID_RE.is_match(token))
        .map(str::to_string)
        .collect()
}

fn join_block(lines: &[String]) -> Option<String> {
    let kept: Vec<&str> = lines.iter().map(|l| l.trim_end()).collect();
    let joined = kept.join("\n");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn file_stem(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string())
}
