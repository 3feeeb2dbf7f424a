//! Structured agent output: extraction, shape check, semantic validation.
//!
//! Parsing and validation are separate steps. [`parse_task_output`] only
//! answers "is there a well-shaped result in this text"; [`validate_output`]
//! decides whether that result is safe to apply.

use std::collections::HashSet;
use std::sync::LazyLock;

use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::path::validate_path;

const OUTPUT_SCHEMA: &str = include_str!("schemas/task_output.schema.json");

static OUTPUT_SCHEMA_VALUE: LazyLock<Value> = LazyLock::new(|| {
    serde_json::from_str(OUTPUT_SCHEMA).expect("embedded output schema must be valid JSON")
});

/// A single file change requested by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl FileChange {
    pub fn kind(&self) -> Option<FileAction> {
        FileAction::parse(&self.action)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Create,
    Update,
    Delete,
}

impl FileAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "create" => Some(FileAction::Create),
            "update" => Some(FileAction::Update),
            "delete" => Some(FileAction::Delete),
            _ => None,
        }
    }
}

/// Result the agent reports for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(rename = "taskId", alias = "task_id")]
    pub task_id: String,
    pub files: Vec<FileChange>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputParseError {
    #[error("agent output is empty")]
    Empty,

    #[error("agent output contains no JSON object")]
    NoJson,

    #[error("agent output failed schema validation: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("agent output could not be decoded: {0}")]
    Decode(String),
}

/// Extract and decode a [`TaskOutput`] from free-form agent text.
///
/// Candidates, in order: the whole trimmed text, fenced code blocks (`json`
/// tagged first), then the outermost `{...}` span. The first candidate that
/// is a schema-valid object wins.
pub fn parse_task_output(raw: &str) -> Result<TaskOutput, OutputParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(OutputParseError::Empty);
    }

    let mut first_schema_failure = None;
    for candidate in candidates(trimmed) {
        let Ok(value) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        if !value.is_object() {
            continue;
        }
        let schema_errors = schema_errors(&value);
        if !schema_errors.is_empty() {
            first_schema_failure.get_or_insert(schema_errors);
            continue;
        }
        return serde_json::from_value(value)
            .map_err(|err| OutputParseError::Decode(err.to_string()));
    }

    match first_schema_failure {
        Some(errors) => Err(OutputParseError::Schema(errors)),
        None => Err(OutputParseError::NoJson),
    }
}

fn candidates(text: &str) -> Vec<&str> {
    let mut out = vec![text];

    let blocks = fenced_blocks(text);
    out.extend(
        blocks
            .iter()
            .filter(|(tag, _)| tag.eq_ignore_ascii_case("json"))
            .map(|(_, body)| *body),
    );
    out.extend(
        blocks
            .iter()
            .filter(|(tag, _)| !tag.eq_ignore_ascii_case("json"))
            .map(|(_, body)| *body),
    );

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            out.push(&text[start..=end]);
        }
    }
    out
}

/// `(info-string, body)` for each closed fenced code block.
fn fenced_blocks(text: &str) -> Vec<(&str, &str)> {
    let mut blocks = Vec::new();
    let mut open: Option<(&str, usize)> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix("```") else {
            continue;
        };
        match open {
            None => open = Some((rest.trim(), offset)),
            Some((tag, body_start)) => {
                blocks.push((tag, text[body_start..line_start].trim()));
                open = None;
            }
        }
    }
    blocks
}

fn schema_errors(value: &Value) -> Vec<String> {
    match validator_for(&OUTPUT_SCHEMA_VALUE) {
        Ok(validator) => validator
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect(),
        Err(err) => vec![format!("invalid output schema: {err}")],
    }
}

/// Outcome of semantic validation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct OutputValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Check every file entry: safe path, known action, content for create/update,
/// no path touched twice.
pub fn validate_output(output: &TaskOutput) -> OutputValidation {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (index, file) in output.files.iter().enumerate() {
        let label = format!("files[{index}]");
        for err in validate_path(&file.path) {
            errors.push(format!("{label}: {err}"));
        }
        match file.kind() {
            None => errors.push(format!(
                "{label}: unsupported action '{}' (expected create, update or delete)",
                file.action
            )),
            Some(FileAction::Create | FileAction::Update) => {
                if file.content.as_deref().is_none_or(str::is_empty) {
                    errors.push(format!(
                        "{label}: content is required for action '{}'",
                        file.action
                    ));
                }
            }
            Some(FileAction::Delete) => {}
        }
        if !seen.insert(normalized(&file.path)) {
            errors.push(format!("{label}: duplicate path {}", file.path));
        }
    }

    OutputValidation {
        valid: errors.is_empty(),
        errors,
    }
}

/// [`validate_output`] plus a check that the output answers `task_id`.
pub fn validate_output_for_task(output: &TaskOutput, task_id: &str) -> OutputValidation {
    let mut validation = validate_output(output);
    if output.task_id.trim() != task_id {
        validation.errors.push(format!(
            "taskId '{}' does not match task '{task_id}'",
            output.task_id
        ));
        validation.valid = false;
    }
    validation
}

fn normalized(path: &str) -> String {
    let unified = path.replace('\\', "/");
    unified
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}
