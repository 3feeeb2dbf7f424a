//! Applies validated agent output to the project tree.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::output::{FileAction, FileChange, TaskOutput};
use crate::core::path::validate_path;
use crate::io::atomic::write_atomic;

/// Outcome for one file entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileWriteResult {
    pub path: String,
    pub action: String,
    pub error: Option<String>,
}

/// Write every file entry under `root`.
///
/// Entries are applied independently: one failure does not stop or undo the
/// others. Callers decide what a partial failure means.
#[instrument(skip_all, fields(task_id = %output.task_id, files = output.files.len()))]
pub fn write_output(output: &TaskOutput, root: &Path) -> Vec<FileWriteResult> {
    output
        .files
        .iter()
        .map(|file| {
            let error = apply(file, root).err().map(|err| format!("{err:#}"));
            if let Some(err) = &error {
                warn!(path = %file.path, err = %err, "file write failed");
            } else {
                debug!(path = %file.path, action = %file.action, "file written");
            }
            FileWriteResult {
                path: file.path.clone(),
                action: file.action.clone(),
                error,
            }
        })
        .collect()
}

fn apply(file: &FileChange, root: &Path) -> Result<()> {
    let problems = validate_path(&file.path);
    if !problems.is_empty() {
        return Err(anyhow!(problems.join("; ")));
    }
    let target = root.join(&file.path);
    match file.kind() {
        Some(FileAction::Create | FileAction::Update) => {
            let content = file
                .content
                .as_deref()
                .ok_or_else(|| anyhow!("missing content for {}", file.path))?;
            write_atomic(&target, content)
        }
        Some(FileAction::Delete) => match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("delete {}", target.display())),
        },
        None => Err(anyhow!("unsupported action '{}'", file.action)),
    }
}
