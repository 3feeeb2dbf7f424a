//! Plan document access.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};

use crate::io::atomic::write_atomic;

/// Read/write access to plan documents. `None` means not found.
pub trait DocumentStore: Send + Sync {
    fn read_document(&self, path: &Path) -> Result<Option<String>>;

    fn write_document_atomic(&self, path: &Path, contents: &str) -> Result<()>;

    /// File names (not paths) directly inside `dir`, sorted.
    fn list_documents(&self, dir: &Path) -> Result<Option<Vec<String>>>;
}

/// [`DocumentStore`] over the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsDocumentStore;

impl DocumentStore for FsDocumentStore {
    fn read_document(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }

    fn write_document_atomic(&self, path: &Path, contents: &str) -> Result<()> {
        write_atomic(path, contents)
    }

    fn list_documents(&self, dir: &Path) -> Result<Option<Vec<String>>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("list {}", dir.display())),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("list {}", dir.display()))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(Some(names))
    }
}
