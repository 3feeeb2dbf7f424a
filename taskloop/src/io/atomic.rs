//! Temp-write-then-rename file replacement.
//!
//! Contents are written to a uniquely named sibling temp file, flushed, and
//! renamed over the target. The rename is the only observable commit point:
//! an interrupted write leaves at most an orphaned temp file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

/// Contents written to a temp file next to `target`, not yet visible there.
#[derive(Debug)]
pub struct StagedFile {
    temp: NamedTempFile,
    target: PathBuf,
}

impl StagedFile {
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Rename the temp file over the target.
    pub fn commit(self) -> Result<()> {
        let target = self.target;
        self.temp
            .persist(&target)
            .map_err(|err| err.error)
            .with_context(|| format!("rename into {}", target.display()))?;
        Ok(())
    }
}

/// Write `contents` to a temp sibling of `target` (creating parent dirs).
pub fn stage(target: &Path, contents: &[u8]) -> Result<StagedFile> {
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let prefix = format!(
        ".{}.",
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let mut temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    temp.write_all(contents)
        .with_context(|| format!("write temp file {}", temp.path().display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("sync temp file {}", temp.path().display()))?;

    Ok(StagedFile {
        temp,
        target: target.to_path_buf(),
    })
}

/// Atomically replace `target` with `contents`.
pub fn write_atomic(target: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    stage(target, contents.as_ref())?.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_returns_exact_bytes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("nested/dir/file.txt");
        let contents = "line one\r\nline two\n\u{1F600}";
        write_atomic(&target, contents).expect("write");
        assert_eq!(fs::read_to_string(&target).expect("read"), contents);
    }

    #[test]
    fn replaces_existing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("file.txt");
        fs::write(&target, "old").expect("seed");
        write_atomic(&target, "new").expect("write");
        assert_eq!(fs::read_to_string(&target).expect("read"), "new");
    }

    /// A crash between temp write and rename must leave the target untouched.
    ///
    /// `mem::forget` skips the temp file cleanup, like a process dying would.
    #[test]
    fn crash_before_rename_leaves_target_unchanged() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("file.txt");
        fs::write(&target, "original").expect("seed");

        let staged = stage(&target, b"half-done").expect("stage");
        let orphan = staged.temp_path().to_path_buf();
        std::mem::forget(staged);

        assert_eq!(fs::read_to_string(&target).expect("read"), "original");
        assert!(orphan.exists());
        assert_ne!(orphan, target);
    }

    #[test]
    fn dropped_stage_cleans_up_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("file.txt");
        let staged = stage(&target, b"discarded").expect("stage");
        let temp_path = staged.temp_path().to_path_buf();
        drop(staged);
        assert!(!temp_path.exists());
        assert!(!target.exists());
    }
}
