//! Advisory file locks marking a live execution loop.
//!
//! A loop holds an exclusive lock on `.taskloop/locks/<execution-id>.lock`
//! for as long as it runs. The lock is released by the OS when the process
//! exits, so a crashed loop never leaves a stale claim behind, and a second
//! process can tell a live loop from a stale execution.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, warn};

use crate::io::store::ensure_record_id;

/// Exclusive lock held by a running loop; released on drop.
#[derive(Debug)]
pub struct LoopLock {
    file: File,
    path: PathBuf,
}

impl Drop for LoopLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "could not release loop lock");
        }
    }
}

fn lock_path(dir: &Path, execution_id: &str) -> Result<PathBuf> {
    ensure_record_id(execution_id)?;
    Ok(dir.join(format!("{execution_id}.lock")))
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind()
}

/// Take the loop lock for `execution_id`, or `None` if another holder has it.
pub fn try_acquire(dir: &Path, execution_id: &str) -> Result<Option<LoopLock>> {
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    let path = lock_path(dir, execution_id)?;
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            debug!(path = %path.display(), "acquired loop lock");
            Ok(Some(LoopLock { file, path }))
        }
        Err(err) if is_contended(&err) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("lock {}", path.display())),
    }
}

/// Whether some loop, in this or another process, holds the lock.
pub fn is_held(dir: &Path, execution_id: &str) -> Result<bool> {
    let path = lock_path(dir, execution_id)?;
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
    };
    match FileExt::try_lock_shared(&file) {
        Ok(()) => {
            FileExt::unlock(&file).with_context(|| format!("unlock {}", path.display()))?;
            Ok(false)
        }
        Err(err) if is_contended(&err) => Ok(true),
        Err(err) => Err(err).with_context(|| format!("probe {}", path.display())),
    }
}
