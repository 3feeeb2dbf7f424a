//! `.taskloop/` scaffolding and canonical paths.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::io::atomic::write_atomic;
use crate::io::config::{OrchestratorConfig, write_config};

const STATE_GITIGNORE: &str = "# taskloop runtime state; never committed or rolled back\n*\n";

const INDEX_PLACEHOLDER: &str = "# Tasks\n\n## M1: First milestone\n- [ ] 001: Describe the first task\n";

const DETAIL_PLACEHOLDER: &str = "# M1: First milestone\n\nWhat this milestone delivers.\n\n## 001: Describe the first task\n\nWhat to build.\n\nVerification: how to check it\nDepends: none\n";

/// Canonical paths within `.taskloop/` for a project root.
#[derive(Debug, Clone)]
pub struct TaskloopPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub events_dir: PathBuf,
    pub locks_dir: PathBuf,
}

impl TaskloopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".taskloop");
        Self {
            gitignore_path: state_dir.join(".gitignore"),
            config_path: state_dir.join("config.toml"),
            events_dir: state_dir.join("events"),
            locks_dir: state_dir.join("locks"),
            state_dir,
            root,
        }
    }

    pub fn index_path(&self, config: &OrchestratorConfig) -> PathBuf {
        self.root.join(&config.plan.index_path)
    }

    pub fn details_dir(&self, config: &OrchestratorConfig) -> PathBuf {
        self.root.join(&config.plan.details_dir)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite taskloop-owned files. Plan documents are never overwritten.
    pub force: bool,
}

/// Make sure `.taskloop/` exists and is ignored by git, without touching config.
///
/// Execution state must never be captured by a snapshot or removed by a rollback.
pub fn ensure_state_dir(paths: &TaskloopPaths) -> Result<()> {
    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create directory {}", paths.state_dir.display()))?;
    if !paths.gitignore_path.exists() {
        write_atomic(&paths.gitignore_path, STATE_GITIGNORE)?;
    }
    Ok(())
}

/// Create `.taskloop/` (config, gitignore) and placeholder plan documents.
///
/// Fails if `.taskloop/` already exists unless `options.force` is set.
pub fn init_taskloop(root: &Path, options: &InitOptions) -> Result<TaskloopPaths> {
    let paths = TaskloopPaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!("init: .taskloop exists but is not a directory"));
    }
    if paths.state_dir.exists() && !options.force {
        return Err(anyhow!(
            "init: .taskloop already exists (use --force to overwrite)"
        ));
    }

    fs::create_dir_all(&paths.events_dir)
        .with_context(|| format!("create directory {}", paths.events_dir.display()))?;
    write_atomic(&paths.gitignore_path, STATE_GITIGNORE)?;
    let config = OrchestratorConfig::default();
    write_config(&paths.config_path, &config)?;

    let index_path = paths.index_path(&config);
    if !index_path.exists() {
        write_atomic(&index_path, INDEX_PLACEHOLDER)?;
    }
    let detail_path = paths.details_dir(&config).join("M1.md");
    if !paths.details_dir(&config).exists() {
        write_atomic(&detail_path, DETAIL_PLACEHOLDER)?;
    }

    info!(root = %root.display(), "initialized taskloop");
    Ok(paths)
}
