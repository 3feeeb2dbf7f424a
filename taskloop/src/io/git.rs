//! Version-control adapter: snapshot before an execution, roll back on abort.
//!
//! The git implementation is a small, explicit wrapper around `git`
//! subprocess calls in the project working directory.

use std::path::Path;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

const SNAPSHOT_MESSAGE: &str = "taskloop: snapshot before execution";

/// Snapshot/rollback contract consumed by the orchestrator.
pub trait VersionControl: Send + Sync {
    /// Record the current working tree and return a ref that restores it.
    fn snapshot(&self, workdir: &Path) -> Result<String>;

    /// Restore tracked files to `commit_ref` and remove untracked, non-ignored files.
    fn rollback(&self, workdir: &Path, commit_ref: &str) -> Result<()>;
}

/// [`VersionControl`] backed by the `git` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitVersionControl;

impl VersionControl for GitVersionControl {
    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn snapshot(&self, workdir: &Path) -> Result<String> {
        let git = Git::new(workdir);
        git.ensure_work_tree()?;
        git.run_checked(&["add", "-A"])?;
        let has_head = git.has_head()?;
        if git.has_staged_changes()? || !has_head {
            debug!(has_head, "committing snapshot");
            git.run_checked(&["commit", "--allow-empty", "-m", SNAPSHOT_MESSAGE])?;
        }
        let commit = git.capture(&["rev-parse", "HEAD"])?;
        info!(commit = %commit, "captured snapshot");
        Ok(commit)
    }

    #[instrument(skip_all, fields(workdir = %workdir.display(), commit_ref))]
    fn rollback(&self, workdir: &Path, commit_ref: &str) -> Result<()> {
        let git = Git::new(workdir);
        git.ensure_work_tree()?;
        git.run_checked(&["reset", "--hard", commit_ref])?;
        git.run_checked(&["clean", "-fd"])?;
        info!("rolled back working tree");
        Ok(())
    }
}

/// Git invocations rooted at one working directory.
struct Git<'a> {
    workdir: &'a Path,
}

impl<'a> Git<'a> {
    fn new(workdir: &'a Path) -> Self {
        Self { workdir }
    }

    fn ensure_work_tree(&self) -> Result<()> {
        let out = self.run(&["rev-parse", "--is-inside-work-tree"])?;
        if out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true" {
            return Ok(());
        }
        warn!(workdir = %self.workdir.display(), "not a git work tree");
        Err(anyhow!(
            "{} is not inside a git work tree",
            self.workdir.display()
        ))
    }

    fn has_head(&self) -> Result<bool> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        Ok(out.status.success())
    }

    fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    fn capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn snapshot_then_rollback_restores_tree() {
        let repo = TestRepo::new().expect("repo");
        fs::write(repo.path().join("a.txt"), "one\n").expect("write");

        let vcs = GitVersionControl;
        let commit = vcs.snapshot(repo.path()).expect("snapshot");

        fs::write(repo.path().join("a.txt"), "two\n").expect("modify");
        fs::write(repo.path().join("new.txt"), "new\n").expect("create");

        vcs.rollback(repo.path(), &commit).expect("rollback");
        assert_eq!(
            fs::read_to_string(repo.path().join("a.txt")).expect("read"),
            "one\n"
        );
        assert!(!repo.path().join("new.txt").exists());
    }

    #[test]
    fn snapshot_on_clean_tree_reuses_head() {
        let repo = TestRepo::new().expect("repo");
        let vcs = GitVersionControl;
        let first = vcs.snapshot(repo.path()).expect("first");
        let second = vcs.snapshot(repo.path()).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn snapshot_outside_repo_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(GitVersionControl.snapshot(temp.path()).is_err());
    }
}
