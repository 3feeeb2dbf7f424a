//! Persistent execution store.
//!
//! Executions, task attempts, and per-version development phases are kept as
//! JSON documents under `.taskloop/`. The store is the single arbitration
//! point between concurrently running loops and operator commands, so every
//! read-modify-write happens under one lock and lands via atomic rename.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::io::atomic::write_atomic;

/// Coarse execution lifecycle observed by the rest of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Aborted => "aborted",
        }
    }

    /// Map a runtime state-machine state back to a persisted status.
    pub fn from_state(state: &str) -> Option<Self> {
        match state {
            "running" => Some(ExecutionStatus::Running),
            "paused" => Some(ExecutionStatus::Paused),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "aborted" => Some(ExecutionStatus::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Aborted
        )
    }
}

/// One run-through of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub version_id: String,
    pub working_directory: PathBuf,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub current_task_id: Option<String>,
    pub pre_execution_commit_ref: Option<String>,
    pub is_paused: bool,
}

impl Execution {
    pub fn new(version_id: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            version_id: version_id.into(),
            working_directory: working_directory.into(),
            started_at: Utc::now(),
            completed_at: None,
            status: ExecutionStatus::Running,
            total_tasks: 0,
            completed_tasks: 0,
            current_task_id: None,
            pre_execution_commit_ref: None,
            is_paused: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Running,
    Completed,
    Failed,
}

/// One historical attempt at one task. Append-only apart from its terminal update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAttempt {
    pub id: String,
    pub execution_id: String,
    pub task_id: String,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub error_message: Option<String>,
}

/// Progress fields written after each task transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub current_task_id: Option<String>,
}

/// A write to an execution that already reached a terminal status.
///
/// Terminal records are final: whichever actor reaches a terminal status
/// first wins, and every later write to that record is refused with this
/// error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("execution {id} is already {}", .status.as_str())]
pub struct ExecutionFinished {
    pub id: String,
    pub status: ExecutionStatus,
}

/// Persistence contract consumed by the orchestrator.
///
/// Every mutation of an execution fails with [`ExecutionFinished`] once the
/// record is terminal.
pub trait ExecutionStore: Send + Sync {
    fn create_execution(&self, execution: &Execution) -> Result<()>;
    fn get_execution(&self, id: &str) -> Result<Option<Execution>>;
    /// All executions, oldest first.
    fn list_executions(&self) -> Result<Vec<Execution>>;
    fn set_paused(&self, id: &str, paused: bool) -> Result<()>;
    fn set_status(&self, id: &str, status: ExecutionStatus) -> Result<()>;
    fn update_progress(&self, id: &str, progress: &ProgressUpdate) -> Result<()>;
    /// Move to a terminal `status`, stamping `completed_at` and clearing the pause flag.
    fn complete(&self, id: &str, status: ExecutionStatus) -> Result<()>;
    /// Non-terminal executions (running, paused, or flagged paused).
    fn find_stale(&self) -> Result<Vec<Execution>>;

    /// Create a running attempt for `task_id`, numbered after earlier attempts.
    fn create_attempt(&self, execution_id: &str, task_id: &str) -> Result<TaskAttempt>;
    fn finish_attempt(
        &self,
        execution_id: &str,
        attempt_id: &str,
        status: AttemptStatus,
        error_message: Option<String>,
    ) -> Result<()>;
    fn list_attempts(&self, execution_id: &str) -> Result<Vec<TaskAttempt>>;

    fn get_phase(&self, version_id: &str) -> Result<Option<String>>;
    fn set_phase(&self, version_id: &str, state: &str) -> Result<()>;
}

/// [`ExecutionStore`] backed by JSON files.
#[derive(Debug)]
pub struct FileStore {
    executions_dir: PathBuf,
    attempts_dir: PathBuf,
    phases_path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Store rooted at `state_dir` (normally `.taskloop/`).
    pub fn new(state_dir: &Path) -> Self {
        Self {
            executions_dir: state_dir.join("executions"),
            attempts_dir: state_dir.join("attempts"),
            phases_path: state_dir.join("phases.json"),
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock.lock().map_err(|_| anyhow!("execution store lock poisoned"))
    }

    fn execution_path(&self, id: &str) -> Result<PathBuf> {
        ensure_record_id(id)?;
        Ok(self.executions_dir.join(format!("{id}.json")))
    }

    fn attempts_path(&self, execution_id: &str) -> Result<PathBuf> {
        ensure_record_id(execution_id)?;
        Ok(self.attempts_dir.join(format!("{execution_id}.json")))
    }

    fn update_execution(&self, id: &str, apply: impl FnOnce(&mut Execution)) -> Result<()> {
        let _guard = self.guard()?;
        let path = self.execution_path(id)?;
        let mut execution: Execution =
            read_json(&path)?.ok_or_else(|| anyhow!("execution {id} not found"))?;
        if execution.status.is_terminal() {
            return Err(ExecutionFinished {
                id: id.to_string(),
                status: execution.status,
            }
            .into());
        }
        apply(&mut execution);
        write_json(&path, &execution)
    }

    fn read_attempts(&self, execution_id: &str) -> Result<Vec<TaskAttempt>> {
        Ok(read_json(&self.attempts_path(execution_id)?)?.unwrap_or_default())
    }
}

impl ExecutionStore for FileStore {
    fn create_execution(&self, execution: &Execution) -> Result<()> {
        let _guard = self.guard()?;
        let path = self.execution_path(&execution.id)?;
        if path.exists() {
            return Err(anyhow!("execution {} already exists", execution.id));
        }
        debug!(execution_id = %execution.id, version_id = %execution.version_id, "creating execution");
        write_json(&path, execution)
    }

    fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let _guard = self.guard()?;
        read_json(&self.execution_path(id)?)
    }

    fn list_executions(&self) -> Result<Vec<Execution>> {
        let _guard = self.guard()?;
        let entries = match fs::read_dir(&self.executions_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("list {}", self.executions_dir.display()));
            }
        };
        let mut executions = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("list {}", self.executions_dir.display()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(execution) = read_json::<Execution>(&path)? {
                executions.push(execution);
            }
        }
        executions.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(executions)
    }

    fn set_paused(&self, id: &str, paused: bool) -> Result<()> {
        debug!(execution_id = id, paused, "setting pause flag");
        self.update_execution(id, |execution| execution.is_paused = paused)
    }

    fn set_status(&self, id: &str, status: ExecutionStatus) -> Result<()> {
        debug!(execution_id = id, status = status.as_str(), "setting status");
        self.update_execution(id, |execution| execution.status = status)
    }

    fn update_progress(&self, id: &str, progress: &ProgressUpdate) -> Result<()> {
        self.update_execution(id, |execution| {
            execution.total_tasks = progress.total_tasks;
            execution.completed_tasks = progress.completed_tasks;
            execution.current_task_id = progress.current_task_id.clone();
        })
    }

    fn complete(&self, id: &str, status: ExecutionStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(anyhow!(
                "cannot complete execution {id} with non-terminal status {}",
                status.as_str()
            ));
        }
        debug!(execution_id = id, status = status.as_str(), "completing execution");
        self.update_execution(id, |execution| {
            execution.status = status;
            execution.completed_at = Some(Utc::now());
            execution.is_paused = false;
            execution.current_task_id = None;
        })
    }

    fn find_stale(&self) -> Result<Vec<Execution>> {
        Ok(self
            .list_executions()?
            .into_iter()
            .filter(|execution| !execution.status.is_terminal())
            .collect())
    }

    fn create_attempt(&self, execution_id: &str, task_id: &str) -> Result<TaskAttempt> {
        let _guard = self.guard()?;
        let mut attempts = self.read_attempts(execution_id)?;
        let previous = attempts
            .iter()
            .filter(|attempt| attempt.task_id == task_id)
            .count();
        let attempt = TaskAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            task_id: task_id.to_string(),
            attempt_number: u32::try_from(previous + 1).context("attempt number overflow")?,
            started_at: Utc::now(),
            completed_at: None,
            status: AttemptStatus::Running,
            error_message: None,
        };
        attempts.push(attempt.clone());
        write_json(&self.attempts_path(execution_id)?, &attempts)?;
        debug!(execution_id, task_id, attempt = attempt.attempt_number, "attempt created");
        Ok(attempt)
    }

    fn finish_attempt(
        &self,
        execution_id: &str,
        attempt_id: &str,
        status: AttemptStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let _guard = self.guard()?;
        let mut attempts = self.read_attempts(execution_id)?;
        let attempt = attempts
            .iter_mut()
            .find(|attempt| attempt.id == attempt_id)
            .ok_or_else(|| anyhow!("attempt {attempt_id} not found in execution {execution_id}"))?;
        if attempt.status != AttemptStatus::Running {
            return Err(anyhow!("attempt {attempt_id} is already finished"));
        }
        attempt.status = status;
        attempt.error_message = error_message;
        attempt.completed_at = Some(Utc::now());
        write_json(&self.attempts_path(execution_id)?, &attempts)
    }

    fn list_attempts(&self, execution_id: &str) -> Result<Vec<TaskAttempt>> {
        let _guard = self.guard()?;
        self.read_attempts(execution_id)
    }

    fn get_phase(&self, version_id: &str) -> Result<Option<String>> {
        let _guard = self.guard()?;
        let phases: BTreeMap<String, String> = read_json(&self.phases_path)?.unwrap_or_default();
        Ok(phases.get(version_id).cloned())
    }

    fn set_phase(&self, version_id: &str, state: &str) -> Result<()> {
        let _guard = self.guard()?;
        let mut phases: BTreeMap<String, String> =
            read_json(&self.phases_path)?.unwrap_or_default();
        phases.insert(version_id.to_string(), state.to_string());
        write_json(&self.phases_path, &phases)
    }
}

/// Record ids become file names; keep them to a safe alphabet.
pub(crate) fn ensure_record_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(anyhow!("invalid record id '{id}'"))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, buf)
}
