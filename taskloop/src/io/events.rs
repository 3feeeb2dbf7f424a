//! Lifecycle events emitted by the orchestration loop.
//!
//! Events are emitted only after the state they describe is persisted. Every
//! event goes to the tracing log and to `.taskloop/events/<execution-id>.jsonl`;
//! embedders can add their own sinks.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, mpsc};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ExecutionEvent {
    Progress {
        completed: usize,
        total: usize,
        percent: u8,
    },
    TaskStarted {
        task_id: String,
        attempt_number: u32,
    },
    TaskDone {
        task_id: String,
        files_written: usize,
        summary: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    Paused,
    Resumed,
    Blocked {
        blocked_by: Vec<String>,
    },
    Completed,
    Aborted {
        rollback_error: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ExecutionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::Progress { .. } => "progress",
            ExecutionEvent::TaskStarted { .. } => "task_started",
            ExecutionEvent::TaskDone { .. } => "task_done",
            ExecutionEvent::TaskFailed { .. } => "task_failed",
            ExecutionEvent::Paused => "paused",
            ExecutionEvent::Resumed => "resumed",
            ExecutionEvent::Blocked { .. } => "blocked",
            ExecutionEvent::Completed => "completed",
            ExecutionEvent::Aborted { .. } => "aborted",
            ExecutionEvent::Error { .. } => "error",
        }
    }
}

/// An event stamped with its execution and emission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub execution_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ExecutionEvent,
}

impl EventRecord {
    pub fn new(execution_id: impl Into<String>, event: ExecutionEvent) -> Self {
        Self {
            execution_id: execution_id.into(),
            at: Utc::now(),
            event,
        }
    }
}

/// Receiver of lifecycle events. Delivery is best-effort: sinks report their
/// own failures and never fail the loop.
pub trait EventSink: Send + Sync {
    fn emit(&self, record: &EventRecord);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, record: &EventRecord) {
        match &record.event {
            ExecutionEvent::TaskFailed { task_id, error } => {
                warn!(execution_id = %record.execution_id, task_id = %task_id, error = %error, "task failed");
            }
            ExecutionEvent::Error { message } => {
                warn!(execution_id = %record.execution_id, message = %message, "execution error");
            }
            ExecutionEvent::Blocked { blocked_by } => {
                warn!(execution_id = %record.execution_id, blocked_by = ?blocked_by, "execution blocked");
            }
            event => {
                info!(execution_id = %record.execution_id, event = event.name(), "execution event");
            }
        }
    }
}

/// Appends one JSON line per event to `<dir>/<execution-id>.jsonl`.
#[derive(Debug)]
pub struct JsonlSink {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn log_path(&self, execution_id: &str) -> PathBuf {
        self.dir.join(format!("{execution_id}.jsonl"))
    }

    fn append(&self, record: &EventRecord) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create directory {}", self.dir.display()))?;
        let path = self.log_path(&record.execution_id);
        let mut line = serde_json::to_string(record).context("serialize event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", path.display()))
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, record: &EventRecord) {
        if let Err(err) = self.append(record) {
            warn!(err = %format!("{err:#}"), "failed to append event log");
        }
    }
}

/// Forwards events over a channel (embedding UIs, tests).
#[derive(Debug)]
pub struct ChannelSink {
    sender: mpsc::Sender<EventRecord>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<EventRecord>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, record: &EventRecord) {
        // a dropped receiver just means nobody is listening any more
        let _ = self.sender.send(record.clone());
    }
}

/// Delivers each event to every inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, record: &EventRecord) {
        for sink in &self.sinks {
            sink.emit(record);
        }
    }
}

/// Read a JSONL event log back (missing file ⇒ empty).
pub fn read_event_log(path: &Path) -> Result<Vec<EventRecord>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}
