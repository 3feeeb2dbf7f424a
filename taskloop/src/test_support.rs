//! Test-only helpers: plan fixtures, temp projects, and scripted collaborators.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{ExecutionPlan, Milestone, Task, TaskStatus};
use crate::engine::Engine;
use crate::io::agent::{AgentRequest, AgentResponse, CodeAgent};
use crate::io::config::{OrchestratorConfig, write_config};
use crate::io::events::{EventRecord, EventSink, ExecutionEvent};
use crate::io::git::VersionControl;
use crate::io::init::TaskloopPaths;
use crate::io::store::FileStore;

/// Create a deterministic task with no description or verification.
pub fn task(id: &str, status: TaskStatus, depends: &[&str]) -> Task {
    Task {
        id: id.to_string(),
        title: format!("Task {id}"),
        description: None,
        verification: None,
        status,
        milestone_id: String::new(),
        depends: depends.iter().map(|d| d.to_string()).collect(),
    }
}

/// Create a milestone owning `tasks` (their `milestone_id` is overwritten).
pub fn milestone(id: &str, tasks: Vec<Task>) -> Milestone {
    let mut milestone = Milestone::new(id, id);
    milestone.tasks = tasks
        .into_iter()
        .map(|mut task| {
            task.milestone_id = id.to_string();
            task
        })
        .collect();
    milestone.refresh_counts();
    milestone
}

pub fn plan(milestones: Vec<Milestone>) -> ExecutionPlan {
    ExecutionPlan::new(milestones)
}

/// Agent output that creates each `(path, content)` file.
pub fn task_output_json(task_id: &str, files: &[(&str, &str)]) -> String {
    let files: Vec<_> = files
        .iter()
        .map(|(path, content)| {
            serde_json::json!({ "path": path, "action": "create", "content": content })
        })
        .collect();
    let body = serde_json::json!({
        "taskId": task_id,
        "files": files,
        "summary": format!("implemented {task_id}"),
    });
    format!("Done.\n\n```json\n{body:#}\n```\n")
}

fn git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

fn init_repo(dir: &Path) -> Result<()> {
    git(dir, &["init", "-q"])?;
    git(dir, &["config", "user.email", "taskloop@example.com"])?;
    git(dir, &["config", "user.name", "taskloop tests"])?;
    git(dir, &["config", "commit.gpgsign", "false"])?;
    Ok(())
}

fn commit_all(dir: &Path, message: &str) -> Result<()> {
    git(dir, &["add", "-A"])?;
    git(dir, &["commit", "-q", "--allow-empty", "-m", message])
}

/// Temporary git repository with one initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        init_repo(dir.path())?;
        fs::write(dir.path().join("README.md"), "# test repo\n").context("write README")?;
        commit_all(dir.path(), "initial")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// One canned agent behavior.
pub enum ScriptedResponse {
    Respond(AgentResponse),
    /// The agent could not be invoked.
    Error(String),
    /// Runs arbitrary code during the invocation (e.g. a concurrent abort).
    With(Box<dyn FnOnce(&AgentRequest) -> Result<AgentResponse> + Send>),
}

impl ScriptedResponse {
    /// Successful response creating `files` for `task_id`.
    pub fn files(task_id: &str, files: &[(&str, &str)]) -> Self {
        ScriptedResponse::Respond(AgentResponse::success(task_output_json(task_id, files)))
    }

    pub fn raw(raw_output: &str) -> Self {
        ScriptedResponse::Respond(AgentResponse::success(raw_output))
    }

    pub fn failure(detail: &str) -> Self {
        ScriptedResponse::Respond(AgentResponse::failure(detail))
    }

    pub fn with(
        run: impl FnOnce(&AgentRequest) -> Result<AgentResponse> + Send + 'static,
    ) -> Self {
        ScriptedResponse::With(Box::new(run))
    }
}

/// [`CodeAgent`] that replays queued responses and records requests.
#[derive(Default)]
pub struct ScriptedAgent {
    queue: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            queue: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, response: ScriptedResponse) {
        self.queue.lock().expect("queue lock").push_back(response);
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn assert_drained(&self) {
        let remaining = self.queue.lock().expect("queue lock").len();
        assert_eq!(remaining, 0, "scripted agent has {remaining} unused responses");
    }
}

impl CodeAgent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let next = self.queue.lock().expect("queue lock").pop_front();
        match next {
            Some(ScriptedResponse::Respond(response)) => Ok(response),
            Some(ScriptedResponse::Error(message)) => Err(anyhow!(message)),
            Some(ScriptedResponse::With(run)) => run(request),
            None => Err(anyhow!(
                "scripted agent exhausted (task {})",
                request.task_id
            )),
        }
    }
}

/// [`EventSink`] that keeps every record in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<EventRecord>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().expect("records lock").clone()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.records().into_iter().map(|r| r.event).collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.records().iter().map(|r| r.event.name()).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, record: &EventRecord) {
        self.records
            .lock()
            .expect("records lock")
            .push(record.clone());
    }
}

/// [`VersionControl`] that records calls without touching the filesystem.
#[derive(Debug, Default)]
pub struct FakeVcs {
    fail_rollback: bool,
    snapshots: Mutex<Vec<PathBuf>>,
    rollbacks: Mutex<Vec<(PathBuf, String)>>,
}

pub const FAKE_COMMIT: &str = "c0ffee";

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_rollback() -> Self {
        Self {
            fail_rollback: true,
            ..Self::default()
        }
    }

    pub fn snapshots(&self) -> Vec<PathBuf> {
        self.snapshots.lock().expect("snapshots lock").clone()
    }

    pub fn rollbacks(&self) -> Vec<(PathBuf, String)> {
        self.rollbacks.lock().expect("rollbacks lock").clone()
    }
}

impl VersionControl for FakeVcs {
    fn snapshot(&self, workdir: &Path) -> Result<String> {
        self.snapshots
            .lock()
            .expect("snapshots lock")
            .push(workdir.to_path_buf());
        Ok(FAKE_COMMIT.to_string())
    }

    fn rollback(&self, workdir: &Path, commit_ref: &str) -> Result<()> {
        self.rollbacks
            .lock()
            .expect("rollbacks lock")
            .push((workdir.to_path_buf(), commit_ref.to_string()));
        if self.fail_rollback {
            return Err(anyhow!("rollback refused by fake"));
        }
        Ok(())
    }
}

/// Temp project with plan documents, a file store, and fast polling.
pub struct TestProject {
    dir: TempDir,
    pub paths: TaskloopPaths,
    pub config: OrchestratorConfig,
    pub store: Arc<FileStore>,
    pub events: Arc<RecordingSink>,
}

impl TestProject {
    /// `details` are `(file name, text)` pairs written to the details directory.
    pub fn new(index: &str, details: &[(&str, &str)]) -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp project")?;
        let paths = TaskloopPaths::new(dir.path());
        let config = OrchestratorConfig {
            poll_interval_ms: 10,
            ..OrchestratorConfig::default()
        };
        fs::create_dir_all(&paths.state_dir).context("create state dir")?;
        fs::write(&paths.gitignore_path, "*\n").context("write state gitignore")?;
        write_config(&paths.config_path, &config)?;

        let index_path = paths.index_path(&config);
        fs::create_dir_all(index_path.parent().unwrap_or(dir.path()))
            .context("create index dir")?;
        fs::write(&index_path, index).context("write index")?;
        let details_dir = paths.details_dir(&config);
        fs::create_dir_all(&details_dir).context("create details dir")?;
        for (name, text) in details {
            fs::write(details_dir.join(name), text).with_context(|| format!("write {name}"))?;
        }

        let store = Arc::new(FileStore::new(&paths.state_dir));
        Ok(Self {
            dir,
            paths,
            config,
            store,
            events: Arc::new(RecordingSink::default()),
        })
    }

    /// Turn the project into a git repository with everything committed.
    pub fn init_git(&self) -> Result<()> {
        init_repo(self.root())?;
        commit_all(self.root(), "plan")
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn engine(
        &self,
        agent: Arc<dyn CodeAgent>,
        vcs: Arc<dyn VersionControl>,
    ) -> Result<Engine> {
        Engine::builder(self.root())
            .config(self.config.clone())
            .agent(agent)
            .version_control(vcs)
            .store(self.store.clone())
            .event_sink(self.events.clone())
            .build()
    }

    pub fn read_index(&self) -> Result<String> {
        let path = self.paths.index_path(&self.config);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn write_index(&self, text: &str) -> Result<()> {
        let path = self.paths.index_path(&self.config);
        fs::write(&path, text).with_context(|| format!("write {}", path.display()))
    }
}
