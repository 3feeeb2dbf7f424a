//! Collaborator bundle shared by every orchestration entry point.
//!
//! An [`Engine`] owns the configuration, the two state machines, and the
//! trait objects for documents, agent, version control, persistence, and
//! event delivery. It also tracks which execution loops are active, in this
//! process and through per-execution lock files across processes, so a
//! second loop for the same execution id is refused.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::core::index_doc::mark_task_status;
use crate::core::state_machine::StateMachine;
use crate::core::types::{ExecutionPlan, TaskStatus};
use crate::io::agent::{CodeAgent, CommandAgent};
use crate::io::config::{OrchestratorConfig, load_config};
use crate::io::documents::{DocumentStore, FsDocumentStore};
use crate::io::events::{EventRecord, EventSink, ExecutionEvent, FanoutSink, JsonlSink, TracingSink};
use crate::io::git::{GitVersionControl, VersionControl};
use crate::io::init::{TaskloopPaths, ensure_state_dir};
use crate::io::lock::{self, LoopLock};
use crate::io::prompt::PromptBuilder;
use crate::io::store::{ExecutionStatus, ExecutionStore, FileStore};
use crate::looping::{LoopOptions, LoopOutcome, run_loop};
use crate::select::load_plan;

pub struct Engine {
    pub(crate) paths: TaskloopPaths,
    pub(crate) config: OrchestratorConfig,
    pub(crate) documents: Arc<dyn DocumentStore>,
    pub(crate) agent: Arc<dyn CodeAgent>,
    pub(crate) vcs: Arc<dyn VersionControl>,
    pub(crate) store: Arc<dyn ExecutionStore>,
    pub(crate) development: StateMachine,
    pub(crate) runtime: StateMachine,
    pub(crate) prompts: PromptBuilder,
    events: FanoutSink,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Engine {
    /// Engine with the default collaborators for the project at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        Self::builder(root).build()
    }

    pub fn builder(root: &Path) -> EngineBuilder {
        EngineBuilder::new(root)
    }

    pub fn paths(&self) -> &TaskloopPaths {
        &self.paths
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn ExecutionStore {
        self.store.as_ref()
    }

    pub fn development_machine(&self) -> &StateMachine {
        &self.development
    }

    /// Re-derive the plan from the documents on disk.
    pub fn load_plan(&self) -> Result<ExecutionPlan> {
        load_plan(
            self.documents.as_ref(),
            &self.paths.index_path(&self.config),
            &self.paths.details_dir(&self.config),
        )
    }

    /// Rewrite one checkbox in the index document (atomic write).
    pub(crate) fn mark_task(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        self.rewrite_index(task_id, status, None).map(drop)
    }

    /// Like [`Engine::mark_task`], but leaves the index alone once the
    /// execution has been aborted. Returns whether the index was written.
    pub(crate) fn mark_task_unless_aborted(
        &self,
        execution_id: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<bool> {
        self.rewrite_index(task_id, status, Some(execution_id))
    }

    fn rewrite_index(
        &self,
        task_id: &str,
        status: TaskStatus,
        unless_aborted: Option<&str>,
    ) -> Result<bool> {
        let path = self.paths.index_path(&self.config);
        let text = self
            .documents
            .read_document(&path)?
            .ok_or_else(|| anyhow!("index document {} is missing", path.display()))?;
        let updated = mark_task_status(&text, task_id, status)
            .with_context(|| format!("mark task {task_id} {}", status.as_str()))?;
        if let Some(execution_id) = unless_aborted {
            if self.is_aborted(execution_id)? {
                debug!(execution_id, task_id, "execution aborted; index left unchanged");
                return Ok(false);
            }
        }
        self.documents.write_document_atomic(&path, &updated)?;
        Ok(true)
    }

    /// Whether the execution was aborted (or its record is gone).
    pub(crate) fn is_aborted(&self, execution_id: &str) -> Result<bool> {
        Ok(match self.store.get_execution(execution_id)? {
            Some(execution) => execution.status == ExecutionStatus::Aborted,
            None => true,
        })
    }

    pub(crate) fn emit(&self, execution_id: &str, event: ExecutionEvent) {
        self.events.emit(&EventRecord::new(execution_id, event));
    }

    /// Reject a lifecycle move the runtime machine does not allow.
    pub(crate) fn check_transition(&self, current: ExecutionStatus, event: &str) -> Result<()> {
        self.runtime
            .transition(current.as_str(), event)
            .map(drop)
            .with_context(|| format!("cannot {event} an execution that is {}", current.as_str()))
    }

    /// Like [`Engine::check_transition`], but only logs a rejection; the caller
    /// writes the status directly either way.
    pub(crate) fn note_transition(&self, current: ExecutionStatus, event: &str) {
        if let Err(err) = self.runtime.transition(current.as_str(), event) {
            warn!(error = %err, "runtime transition rejected; writing status directly");
        }
    }

    /// Whether a loop for `execution_id` is running, in this process or in
    /// another one holding the execution's lock file.
    pub fn is_active(&self, execution_id: &str) -> bool {
        let local = self
            .active
            .lock()
            .map(|active| active.contains(execution_id))
            .unwrap_or(false);
        if local {
            return true;
        }
        match lock::is_held(&self.paths.locks_dir, execution_id) {
            Ok(held) => held,
            Err(err) => {
                warn!(execution_id, error = %format!("{err:#}"), "could not check loop lock");
                false
            }
        }
    }

    fn claim(&self, execution_id: &str) -> Result<ActiveLoop> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| anyhow!("active loop registry poisoned"))?;
        if active.contains(execution_id) {
            return Err(anyhow!("execution {execution_id} already has an active loop"));
        }
        let lock = lock::try_acquire(&self.paths.locks_dir, execution_id)?.ok_or_else(|| {
            anyhow!("execution {execution_id} already has an active loop in another process")
        })?;
        active.insert(execution_id.to_string());
        debug!(execution_id, "claimed execution loop");
        Ok(ActiveLoop {
            execution_id: execution_id.to_string(),
            active: Arc::clone(&self.active),
            _lock: lock,
        })
    }

    /// Run the loop for `execution_id` on the calling thread.
    pub fn run(&self, execution_id: &str, options: &LoopOptions) -> Result<LoopOutcome> {
        let _claim = self.claim(execution_id)?;
        run_loop(self, execution_id, options)
    }

    /// Run the loop for `execution_id` on its own thread.
    pub fn spawn(
        self: &Arc<Self>,
        execution_id: &str,
        options: LoopOptions,
    ) -> Result<JoinHandle<Result<LoopOutcome>>> {
        let claim = self.claim(execution_id)?;
        let engine = Arc::clone(self);
        let execution_id = execution_id.to_string();
        thread::Builder::new()
            .name(format!("taskloop-{}", short_id(&execution_id)))
            .spawn(move || {
                let _claim = claim;
                run_loop(&engine, &execution_id, &options)
            })
            .context("spawn execution loop thread")
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Registry entry and lock file released when the loop that owns them ends,
/// however it ends.
struct ActiveLoop {
    execution_id: String,
    active: Arc<Mutex<HashSet<String>>>,
    _lock: LoopLock,
}

impl Drop for ActiveLoop {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.execution_id);
        }
    }
}

/// Builds an [`Engine`], substituting collaborators where given.
pub struct EngineBuilder {
    root: PathBuf,
    config: Option<OrchestratorConfig>,
    documents: Option<Arc<dyn DocumentStore>>,
    agent: Option<Arc<dyn CodeAgent>>,
    vcs: Option<Arc<dyn VersionControl>>,
    store: Option<Arc<dyn ExecutionStore>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EngineBuilder {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            config: None,
            documents: None,
            agent: None,
            vcs: None,
            store: None,
            sinks: Vec::new(),
        }
    }

    /// Use `config` instead of `.taskloop/config.toml`.
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn agent(mut self, agent: Arc<dyn CodeAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn version_control(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Deliver events to `sink` in addition to the tracing log and event log.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let root = fs::canonicalize(&self.root)
            .with_context(|| format!("resolve project root {}", self.root.display()))?;
        let paths = TaskloopPaths::new(root);
        ensure_state_dir(&paths)?;

        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => load_config(&paths.config_path).context("load config.toml")?,
        };
        let (development, runtime) = config.load_state_machines(&paths.root)?;

        let agent = self.agent.unwrap_or_else(|| {
            Arc::new(CommandAgent::new(
                config.agent.command.clone(),
                config.agent_output_limit_bytes,
            ))
        });
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(FileStore::new(&paths.state_dir)));
        let mut events = FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(Arc::new(JsonlSink::new(&paths.events_dir)));
        for sink in self.sinks {
            events = events.with(sink);
        }

        Ok(Engine {
            prompts: PromptBuilder::new(config.prompt_budget_bytes),
            documents: self.documents.unwrap_or_else(|| Arc::new(FsDocumentStore)),
            vcs: self.vcs.unwrap_or_else(|| Arc::new(GitVersionControl)),
            agent,
            store,
            development,
            runtime,
            events,
            active: Arc::new(Mutex::new(HashSet::new())),
            paths,
            config,
        })
    }
}
