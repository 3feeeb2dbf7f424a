//! Orchestration for starting a new execution.
//!
//! Starting an execution: refuses if another live execution owns the same
//! version or working directory, checks the plan, snapshots the working tree
//! (the abort target), and persists a `running` execution record. The loop
//! itself is run separately ([`crate::engine::Engine::run`] or `spawn`).

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument};

use crate::core::calculator::progress;
use crate::core::invariants::validate_plan;
use crate::engine::Engine;
use crate::io::events::ExecutionEvent;
use crate::io::store::{Execution, ExecutionStatus};
use crate::phase;

/// Runtime state of an execution that has not started yet.
const IDLE: &str = "idle";

#[instrument(skip_all, fields(version_id = %version_id))]
pub fn start_execution(engine: &Engine, version_id: &str) -> Result<Execution> {
    let version_id = version_id.trim();
    if version_id.is_empty() {
        return Err(anyhow!("version id must not be empty"));
    }
    let workdir = &engine.paths.root;

    if let Some(live) = engine
        .store
        .list_executions()?
        .into_iter()
        .find(|e| !e.status.is_terminal() && (e.version_id == version_id || &e.working_directory == workdir))
    {
        return Err(anyhow!(
            "execution {} is already {} for version {} in {}",
            live.id,
            live.status.as_str(),
            live.version_id,
            live.working_directory.display()
        ));
    }

    let plan = engine.load_plan()?;
    let defects = validate_plan(&plan);
    if !defects.is_empty() {
        let listed: Vec<String> = defects.iter().map(ToString::to_string).collect();
        return Err(anyhow!("plan is invalid:\n- {}", listed.join("\n- ")));
    }

    engine
        .runtime
        .transition(IDLE, "start")
        .context("runtime machine cannot start an execution")?;

    let commit_ref = engine
        .vcs
        .snapshot(workdir)
        .context("snapshot working tree before execution")?;

    let summary = progress(&plan);
    let mut execution = Execution::new(version_id, workdir.clone());
    execution.status = ExecutionStatus::Running;
    execution.total_tasks = summary.total;
    execution.completed_tasks = summary.completed;
    execution.pre_execution_commit_ref = Some(commit_ref.clone());
    engine.store.create_execution(&execution)?;
    info!(execution_id = %execution.id, commit = %commit_ref, tasks = summary.total, "execution started");

    phase::advance(engine, version_id, "start_execution");
    engine.emit(
        &execution.id,
        ExecutionEvent::Progress {
            completed: summary.completed,
            total: summary.total,
            percent: summary.percent,
        },
    );
    Ok(execution)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::control::abort_execution;
    use crate::test_support::{FAKE_COMMIT, FakeVcs, ScriptedAgent, TestProject};

    const INDEX: &str = "## M1: One\n- [x] 001: First\n- [ ] 002: Second\n";

    #[test]
    fn start_snapshots_and_persists_running_execution() {
        let project = TestProject::new(INDEX, &[]).expect("project");
        let vcs = Arc::new(FakeVcs::new());
        let engine = project
            .engine(Arc::new(ScriptedAgent::default()), vcs.clone())
            .expect("engine");

        let execution = start_execution(&engine, "v1").expect("start");
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(execution.total_tasks, 2);
        assert_eq!(execution.completed_tasks, 1);
        assert_eq!(
            execution.pre_execution_commit_ref.as_deref(),
            Some(FAKE_COMMIT)
        );
        assert_eq!(vcs.snapshots(), vec![engine.paths().root.clone()]);

        let stored = engine
            .store()
            .get_execution(&execution.id)
            .expect("get")
            .expect("exists");
        assert_eq!(stored, execution);
        assert_eq!(project.events.names(), vec!["progress"]);
    }

    #[test]
    fn start_refuses_second_live_execution() {
        let project = TestProject::new(INDEX, &[]).expect("project");
        let engine = project
            .engine(Arc::new(ScriptedAgent::default()), Arc::new(FakeVcs::new()))
            .expect("engine");

        let first = start_execution(&engine, "v1").expect("first");
        let err = start_execution(&engine, "v1").expect_err("same version");
        assert!(err.to_string().contains(&first.id), "{err}");
        // same working directory, different version
        assert!(start_execution(&engine, "v2").is_err());

        abort_execution(&engine, &first.id).expect("abort");
        start_execution(&engine, "v1").expect("after abort");
    }

    #[test]
    fn start_refuses_defective_plan() {
        let project = TestProject::new(
            "## M1: One\n- [ ] 001: First\n",
            &[("M1.md", "## 001: First\n\nDepends: 404\n")],
        )
        .expect("project");
        let vcs = Arc::new(FakeVcs::new());
        let engine = project
            .engine(Arc::new(ScriptedAgent::default()), vcs.clone())
            .expect("engine");

        let err = start_execution(&engine, "v1").expect_err("defective");
        assert!(err.to_string().contains("404"), "{err}");
        assert!(vcs.snapshots().is_empty());
        assert!(engine.store().list_executions().expect("list").is_empty());
    }
}
