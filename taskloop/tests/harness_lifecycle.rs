//! Lifecycle tests that drive whole executions through the public API.
//!
//! Each test builds a temp project with plan documents, runs the loop with a
//! scripted agent, and checks the persisted execution, the attempt history,
//! the plan index, and the event log together.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use taskloop::control::{abort_execution, retry_task, skip_task};
use taskloop::core::types::TaskStatus;
use taskloop::engine::Engine;
use taskloop::io::agent::AgentResponse;
use taskloop::io::events::{ExecutionEvent, read_event_log};
use taskloop::io::git::GitVersionControl;
use taskloop::io::store::{AttemptStatus, ExecutionStatus};
use taskloop::looping::{LoopOptions, LoopStop};
use taskloop::recover::{find_stale, resume_stale};
use taskloop::start::start_execution;
use taskloop::step::{StepOutcome, run_step};
use taskloop::test_support::{
    FakeVcs, ScriptedAgent, ScriptedResponse, TestProject, task_output_json,
};

const INDEX: &str = "# Tasks\n\n## M1: Basics\n- [ ] 001: Write a\n- [ ] 002: Write b\n";
const DETAIL: &str = "## 002: Write b\n\nDepends: 001\n";

const DETACH: LoopOptions = LoopOptions {
    detach_on_pause: true,
};

fn project() -> TestProject {
    TestProject::new(INDEX, &[("M1.md", DETAIL)]).expect("project")
}

fn execution_status(engine: &Engine, id: &str) -> (ExecutionStatus, bool) {
    let execution = engine
        .store()
        .get_execution(id)
        .expect("get execution")
        .expect("execution exists");
    (execution.status, execution.is_paused)
}

fn git_head(root: &Path) -> String {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(root)
        .output()
        .expect("git rev-parse");
    assert!(output.status.success());
    String::from_utf8(output.stdout)
        .expect("utf8")
        .trim()
        .to_string()
}

/// Happy path: both tasks run in dependency order, the index is ticked, and
/// the JSONL event log matches what the in-process sink saw.
#[test]
fn execution_runs_plan_to_completion() {
    let project = project();
    let agent = Arc::new(ScriptedAgent::new(vec![
        ScriptedResponse::files("001", &[("src/a.txt", "a\n")]),
        ScriptedResponse::files("002", &[("src/b.txt", "b\n")]),
    ]));
    let vcs = Arc::new(FakeVcs::new());
    let engine = project
        .engine(agent.clone(), vcs.clone())
        .expect("engine");

    let execution = start_execution(&engine, "v1").expect("start");
    assert_eq!(execution.total_tasks, 2);
    assert_eq!(vcs.snapshots().len(), 1);

    let outcome = engine
        .run(&execution.id, &LoopOptions::default())
        .expect("loop");
    assert_eq!(outcome.stop, LoopStop::Completed);
    assert_eq!(outcome.tasks_completed, 2);
    agent.assert_drained();

    let requests = agent.requests();
    assert_eq!(requests[0].task_id, "001");
    assert_eq!(requests[1].task_id, "002");

    assert_eq!(
        fs::read_to_string(project.root().join("src/a.txt")).expect("a"),
        "a\n"
    );
    assert_eq!(
        fs::read_to_string(project.root().join("src/b.txt")).expect("b"),
        "b\n"
    );
    let index = project.read_index().expect("index");
    assert!(index.contains("- [x] 001: Write a"));
    assert!(index.contains("- [x] 002: Write b"));

    let done = engine
        .store()
        .get_execution(&execution.id)
        .expect("get")
        .expect("exists");
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.completed_tasks, 2);
    assert!(done.completed_at.is_some());
    assert!(done.current_task_id.is_none());
    assert!(vcs.rollbacks().is_empty());

    let names = project.events.names();
    assert_eq!(names.first(), Some(&"progress"));
    assert_eq!(names.last(), Some(&"completed"));
    assert_eq!(names.iter().filter(|name| **name == "task_done").count(), 2);

    let log = read_event_log(
        &project
            .paths
            .events_dir
            .join(format!("{}.jsonl", execution.id)),
    )
    .expect("event log");
    let logged: Vec<&str> = log.iter().map(|record| record.event.name()).collect();
    assert_eq!(logged, names);
    assert!(log.iter().all(|record| record.execution_id == execution.id));
}

/// A failing agent pauses the execution; retrying creates a second attempt
/// whose prompt carries the first failure.
#[test]
fn agent_failure_pauses_and_retry_starts_new_attempt() {
    let project = project();
    let agent = Arc::new(ScriptedAgent::new(vec![
        ScriptedResponse::failure("compiler exploded"),
        ScriptedResponse::files("001", &[("a.txt", "a")]),
        ScriptedResponse::files("002", &[("b.txt", "b")]),
    ]));
    let engine = project
        .engine(agent.clone(), Arc::new(FakeVcs::new()))
        .expect("engine");
    let id = start_execution(&engine, "v1").expect("start").id;

    let first = engine.run(&id, &DETACH).expect("first run");
    assert_eq!(first.stop, LoopStop::Detached);
    assert_eq!(first.tasks_failed, 1);
    assert_eq!(execution_status(&engine, &id), (ExecutionStatus::Paused, true));

    let attempts = engine.store().list_attempts(&id).expect("attempts");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, AttemptStatus::Failed);
    let error = attempts[0].error_message.as_deref().expect("error message");
    assert!(error.contains("compiler exploded"), "{error}");

    let previous = retry_task(&engine, &id, "001").expect("retry");
    assert_eq!(previous, TaskStatus::Pending);
    assert_eq!(execution_status(&engine, &id), (ExecutionStatus::Running, false));

    let second = resume_stale(&engine, &id, &DETACH).expect("resume");
    assert_eq!(second.stop, LoopStop::Completed);
    agent.assert_drained();

    let attempts = engine.store().list_attempts(&id).expect("attempts");
    let numbers: Vec<(&str, u32, AttemptStatus)> = attempts
        .iter()
        .map(|a| (a.task_id.as_str(), a.attempt_number, a.status))
        .collect();
    assert_eq!(
        numbers,
        vec![
            ("001", 1, AttemptStatus::Failed),
            ("001", 2, AttemptStatus::Completed),
            ("002", 1, AttemptStatus::Completed),
        ]
    );
    let retried = &agent.requests()[1];
    assert!(retried.prompt.contains("compiler exploded"));
}

/// Skipping a failed task does not satisfy its dependents, so the execution
/// is held as blocked until the dependent is skipped too.
#[test]
fn skipping_a_dependency_blocks_its_dependents() {
    let project = project();
    let agent = Arc::new(ScriptedAgent::new(vec![ScriptedResponse::failure("nope")]));
    let engine = project
        .engine(agent.clone(), Arc::new(FakeVcs::new()))
        .expect("engine");
    let id = start_execution(&engine, "v1").expect("start").id;

    engine.run(&id, &DETACH).expect("first run");
    skip_task(&engine, &id, "001").expect("skip 001");
    assert!(project.read_index().expect("index").contains("- [~] 001"));

    let blocked = resume_stale(&engine, &id, &DETACH).expect("blocked run");
    assert_eq!(blocked.stop, LoopStop::Detached);
    assert_eq!(execution_status(&engine, &id), (ExecutionStatus::Paused, true));
    let blocked_by = project.events.events().into_iter().find_map(|event| match event {
        ExecutionEvent::Blocked { blocked_by } => Some(blocked_by),
        _ => None,
    });
    assert_eq!(blocked_by, Some(vec!["002".to_string()]));

    skip_task(&engine, &id, "002").expect("skip 002");
    let finished = resume_stale(&engine, &id, &DETACH).expect("final run");
    assert_eq!(finished.stop, LoopStop::Completed);
    assert_eq!(finished.tasks_completed, 0);
    agent.assert_drained();
}

/// Crash recovery: a second engine over the same state finds the stale
/// execution and continues from the first task that is still pending.
#[test]
fn stale_execution_resumes_from_first_pending_task() {
    let project = project();
    let id = {
        let agent = Arc::new(ScriptedAgent::new(vec![ScriptedResponse::files(
            "001",
            &[("a.txt", "a")],
        )]));
        let engine = project
            .engine(agent, Arc::new(FakeVcs::new()))
            .expect("first engine");
        let id = start_execution(&engine, "v1").expect("start").id;
        let step = run_step(&engine, &id).expect("step");
        assert!(matches!(step, StepOutcome::TaskCompleted { ref task_id, .. } if task_id == "001"));
        id
    };

    let agent = Arc::new(ScriptedAgent::new(vec![ScriptedResponse::files(
        "002",
        &[("b.txt", "b")],
    )]));
    let engine = project
        .engine(agent.clone(), Arc::new(FakeVcs::new()))
        .expect("second engine");

    let stale = find_stale(&engine).expect("stale");
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, id);
    assert_eq!(stale[0].completed_tasks, 1);

    let outcome = resume_stale(&engine, &id, &LoopOptions::default()).expect("resume");
    assert_eq!(outcome.stop, LoopStop::Completed);
    assert_eq!(outcome.tasks_completed, 1);
    let requests = agent.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].task_id, "002");
    assert!(find_stale(&engine).expect("stale after").is_empty());
}

/// Abort with real git: the agent aborts the execution while working on the
/// third task, and the working tree returns to the start snapshot.
#[test]
fn abort_rolls_back_to_start_snapshot() {
    let project = TestProject::new(
        "## M1: Basics\n- [ ] 001: Write a\n- [ ] 002: Write b\n- [ ] 003: Write c\n",
        &[],
    )
    .expect("project");
    project.init_git().expect("git");
    let original_index = project.read_index().expect("index");
    let start_commit = git_head(project.root());

    let agent = Arc::new(ScriptedAgent::new(vec![
        ScriptedResponse::files("001", &[("a.txt", "a")]),
        ScriptedResponse::files("002", &[("nested/b.txt", "b")]),
    ]));
    let engine = Arc::new(
        project
            .engine(agent.clone(), Arc::new(GitVersionControl))
            .expect("engine"),
    );
    let execution = start_execution(&engine, "v1").expect("start");
    assert_eq!(
        execution.pre_execution_commit_ref.as_deref(),
        Some(start_commit.as_str())
    );

    let aborter = Arc::clone(&engine);
    let id = execution.id.clone();
    agent.push(ScriptedResponse::with(move |_| {
        abort_execution(&aborter, &id)?;
        Ok(AgentResponse::success(task_output_json(
            "003",
            &[("c.txt", "c")],
        )))
    }));

    let outcome = engine
        .run(&execution.id, &LoopOptions::default())
        .expect("loop");
    assert_eq!(outcome.stop, LoopStop::Aborted);
    assert_eq!(outcome.tasks_completed, 2);

    for path in ["a.txt", "nested/b.txt", "c.txt"] {
        assert!(!project.root().join(path).exists(), "{path} survived rollback");
    }
    assert_eq!(project.read_index().expect("index"), original_index);
    assert_eq!(git_head(project.root()), start_commit);
    assert!(project.paths.config_path.exists());

    let (status, _) = execution_status(&engine, &execution.id);
    assert_eq!(status, ExecutionStatus::Aborted);
    let attempts = engine.store().list_attempts(&execution.id).expect("attempts");
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[2].status, AttemptStatus::Failed);
    assert_eq!(project.events.names().last(), Some(&"aborted"));
}
