//! Execution loop: repeat [`run_step`] until the execution ends.
//!
//! Each iteration first passes the pause gate, which polls the persisted
//! pause flag at `poll_interval_ms` while it is set. Pause and abort signals
//! only travel through the store, so a loop restarted after a crash behaves
//! exactly like the one it replaces.

use std::thread;

use anyhow::Result;
use tracing::{debug, error, info, instrument, warn};

use crate::control::hold;
use crate::engine::Engine;
use crate::io::events::ExecutionEvent;
use crate::io::store::ExecutionStatus;
use crate::step::{StepOutcome, run_step};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopOptions {
    /// Return [`LoopStop::Detached`] on pause instead of polling the flag.
    pub detach_on_pause: bool,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    Completed,
    Aborted,
    /// Ended in `failed` by some other actor.
    Failed,
    /// The execution record no longer exists.
    Missing,
    /// Paused with [`LoopOptions::detach_on_pause`]; continue with resume.
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub stop: LoopStop,
}

enum Gate {
    Open,
    Stop(LoopStop),
}

fn stop_for(status: Option<ExecutionStatus>) -> Option<LoopStop> {
    match status {
        None => Some(LoopStop::Missing),
        Some(ExecutionStatus::Completed) => Some(LoopStop::Completed),
        Some(ExecutionStatus::Aborted) => Some(LoopStop::Aborted),
        Some(ExecutionStatus::Failed) => Some(LoopStop::Failed),
        Some(ExecutionStatus::Running | ExecutionStatus::Paused) => None,
    }
}

/// Wait while the pause flag is set. Emits `paused` once on entry and
/// `resumed` when the flag clears.
fn pause_gate(engine: &Engine, execution_id: &str, options: &LoopOptions) -> Result<Gate> {
    let mut announced = false;
    loop {
        let execution = engine.store.get_execution(execution_id)?;
        if let Some(stop) = stop_for(execution.as_ref().map(|e| e.status)) {
            return Ok(Gate::Stop(stop));
        }
        let paused = execution.is_some_and(|e| e.is_paused);
        if !paused {
            if announced {
                engine.emit(execution_id, ExecutionEvent::Resumed);
            }
            return Ok(Gate::Open);
        }
        if !announced {
            engine.emit(execution_id, ExecutionEvent::Paused);
            announced = true;
            if options.detach_on_pause {
                return Ok(Gate::Stop(LoopStop::Detached));
            }
        }
        thread::sleep(engine.config.poll_interval());
    }
}

/// Drive `execution_id` until it completes, is aborted, or (optionally) pauses.
///
/// A step error never ends the loop: it is reported as an `error` event and
/// the execution is held like a failed task.
#[instrument(skip_all, fields(execution_id = %execution_id))]
pub fn run_loop(engine: &Engine, execution_id: &str, options: &LoopOptions) -> Result<LoopOutcome> {
    let mut outcome = LoopOutcome {
        tasks_completed: 0,
        tasks_failed: 0,
        stop: LoopStop::Missing,
    };
    info!(detach_on_pause = options.detach_on_pause, "execution loop started");

    loop {
        if let Gate::Stop(stop) = pause_gate(engine, execution_id, options)? {
            outcome.stop = stop;
            break;
        }

        match run_step(engine, execution_id) {
            Ok(StepOutcome::Finished) => {
                outcome.stop = LoopStop::Completed;
                break;
            }
            Ok(StepOutcome::Stopped(status)) => {
                outcome.stop = stop_for(status).unwrap_or(LoopStop::Missing);
                break;
            }
            Ok(StepOutcome::TaskCompleted { .. }) => outcome.tasks_completed += 1,
            Ok(StepOutcome::TaskFailed { .. }) => outcome.tasks_failed += 1,
            Ok(StepOutcome::Blocked { .. } | StepOutcome::InvalidPlan { .. }) => {
                debug!("execution held; waiting for operator");
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = %message, "step failed");
                if let Err(hold_err) = hold(engine, execution_id) {
                    warn!(err = %format!("{hold_err:#}"), "could not hold execution after error");
                }
                engine.emit(execution_id, ExecutionEvent::Error { message });
            }
        }
    }

    info!(
        stop = ?outcome.stop,
        tasks_completed = outcome.tasks_completed,
        tasks_failed = outcome.tasks_failed,
        "execution loop stopped"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::control::{abort_execution, resume_execution, skip_task};
    use crate::start::start_execution;
    use crate::test_support::{FakeVcs, ScriptedAgent, ScriptedResponse, TestProject};

    const INDEX: &str = "## M1: One\n- [ ] 001: First\n- [ ] 002: Second\n";
    const DETAIL: &str = "## 002: Second\n\nDepends: 001\n";

    fn project() -> TestProject {
        TestProject::new(INDEX, &[("M1.md", DETAIL)]).expect("project")
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn loop_runs_every_task_then_completes() {
        let project = project();
        let agent = Arc::new(ScriptedAgent::new(vec![
            ScriptedResponse::files("001", &[("a.txt", "a")]),
            ScriptedResponse::files("002", &[("b.txt", "b")]),
        ]));
        let engine = project
            .engine(agent.clone(), Arc::new(FakeVcs::new()))
            .expect("engine");
        let id = start_execution(&engine, "v1").expect("start").id;

        let outcome = engine.run(&id, &LoopOptions::default()).expect("loop");
        assert_eq!(
            outcome,
            LoopOutcome {
                tasks_completed: 2,
                tasks_failed: 0,
                stop: LoopStop::Completed,
            }
        );
        agent.assert_drained();
        assert!(!engine.is_active(&id));
        assert_eq!(project.events.names().last(), Some(&"completed"));
    }

    #[test]
    fn detached_loop_returns_on_failure() {
        let project = project();
        let agent = Arc::new(ScriptedAgent::new(vec![ScriptedResponse::failure("nope")]));
        let engine = project
            .engine(agent, Arc::new(FakeVcs::new()))
            .expect("engine");
        let id = start_execution(&engine, "v1").expect("start").id;

        let outcome = engine
            .run(&id, &LoopOptions { detach_on_pause: true })
            .expect("loop");
        assert_eq!(outcome.stop, LoopStop::Detached);
        assert_eq!(outcome.tasks_failed, 1);
        let names = project.events.names();
        assert_eq!(&names[names.len() - 2..], ["task_failed", "paused"]);
    }

    /// A paused loop polls the flag and continues once an operator skips the task.
    #[test]
    fn paused_loop_resumes_when_flag_clears() {
        let project = project();
        let agent = Arc::new(ScriptedAgent::new(vec![ScriptedResponse::failure("flaky")]));
        let engine = Arc::new(
            project
                .engine(agent.clone(), Arc::new(FakeVcs::new()))
                .expect("engine"),
        );
        let id = start_execution(&engine, "v1").expect("start").id;

        let handle = engine.spawn(&id, LoopOptions::default()).expect("spawn");
        assert!(engine.spawn(&id, LoopOptions::default()).is_err());
        wait_for(|| project.events.names().contains(&"paused"));

        // skipping 001 leaves 002 blocked, which holds the loop again
        skip_task(&engine, &id, "001").expect("skip");
        wait_for(|| project.events.names().contains(&"blocked"));
        skip_task(&engine, &id, "002").expect("skip");

        let outcome = handle.join().expect("join").expect("loop");
        assert_eq!(outcome.stop, LoopStop::Completed);
        assert!(project.events.names().contains(&"resumed"));
        agent.assert_drained();
    }

    #[test]
    fn abort_stops_a_paused_loop() {
        let project = project();
        let agent = Arc::new(ScriptedAgent::new(vec![ScriptedResponse::failure("nope")]));
        let engine = Arc::new(
            project
                .engine(agent, Arc::new(FakeVcs::new()))
                .expect("engine"),
        );
        let id = start_execution(&engine, "v1").expect("start").id;

        let handle = engine.spawn(&id, LoopOptions::default()).expect("spawn");
        wait_for(|| project.events.names().contains(&"paused"));
        abort_execution(&engine, &id).expect("abort");

        let outcome = handle.join().expect("join").expect("loop");
        assert_eq!(outcome.stop, LoopStop::Aborted);
        wait_for(|| !engine.is_active(&id));
    }

    /// Losing the index after the files were written fails the attempt and
    /// holds the execution instead of ending the loop.
    #[test]
    fn index_loss_after_writes_holds_execution() {
        let project = project();
        let index_path = project.paths.index_path(&project.config);
        let remove = index_path.clone();
        let agent = Arc::new(ScriptedAgent::default());
        agent.push(ScriptedResponse::with(move |_| {
            std::fs::remove_file(&remove)?;
            Ok(crate::io::agent::AgentResponse::success(
                crate::test_support::task_output_json("001", &[("a.txt", "a")]),
            ))
        }));
        let engine = project
            .engine(agent, Arc::new(FakeVcs::new()))
            .expect("engine");
        let id = start_execution(&engine, "v1").expect("start").id;

        let outcome = engine
            .run(&id, &LoopOptions { detach_on_pause: true })
            .expect("loop");
        assert_eq!(outcome.stop, LoopStop::Detached);
        assert_eq!(outcome.tasks_failed, 1);
        assert!(!index_path.exists());

        resume_execution(&engine, &id).expect("resume");
        let execution = engine.store().get_execution(&id).expect("get").expect("exists");
        assert!(!execution.is_paused);
    }
}
