//! One orchestration step.
//!
//! A step re-derives the plan from the documents, selects the next task, and
//! either finishes the execution, holds it (blocked or invalid plan), or
//! runs one attempt at the selected task:
//!
//! 1. record the current task and a `running` attempt, emit `task_started`
//! 2. render the prompt and invoke the agent
//! 3. discard the output if the execution was aborted meanwhile
//! 4. parse and validate the output, write its files, tick the index
//!
//! Any failure in 2-4 fails the attempt and holds the execution for an
//! operator decision. Records are persisted before their event is emitted.
//!
//! An abort can land at any point of a step. The store refuses to change a
//! terminal execution, and a step that runs into that refusal stops with the
//! execution's final status instead of reporting what it was doing.

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::control::hold;
use crate::core::calculator::{NextTask, next_task, progress};
use crate::core::invariants::validate_plan;
use crate::core::output::{parse_task_output, validate_output_for_task};
use crate::core::types::{ExecutionPlan, Milestone, Task, TaskStatus};
use crate::engine::Engine;
use crate::io::agent::AgentRequest;
use crate::io::code_writer::write_output;
use crate::io::events::ExecutionEvent;
use crate::io::prompt::{PromptInputs, plan_summary};
use crate::io::store::{
    AttemptStatus, Execution, ExecutionFinished, ExecutionStatus, ProgressUpdate, TaskAttempt,
};
use crate::phase;

const DISCARDED: &str = "execution aborted before output was applied";

/// What a single step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    TaskCompleted {
        task_id: String,
        files_written: usize,
    },
    /// The attempt failed and the execution is held.
    TaskFailed { task_id: String, error: String },
    /// No task is selectable; the execution is held.
    Blocked { blocked_by: Vec<String> },
    /// The plan has structural defects; the execution is held.
    InvalidPlan { defects: Vec<String> },
    /// Every task is done; the execution is completed.
    Finished,
    /// The execution is missing (`None`) or already terminal; nothing was done.
    Stopped(Option<ExecutionStatus>),
}

#[instrument(skip_all, fields(execution_id = %execution_id))]
pub fn run_step(engine: &Engine, execution_id: &str) -> Result<StepOutcome> {
    match step(engine, execution_id) {
        Err(err) => match err.downcast_ref::<ExecutionFinished>() {
            Some(finished) => {
                info!(status = finished.status.as_str(), "execution finished during step");
                Ok(StepOutcome::Stopped(Some(finished.status)))
            }
            None => Err(err),
        },
        outcome => outcome,
    }
}

fn step(engine: &Engine, execution_id: &str) -> Result<StepOutcome> {
    let Some(execution) = engine.store.get_execution(execution_id)? else {
        return Ok(StepOutcome::Stopped(None));
    };
    if execution.status.is_terminal() {
        return Ok(StepOutcome::Stopped(Some(execution.status)));
    }

    let plan = engine.load_plan().context("re-derive plan")?;
    let defects = validate_plan(&plan);
    if !defects.is_empty() {
        let defects: Vec<String> = defects.iter().map(ToString::to_string).collect();
        hold(engine, execution_id)?;
        engine.emit(
            execution_id,
            ExecutionEvent::Error {
                message: format!("plan is invalid: {}", defects.join("; ")),
            },
        );
        return Ok(StepOutcome::InvalidPlan { defects });
    }

    match next_task(&plan) {
        NextTask::AllCompleted | NextTask::NoPending => finish(engine, &execution, &plan),
        NextTask::Blocked { blocked_by } => {
            hold(engine, execution_id)?;
            engine.emit(
                execution_id,
                ExecutionEvent::Blocked {
                    blocked_by: blocked_by.clone(),
                },
            );
            Ok(StepOutcome::Blocked { blocked_by })
        }
        NextTask::Ready { task, milestone } => {
            execute_task(engine, &execution, &plan, task, milestone)
        }
    }
}

fn finish(engine: &Engine, execution: &Execution, plan: &ExecutionPlan) -> Result<StepOutcome> {
    let summary = progress(plan);
    engine.store.update_progress(
        &execution.id,
        &ProgressUpdate {
            total_tasks: summary.total,
            completed_tasks: summary.completed,
            current_task_id: None,
        },
    )?;
    engine.note_transition(execution.status, "complete");
    engine
        .store
        .complete(&execution.id, ExecutionStatus::Completed)?;
    phase::advance(engine, &execution.version_id, "complete");
    info!(completed = summary.completed, total = summary.total, "execution completed");
    engine.emit(&execution.id, ExecutionEvent::Completed);
    Ok(StepOutcome::Finished)
}

/// Result of one attempt before it is recorded.
enum Attempted {
    Applied {
        files_written: usize,
        summary: String,
    },
    Rejected(String),
    Discarded,
}

fn execute_task(
    engine: &Engine,
    execution: &Execution,
    plan: &ExecutionPlan,
    task: &Task,
    milestone: &Milestone,
) -> Result<StepOutcome> {
    let before = progress(plan);
    engine.store.update_progress(
        &execution.id,
        &ProgressUpdate {
            total_tasks: before.total,
            completed_tasks: before.completed,
            current_task_id: Some(task.id.clone()),
        },
    )?;
    let attempt = engine.store.create_attempt(&execution.id, &task.id)?;
    phase::advance(engine, &execution.version_id, "task_started");
    info!(task_id = %task.id, attempt = attempt.attempt_number, "task started");
    engine.emit(
        &execution.id,
        ExecutionEvent::TaskStarted {
            task_id: task.id.clone(),
            attempt_number: attempt.attempt_number,
        },
    );

    let attempted = attempt_task(engine, execution, plan, task, milestone, &attempt)
        .unwrap_or_else(|err| Attempted::Rejected(format!("{err:#}")));

    match attempted {
        Attempted::Applied {
            files_written,
            summary,
        } => {
            engine.store.finish_attempt(
                &execution.id,
                &attempt.id,
                AttemptStatus::Completed,
                None,
            )?;
            let mut after = plan.clone();
            after.set_status(&task.id, TaskStatus::Completed);
            let after = progress(&after);
            engine.store.update_progress(
                &execution.id,
                &ProgressUpdate {
                    total_tasks: after.total,
                    completed_tasks: after.completed,
                    current_task_id: None,
                },
            )?;
            phase::advance(engine, &execution.version_id, "task_succeeded");
            info!(task_id = %task.id, files_written, "task done");
            engine.emit(
                &execution.id,
                ExecutionEvent::TaskDone {
                    task_id: task.id.clone(),
                    files_written,
                    summary,
                },
            );
            engine.emit(
                &execution.id,
                ExecutionEvent::Progress {
                    completed: after.completed,
                    total: after.total,
                    percent: after.percent,
                },
            );
            Ok(StepOutcome::TaskCompleted {
                task_id: task.id.clone(),
                files_written,
            })
        }
        Attempted::Rejected(error) => {
            engine.store.finish_attempt(
                &execution.id,
                &attempt.id,
                AttemptStatus::Failed,
                Some(error.clone()),
            )?;
            hold(engine, &execution.id)?;
            phase::advance(engine, &execution.version_id, "task_failed");
            engine.emit(
                &execution.id,
                ExecutionEvent::TaskFailed {
                    task_id: task.id.clone(),
                    error: error.clone(),
                },
            );
            Ok(StepOutcome::TaskFailed {
                task_id: task.id.clone(),
                error,
            })
        }
        Attempted::Discarded => {
            let status = engine
                .store
                .get_execution(&execution.id)?
                .map(|current| current.status);
            if let Err(err) = engine.store.finish_attempt(
                &execution.id,
                &attempt.id,
                AttemptStatus::Failed,
                Some(DISCARDED.to_string()),
            ) {
                warn!(err = %format!("{err:#}"), "could not close discarded attempt");
            }
            info!(task_id = %task.id, "agent output discarded after abort");
            Ok(StepOutcome::Stopped(status))
        }
    }
}

fn attempt_task(
    engine: &Engine,
    execution: &Execution,
    plan: &ExecutionPlan,
    task: &Task,
    milestone: &Milestone,
    attempt: &TaskAttempt,
) -> Result<Attempted> {
    let previous_failure = engine
        .store
        .list_attempts(&execution.id)?
        .into_iter()
        .rev()
        .find(|a| a.task_id == task.id && a.id != attempt.id && a.status == AttemptStatus::Failed)
        .and_then(|a| a.error_message);

    let prompt = engine.prompts.build(&PromptInputs {
        task,
        milestone: Some(milestone),
        plan_summary: plan_summary(plan),
        previous_failure,
    })?;
    let request = AgentRequest {
        task_id: task.id.clone(),
        prompt,
        working_directory: execution.working_directory.clone(),
        timeout: engine.config.agent_timeout(),
    };
    let response = engine.agent.invoke(&request);

    // an abort issued while the agent ran wins over its output
    if engine.is_aborted(&execution.id)? {
        return Ok(Attempted::Discarded);
    }

    let response = response.context("agent invocation failed")?;
    if !response.succeeded {
        let detail = response
            .error_detail
            .unwrap_or_else(|| "agent reported failure without detail".to_string());
        return Ok(Attempted::Rejected(format!("agent failed: {detail}")));
    }

    let output = match parse_task_output(&response.raw_output) {
        Ok(output) => output,
        Err(err) => return Ok(Attempted::Rejected(format!("unparsable agent output: {err}"))),
    };
    let validation = validate_output_for_task(&output, &task.id);
    if !validation.valid {
        return Ok(Attempted::Rejected(format!(
            "invalid agent output: {}",
            validation.errors.join("; ")
        )));
    }

    let results = write_output(&output, &execution.working_directory);
    let failures: Vec<String> = results
        .iter()
        .filter_map(|r| r.error.as_ref().map(|error| format!("{}: {error}", r.path)))
        .collect();
    if !failures.is_empty() {
        return Ok(Attempted::Rejected(format!(
            "file writes failed ({} of {}): {}",
            failures.len(),
            results.len(),
            failures.join("; ")
        )));
    }

    if engine.is_aborted(&execution.id)? {
        return Ok(Attempted::Discarded);
    }
    let marked = engine
        .mark_task_unless_aborted(&execution.id, &task.id, TaskStatus::Completed)
        .map_err(|err| anyhow!("files written but index not updated: {err:#}"))?;
    if !marked {
        return Ok(Attempted::Discarded);
    }
    Ok(Attempted::Applied {
        files_written: results.len(),
        summary: output.summary,
    })
}
