//! Operator controls: pause, resume, abort, retry, skip.
//!
//! These act on the persisted execution record only. A running loop observes
//! them at its next pause check; nothing here signals a loop directly.

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::types::TaskStatus;
use crate::engine::Engine;
use crate::io::events::ExecutionEvent;
use crate::io::store::{Execution, ExecutionStatus};
use crate::phase;

fn require(engine: &Engine, execution_id: &str) -> Result<Execution> {
    engine
        .store
        .get_execution(execution_id)?
        .ok_or_else(|| anyhow!("execution {execution_id} not found"))
}

fn require_live(engine: &Engine, execution_id: &str) -> Result<Execution> {
    let execution = require(engine, execution_id)?;
    if execution.status.is_terminal() {
        return Err(anyhow!(
            "execution {execution_id} is already {}",
            execution.status.as_str()
        ));
    }
    Ok(execution)
}

#[instrument(skip_all, fields(execution_id = %execution_id))]
pub fn pause_execution(engine: &Engine, execution_id: &str) -> Result<Execution> {
    let execution = require(engine, execution_id)?;
    engine.check_transition(execution.status, "pause")?;
    engine.store.set_paused(execution_id, true)?;
    engine.store.set_status(execution_id, ExecutionStatus::Paused)?;
    phase::advance(engine, &execution.version_id, "pause");
    info!("execution paused by operator");
    require(engine, execution_id)
}

#[instrument(skip_all, fields(execution_id = %execution_id))]
pub fn resume_execution(engine: &Engine, execution_id: &str) -> Result<Execution> {
    let execution = require(engine, execution_id)?;
    // A loop hold that could not move the status leaves it running with the flag set.
    let flag_only = execution.status == ExecutionStatus::Running && execution.is_paused;
    if !flag_only {
        engine.check_transition(execution.status, "resume")?;
    }
    engine.store.set_paused(execution_id, false)?;
    engine.store.set_status(execution_id, ExecutionStatus::Running)?;
    phase::advance(engine, &execution.version_id, "resume");
    info!("execution resumed by operator");
    require(engine, execution_id)
}

/// What happened to the working tree during an abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    RolledBack { commit_ref: String },
    /// The execution is aborted anyway; the working tree may be partial.
    Failed { commit_ref: String, error: String },
    NoSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortOutcome {
    pub execution: Execution,
    pub rollback: RollbackOutcome,
}

/// Abort a live execution: hold the loop, restore the start snapshot, mark `aborted`.
#[instrument(skip_all, fields(execution_id = %execution_id))]
pub fn abort_execution(engine: &Engine, execution_id: &str) -> Result<AbortOutcome> {
    let execution = require(engine, execution_id)?;
    engine.check_transition(execution.status, "abort")?;

    // stop task selection before the tree is rewound
    engine.store.set_paused(execution_id, true)?;

    let rollback = match &execution.pre_execution_commit_ref {
        Some(commit_ref) => match engine
            .vcs
            .rollback(&execution.working_directory, commit_ref)
        {
            Ok(()) => RollbackOutcome::RolledBack {
                commit_ref: commit_ref.clone(),
            },
            Err(err) => {
                let error = format!("{err:#}");
                warn!(commit = %commit_ref, error = %error, "rollback failed; aborting anyway");
                RollbackOutcome::Failed {
                    commit_ref: commit_ref.clone(),
                    error,
                }
            }
        },
        None => RollbackOutcome::NoSnapshot,
    };

    engine
        .store
        .complete(execution_id, ExecutionStatus::Aborted)?;
    phase::advance(engine, &execution.version_id, "abort");
    let rollback_error = match &rollback {
        RollbackOutcome::Failed { error, .. } => Some(error.clone()),
        _ => None,
    };
    engine.emit(execution_id, ExecutionEvent::Aborted { rollback_error });
    info!(rollback = ?rollback, "execution aborted");

    Ok(AbortOutcome {
        execution: require(engine, execution_id)?,
        rollback,
    })
}

/// Reset `task_id` to pending and let the loop pick it up again.
///
/// Returns the task's status before the reset. The next selection creates a
/// new attempt row.
#[instrument(skip_all, fields(execution_id = %execution_id, task_id = %task_id))]
pub fn retry_task(engine: &Engine, execution_id: &str, task_id: &str) -> Result<TaskStatus> {
    let execution = require_live(engine, execution_id)?;
    let plan = engine.load_plan()?;
    let previous = plan
        .find_task(task_id)
        .ok_or_else(|| anyhow!("task {task_id} not found in plan"))?
        .status;
    if previous != TaskStatus::Pending {
        engine.mark_task(task_id, TaskStatus::Pending)?;
    }
    release(engine, &execution)?;
    phase::advance(engine, &execution.version_id, "retry");
    info!(previous = previous.as_str(), "task queued for retry");
    Ok(previous)
}

/// Mark `task_id` skipped. Dependents stay blocked until resolved separately.
#[instrument(skip_all, fields(execution_id = %execution_id, task_id = %task_id))]
pub fn skip_task(engine: &Engine, execution_id: &str, task_id: &str) -> Result<TaskStatus> {
    let execution = require_live(engine, execution_id)?;
    let plan = engine.load_plan()?;
    let previous = plan
        .find_task(task_id)
        .ok_or_else(|| anyhow!("task {task_id} not found in plan"))?
        .status;
    if previous != TaskStatus::Skipped {
        engine.mark_task(task_id, TaskStatus::Skipped)?;
    }
    release(engine, &execution)?;
    info!(previous = previous.as_str(), "task skipped");
    Ok(previous)
}

/// Set the pause flag on behalf of the loop (failure, block, invalid plan).
pub(crate) fn hold(engine: &Engine, execution_id: &str) -> Result<()> {
    let execution = require(engine, execution_id)?;
    engine.store.set_paused(execution_id, true)?;
    if execution.status == ExecutionStatus::Running {
        engine.note_transition(execution.status, "pause");
        engine.store.set_status(execution_id, ExecutionStatus::Paused)?;
    }
    Ok(())
}

fn release(engine: &Engine, execution: &Execution) -> Result<()> {
    engine.store.set_paused(&execution.id, false)?;
    if execution.status == ExecutionStatus::Paused {
        engine.note_transition(execution.status, "resume");
        engine
            .store
            .set_status(&execution.id, ExecutionStatus::Running)?;
    }
    Ok(())
}
