//! Stale executions: persisted as live, but with no loop in this process.
//!
//! After a crash the operator either resumes a stale execution (the loop
//! restarts from persisted state and re-derived documents) or aborts it.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Result, anyhow};
use tracing::{info, warn};

use crate::control::resume_execution;
use crate::engine::Engine;
use crate::io::store::{AttemptStatus, Execution, ExecutionStatus};
use crate::looping::{LoopOptions, LoopOutcome};

/// Non-terminal executions whose loop is not running here.
pub fn find_stale(engine: &Engine) -> Result<Vec<Execution>> {
    Ok(engine
        .store
        .find_stale()?
        .into_iter()
        .filter(|execution| !engine.is_active(&execution.id))
        .collect())
}

const INTERRUPTED: &str = "interrupted: no loop was running";

fn prepare(engine: &Engine, execution_id: &str) -> Result<()> {
    let execution = engine
        .store
        .get_execution(execution_id)?
        .ok_or_else(|| anyhow!("execution {execution_id} not found"))?;
    if execution.status.is_terminal() {
        return Err(anyhow!(
            "execution {execution_id} is {} and cannot be resumed",
            execution.status.as_str()
        ));
    }
    if engine.is_active(execution_id) {
        return Err(anyhow!("execution {execution_id} already has an active loop"));
    }
    for attempt in engine.store.list_attempts(execution_id)? {
        if attempt.status == AttemptStatus::Running {
            warn!(execution_id, task_id = %attempt.task_id, "closing attempt left running by a dead loop");
            engine.store.finish_attempt(
                execution_id,
                &attempt.id,
                AttemptStatus::Failed,
                Some(INTERRUPTED.to_string()),
            )?;
        }
    }
    if execution.is_paused || execution.status == ExecutionStatus::Paused {
        resume_execution(engine, execution_id)?;
    }
    info!(
        execution_id,
        completed = execution.completed_tasks,
        total = execution.total_tasks,
        "resuming stale execution"
    );
    Ok(())
}

/// Clear any pause and run the loop on the calling thread.
pub fn resume_stale(
    engine: &Engine,
    execution_id: &str,
    options: &LoopOptions,
) -> Result<LoopOutcome> {
    prepare(engine, execution_id)?;
    engine.run(execution_id, options)
}

/// Clear any pause and run the loop on its own thread.
pub fn spawn_stale(
    engine: &Arc<Engine>,
    execution_id: &str,
    options: LoopOptions,
) -> Result<JoinHandle<Result<LoopOutcome>>> {
    prepare(engine, execution_id)?;
    engine.spawn(execution_id, options)
}
