//! Development-phase bookkeeping per version id.
//!
//! The loop drives the development machine with lifecycle signals
//! (`start_execution`, `task_started`, `task_succeeded`, `task_failed`,
//! `complete`, `abort`). Those advances are best-effort: a rejected
//! transition is logged and never touches execution progress.

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::engine::Engine;

/// Current development phase (the machine's initial state if none recorded).
pub fn current_phase(engine: &Engine, version_id: &str) -> Result<String> {
    let stored = engine.store.get_phase(version_id)?;
    Ok(stored.unwrap_or_else(|| engine.development.initial_state().to_string()))
}

/// Apply `event` and persist the new phase; errors on an invalid transition.
pub fn fire(engine: &Engine, version_id: &str, event: &str) -> Result<String> {
    let current = current_phase(engine, version_id)?;
    let next = engine
        .development
        .transition(&current, event)
        .with_context(|| format!("advance development phase of {version_id}"))?;
    engine.store.set_phase(version_id, &next)?;
    debug!(version_id, from = %current, to = %next, event, "development phase advanced");
    Ok(next)
}

/// [`fire`], logging instead of failing.
pub(crate) fn advance(engine: &Engine, version_id: &str, event: &str) -> Option<String> {
    match fire(engine, version_id, event) {
        Ok(next) => Some(next),
        Err(err) => {
            warn!(version_id, event, err = %format!("{err:#}"), "development phase not advanced");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_support::{FakeVcs, ScriptedAgent, TestProject};

    fn engine(project: &TestProject) -> Engine {
        project
            .engine(Arc::new(ScriptedAgent::default()), Arc::new(FakeVcs::new()))
            .expect("engine")
    }

    #[test]
    fn unrecorded_version_starts_at_initial_state() {
        let project = TestProject::new("", &[]).expect("project");
        let engine = engine(&project);
        assert_eq!(current_phase(&engine, "v1").expect("phase"), "authoring");
    }

    #[test]
    fn fire_persists_valid_transitions_only() {
        let project = TestProject::new("", &[]).expect("project");
        let engine = engine(&project);

        assert_eq!(fire(&engine, "v1", "scaffold").expect("scaffold"), "scaffolding");
        assert_eq!(fire(&engine, "v1", "review").expect("review"), "reviewing");
        assert!(fire(&engine, "v1", "complete").is_err());
        assert_eq!(current_phase(&engine, "v1").expect("phase"), "reviewing");
        assert_eq!(current_phase(&engine, "v2").expect("other"), "authoring");
    }

    #[test]
    fn advance_swallows_rejected_events() {
        let project = TestProject::new("", &[]).expect("project");
        let engine = engine(&project);
        assert_eq!(advance(&engine, "v1", "task_succeeded"), None);
        assert_eq!(current_phase(&engine, "v1").expect("phase"), "authoring");
    }
}
