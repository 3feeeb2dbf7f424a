//! Validation for `taskloop validate`: config, state machines, and plan structure.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::invariants::{PlanDefect, validate_plan};
use crate::io::config::load_config;
use crate::io::init::TaskloopPaths;
use crate::select::plan_from_root;

/// High-level validation outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub milestones: usize,
    pub tasks: usize,
    pub defects: Vec<PlanDefect>,
}

impl ValidateOutcome {
    pub fn is_valid(&self) -> bool {
        self.defects.is_empty()
    }
}

/// Config and state-machine problems are errors; plan defects are reported.
pub fn validate_project(root: &Path) -> Result<ValidateOutcome> {
    let paths = TaskloopPaths::new(root);
    let config = load_config(&paths.config_path).context("load config.toml")?;
    config
        .load_state_machines(root)
        .context("load state machines")?;
    let plan = plan_from_root(root)?;
    Ok(ValidateOutcome {
        milestones: plan.milestones.len(),
        tasks: plan.total_tasks,
        defects: validate_plan(&plan),
    })
}
