//! Orchestrator configuration stored under `.taskloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::state_machine::StateMachine;
use crate::io::atomic::write_atomic;

/// Orchestrator configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Pause-flag polling interval while an execution is paused.
    pub poll_interval_ms: u64,

    /// Hard timeout for one agent invocation.
    pub agent_timeout_secs: u64,

    /// Agent stdout/stderr beyond this many bytes is discarded.
    pub agent_output_limit_bytes: usize,

    /// Upper bound for the rendered task prompt.
    pub prompt_budget_bytes: usize,

    pub agent: AgentConfig,
    pub plan: PlanConfig,
    pub state_machines: StateMachineFiles,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent argv; the prompt is written to its stdin.
    pub command: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
        }
    }
}

/// Plan document locations, relative to the project root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlanConfig {
    pub index_path: PathBuf,
    pub details_dir: PathBuf,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            index_path: PathBuf::from("docs/plan/TASKS.md"),
            details_dir: PathBuf::from("docs/plan/milestones"),
        }
    }
}

/// Optional TOML files replacing the built-in state machines.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StateMachineFiles {
    pub development: Option<PathBuf>,
    pub runtime: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            agent_timeout_secs: 30 * 60,
            agent_output_limit_bytes: 1_000_000,
            prompt_budget_bytes: 40_000,
            agent: AgentConfig::default(),
            plan: PlanConfig::default(),
            state_machines: StateMachineFiles::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.agent_timeout_secs == 0 {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.agent_output_limit_bytes == 0 {
            return Err(anyhow!("agent_output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes < 1_024 {
            return Err(anyhow!("prompt_budget_bytes must be >= 1024"));
        }
        if self.agent.command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.plan.index_path.as_os_str().is_empty() {
            return Err(anyhow!("plan.index_path must be set"));
        }
        if self.plan.details_dir.as_os_str().is_empty() {
            return Err(anyhow!("plan.details_dir must be set"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    /// Load the development and runtime machines, honouring overrides.
    /// Relative override paths resolve against `root`.
    pub fn load_state_machines(&self, root: &Path) -> Result<(StateMachine, StateMachine)> {
        let development = match &self.state_machines.development {
            Some(path) => load_machine(&root.join(path))?,
            None => StateMachine::development().context("built-in development machine")?,
        };
        let runtime = match &self.state_machines.runtime {
            Some(path) => load_machine(&root.join(path))?,
            None => StateMachine::runtime().context("built-in runtime machine")?,
        };
        Ok((development, runtime))
    }
}

fn load_machine(path: &Path) -> Result<StateMachine> {
    let source =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    StateMachine::from_toml(&source).with_context(|| format!("load {}", path.display()))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf)
}
