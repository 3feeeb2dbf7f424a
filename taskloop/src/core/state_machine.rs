//! Generic declarative state machine.
//!
//! A machine is a set of declared states plus `(event, from, to)` transitions.
//! Configs are validated when loaded: every `from`/`to` and the initial state
//! must be declared, so a loaded [`StateMachine`] can only fail a transition
//! because no rule matches.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEVELOPMENT_MACHINE: &str = include_str!("machines/development.toml");
pub const RUNTIME_MACHINE: &str = include_str!("machines/runtime.toml");

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateMachineError {
    #[error("{machine}: no transition for event '{event}' from state '{state}'")]
    InvalidTransition {
        machine: String,
        state: String,
        event: String,
    },

    #[error("{machine}: unknown state '{state}'")]
    UnknownState { machine: String, state: String },

    #[error("{machine}: {role} references undeclared state '{state}'")]
    UndeclaredState {
        machine: String,
        role: &'static str,
        state: String,
    },

    #[error("invalid state machine config: {0}")]
    Config(String),
}

/// One state or a set of states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn contains(&self, state: &str) -> bool {
        match self {
            OneOrMany::One(s) => s == state,
            OneOrMany::Many(states) => states.iter().any(|s| s == state),
        }
    }

    pub fn states(&self) -> Vec<&str> {
        match self {
            OneOrMany::One(s) => vec![s.as_str()],
            OneOrMany::Many(states) => states.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRule {
    pub event: String,
    pub from: OneOrMany,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachineConfig {
    pub name: String,
    pub initial_state: String,
    pub states: Vec<String>,
    #[serde(default)]
    pub transitions: Vec<TransitionRule>,
}

/// A validated, immutable state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    config: StateMachineConfig,
}

impl StateMachine {
    /// Validate `config` and build a machine from it.
    pub fn new(config: StateMachineConfig) -> Result<Self, StateMachineError> {
        let declared: HashSet<&str> = config.states.iter().map(String::as_str).collect();
        if declared.is_empty() {
            return Err(StateMachineError::Config(format!(
                "{}: states must be non-empty",
                config.name
            )));
        }

        let undeclared = |role: &'static str, state: &str| StateMachineError::UndeclaredState {
            machine: config.name.clone(),
            role,
            state: state.to_string(),
        };

        if !declared.contains(config.initial_state.as_str()) {
            return Err(undeclared("initial_state", &config.initial_state));
        }
        for rule in &config.transitions {
            for from in rule.from.states() {
                if !declared.contains(from) {
                    return Err(undeclared("transition 'from'", from));
                }
            }
            if !declared.contains(rule.to.as_str()) {
                return Err(undeclared("transition 'to'", &rule.to));
            }
        }

        Ok(Self { config })
    }

    /// Parse a TOML config document and validate it.
    pub fn from_toml(source: &str) -> Result<Self, StateMachineError> {
        let config: StateMachineConfig =
            toml::from_str(source).map_err(|err| StateMachineError::Config(err.to_string()))?;
        Self::new(config)
    }

    pub fn development() -> Result<Self, StateMachineError> {
        Self::from_toml(DEVELOPMENT_MACHINE)
    }

    pub fn runtime() -> Result<Self, StateMachineError> {
        Self::from_toml(RUNTIME_MACHINE)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn initial_state(&self) -> &str {
        &self.config.initial_state
    }

    pub fn is_state(&self, state: &str) -> bool {
        self.config.states.iter().any(|s| s == state)
    }

    /// Next state for `event` from `current`. The first matching rule wins.
    pub fn transition(&self, current: &str, event: &str) -> Result<String, StateMachineError> {
        if !self.is_state(current) {
            return Err(StateMachineError::UnknownState {
                machine: self.config.name.clone(),
                state: current.to_string(),
            });
        }
        self.config
            .transitions
            .iter()
            .find(|rule| rule.event == event && rule.from.contains(current))
            .map(|rule| rule.to.clone())
            .ok_or_else(|| StateMachineError::InvalidTransition {
                machine: self.config.name.clone(),
                state: current.to_string(),
                event: event.to_string(),
            })
    }

    /// Events accepted from `current`, in declaration order without repeats.
    pub fn available_events(&self, current: &str) -> Vec<&str> {
        let mut events: Vec<&str> = Vec::new();
        for rule in &self.config.transitions {
            if rule.from.contains(current) && !events.contains(&rule.event.as_str()) {
                events.push(rule.event.as_str());
            }
        }
        events
    }
}
