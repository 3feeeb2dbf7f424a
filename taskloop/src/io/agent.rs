//! Code-generation agent abstraction.
//!
//! The [`CodeAgent`] trait decouples the orchestration loop from the actual
//! agent backend. The default backend runs a configured command with the
//! prompt on stdin; tests use scripted agents that return canned responses
//! without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_with_timeout;

/// One agent invocation, scoped to a single task.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_id: String,
    pub prompt: String,
    pub working_directory: PathBuf,
    pub timeout: Duration,
}

/// What the agent reported. `raw_output` is free-form text expected to
/// contain the structured task result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    pub succeeded: bool,
    pub raw_output: String,
    pub error_detail: Option<String>,
}

impl AgentResponse {
    pub fn success(raw_output: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            raw_output: raw_output.into(),
            error_detail: None,
        }
    }

    pub fn failure(error_detail: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            raw_output: String::new(),
            error_detail: Some(error_detail.into()),
        }
    }
}

/// Abstraction over agent backends.
///
/// `Err` means the agent could not be invoked at all; an invoked agent that
/// failed is reported as `Ok` with `succeeded == false`.
pub trait CodeAgent: Send + Sync {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse>;
}

/// Agent that runs an external command (`argv`) in the working directory.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandAgent {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
        }
    }
}

impl CodeAgent for CommandAgent {
    #[instrument(skip_all, fields(task_id = %request.task_id, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        info!(program = %program, workdir = %request.working_directory.display(), "invoking agent");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.working_directory)
            .env("TASKLOOP_TASK_ID", &request.task_id);

        let output = run_with_timeout(
            cmd,
            Some(request.prompt.clone().into_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run agent command {program}"))?;

        if output.timed_out {
            warn!("agent timed out");
            return Ok(AgentResponse {
                succeeded: false,
                raw_output: output.stdout_text(),
                error_detail: Some(format!(
                    "agent timed out after {}s",
                    request.timeout.as_secs()
                )),
            });
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent exited unsuccessfully");
            return Ok(AgentResponse {
                succeeded: false,
                raw_output: output.stdout_text(),
                error_detail: Some(format!(
                    "agent exited with status {:?}: {}",
                    output.status.code(),
                    output.stderr_text().trim()
                )),
            });
        }

        if output.stdout_dropped > 0 {
            warn!(dropped = output.stdout_dropped, "agent output exceeded limit");
            return Ok(AgentResponse {
                succeeded: false,
                raw_output: output.stdout_text(),
                error_detail: Some(format!(
                    "agent output exceeded {} bytes ({} bytes dropped)",
                    self.output_limit_bytes, output.stdout_dropped
                )),
            });
        }

        debug!(stdout_bytes = output.stdout.len(), "agent completed");
        Ok(AgentResponse::success(output.stdout_text()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(dir: &std::path::Path) -> AgentRequest {
        AgentRequest {
            task_id: "001".to_string(),
            prompt: "do the thing".to_string(),
            working_directory: dir.to_path_buf(),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn command_agent_receives_prompt_on_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "printf '%s:' \"$TASKLOOP_TASK_ID\"; cat".to_string(),
            ],
            1024,
        );
        let response = agent.invoke(&request(temp.path())).expect("invoke");
        assert!(response.succeeded);
        assert_eq!(response.raw_output, "001:do the thing");
    }

    #[test]
    fn non_zero_exit_is_reported_not_raised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo boom >&2; exit 3".to_string(),
            ],
            1024,
        );
        let response = agent.invoke(&request(temp.path())).expect("invoke");
        assert!(!response.succeeded);
        let detail = response.error_detail.expect("detail");
        assert!(detail.contains("boom"), "{detail}");
    }

    #[test]
    fn truncated_output_is_a_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat >/dev/null; printf '%0500d' 0".to_string(),
            ],
            64,
        );
        let response = agent.invoke(&request(temp.path())).expect("invoke");
        assert!(!response.succeeded);
        assert_eq!(response.raw_output.len(), 64);
        let detail = response.error_detail.expect("detail");
        assert!(detail.contains("exceeded 64 bytes"), "{detail}");
    }

    #[test]
    fn missing_program_is_an_invocation_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(vec!["taskloop-no-such-agent".to_string()], 1024);
        assert!(agent.invoke(&request(temp.path())).is_err());
    }
}
