//! Shell command backend
//!
//! Task parameters:
//!
//! - `command` (string, required): program to run, no shell interpolation
//! - `args` (list of strings)
//! - `workdir` (string)
//! - `env` (map of strings)

use crate::backends::{truncate_output_bytes, AgentInfo, TaskBackend, TaskOutput, TaskRequest};
use crate::control::CancelSignal;
use crate::error::TaskError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
struct ShellParams {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

impl ShellParams {
    fn from_request(request: &TaskRequest) -> Result<Self, TaskError> {
        let params: ShellParams =
            serde_json::from_value(Value::Object(request.parameters.clone())).map_err(|e| {
                TaskError::Failed(format!(
                    "invalid shell parameters for task '{}': {e}",
                    request.task
                ))
            })?;
        if params.command.trim().is_empty() {
            return Err(TaskError::Failed("shell command cannot be empty".into()));
        }
        Ok(params)
    }
}

/// Runs each task as a local child process
#[derive(Debug, Clone, Default)]
pub struct ShellBackend;

impl ShellBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskBackend for ShellBackend {
    async fn execute_task(
        &self,
        request: &TaskRequest,
        agent: &AgentInfo,
        cancel: CancelSignal,
    ) -> Result<TaskOutput, TaskError> {
        let params = ShellParams::from_request(request)?;

        info!(
            task = %request.task,
            agent = %agent.id,
            attempt = request.attempt,
            "Executing shell command: {}",
            params.command
        );
        debug!("Command args: {:?}", params.args);

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args);
        if let Some(workdir) = &params.workdir {
            cmd.current_dir(workdir);
        }
        cmd.envs(&request.context);
        cmd.envs(&params.env);
        cmd.env("FLOWPLANE_FLOW_ID", request.flow_id.to_string());
        cmd.env("FLOWPLANE_AGENT_ID", &agent.id);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Dropping the output future on cancel or timeout kills the child
        cmd.kill_on_drop(true);

        let start = std::time::Instant::now();
        let output = tokio::select! {
            output = cmd.output() => output.map_err(anyhow::Error::from)?,
            _ = cancel.cancelled() => {
                warn!(task = %request.task, "Shell command cancelled");
                return Err(TaskError::Cancelled);
            }
        };

        let (stdout, stdout_truncated) = truncate_output_bytes(&output.stdout);
        let (stderr, stderr_truncated) = truncate_output_bytes(&output.stderr);
        let exit_code = output.status.code();

        info!(
            task = %request.task,
            "Command completed (exit code: {:?}) in {:?}",
            exit_code,
            start.elapsed()
        );

        if !output.status.success() {
            let tail = stderr.lines().last().unwrap_or_default();
            return Err(TaskError::Failed(format!(
                "command exited with {exit_code:?}: {tail}"
            )));
        }

        Ok(TaskOutput::new(json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
            "output_truncated": stdout_truncated || stderr_truncated,
        })))
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("Shell backend health check failed"))
        }
    }
}
