//! Execution backends
//!
//! The engine never runs business logic itself. Each task attempt is handed to
//! a [`TaskBackend`] together with the agent the ledger leased for it.

pub mod shell;

pub use shell::ShellBackend;

use crate::control::CancelSignal;
use crate::error::TaskError;
use crate::models::{AgentId, FlowId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};

/// Max bytes of captured output kept per stream
pub const MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

/// Everything a backend needs to run one task attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub flow_id: FlowId,
    pub stage: String,
    pub task: String,
    pub task_type: String,
    pub parameters: Map<String, Value>,
    /// Flow context, passed through untouched
    pub context: HashMap<String, String>,
    /// 1 for the first attempt
    pub attempt: u32,
}

/// Agent the attempt was leased to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub capabilities: BTreeSet<String>,
}

/// Successful task output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub output: Value,
}

impl TaskOutput {
    pub fn new(output: impl Into<Value>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

/// Pluggable task execution boundary.
///
/// Implementations should watch `cancel` at their own suspension points and
/// return [`TaskError::Cancelled`] promptly once it fires. The executor also
/// stops awaiting the call when cancellation arrives, so a backend that ignores
/// the signal is dropped mid-flight.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskBackend: Send + Sync {
    async fn execute_task(
        &self,
        request: &TaskRequest,
        agent: &AgentInfo,
        cancel: CancelSignal,
    ) -> Result<TaskOutput, TaskError>;

    /// Perform a health check
    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Lossy UTF-8 of at most `MAX_OUTPUT_SIZE` bytes.
///
/// Returns (output, was_truncated)
pub(crate) fn truncate_output_bytes(data: &[u8]) -> (String, bool) {
    let truncated = data.len() > MAX_OUTPUT_SIZE;
    let bytes = if truncated {
        &data[..MAX_OUTPUT_SIZE]
    } else {
        data
    };
    (String::from_utf8_lossy(bytes).into_owned(), truncated)
}
