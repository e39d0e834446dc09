//! Error types for flowplane

use crate::models::FlowId;
use std::time::Duration;
use thiserror::Error;

/// Engine-level errors returned by the public API
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed flow, stage or task definition
    #[error("Invalid flow definition: {0}")]
    InvalidDefinition(String),

    /// Adding the flow or edge would close a dependency cycle
    #[error("Cyclic dependency detected: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// Flow references a dependency the engine has never seen
    #[error("Flow '{flow}' depends on unknown flow '{dependency}'")]
    UnknownDependency { flow: String, dependency: String },

    /// Unknown flow id
    #[error("Flow not found: {0}")]
    NotFound(FlowId),

    /// Not enough free capacity to reserve
    #[error("Resources exhausted: requested {requested} units, {available} available")]
    ResourceExhausted { requested: u32, available: u32 },

    /// Caller-supplied wait expired
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Orchestrator is not running")]
    NotRunning,

    #[error("Orchestrator is already running")]
    AlreadyRunning,

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration source errors
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// YAML size exceeded limit
    #[error("Flow YAML exceeds 1MB limit (size: {0} bytes)")]
    YamlSizeExceeded(usize),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors reported by an execution backend for a single task attempt
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// No registered agent provides the requested capabilities
    #[error("no agent provides capabilities {capabilities:?}")]
    AgentUnavailable { capabilities: Vec<String> },

    #[error("agent '{agent}' failed: {reason}")]
    AgentFailure { agent: String, reason: String },

    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    /// Network blips and other conditions expected to clear on retry
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("task failed: {0}")]
    Failed(String),

    #[error("task cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_message() {
        let err = EngineError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> b -> a");
    }

    #[test]
    fn test_task_error_from_anyhow() {
        let err: TaskError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, TaskError::Other(_)));
        assert_eq!(err.to_string(), "boom");
    }
}
