//! Failure classification and recovery decisions
//!
//! Every failed task attempt goes through two steps:
//!
//! 1. [`RecoveryEngine::classify`] maps the backend error onto a closed
//!    [`FailureKind`].
//! 2. [`RecoveryEngine::recover`] picks a [`RecoveryAction`] from the kind and
//!    the attempt history.
//!
//! Backoff grows exponentially per attempt (`base * 2^(attempt - 1)`), is
//! capped at `max_delay`, and carries a small random jitter so that many tasks
//! failing together do not retry in lockstep.

use crate::config::EngineConfig;
use crate::error::TaskError;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::time::Duration;
use tracing::debug;

/// Closed classification of task failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    AgentFailure,
    ResourceExhaustion,
    /// Network and other transient conditions
    Transient,
    Unknown,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::AgentFailure => "agent_failure",
            FailureKind::ResourceExhaustion => "resource_exhaustion",
            FailureKind::Transient => "transient",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the executor should do next with a failed task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Sleep, then retry on whichever agent the ledger picks
    RetryWithBackoff(Duration),
    /// Retry immediately on a different capable agent
    ReassignAgent,
    /// Wait for capacity to be released, then retry
    ReclaimAndRetry(Duration),
    /// Give up: the task settles Failed
    Escalate,
}

impl RecoveryAction {
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryAction::RetryWithBackoff(_) => "retry_with_backoff",
            RecoveryAction::ReassignAgent => "reassign_agent",
            RecoveryAction::ReclaimAndRetry(_) => "reclaim_and_retry",
            RecoveryAction::Escalate => "escalate",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecoveryAction::Escalate)
    }
}

/// Retry configuration for task execution
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay added at random, in `[0, 1]`
    pub jitter: f64,
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.max_retries,
            config.retry_base_delay(),
            config.retry_max_delay(),
        )
        .with_jitter(config.retry_jitter)
    }

    /// Deterministic part of the delay before retrying after `attempt` failed
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let millis = u64::try_from(self.base_delay.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(1u64 << exponent);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Backoff with jitter, never above `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.base_backoff(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = delay.mul_f64(self.jitter * rand::random::<f64>());
        (delay + extra).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Attempt history handed to [`RecoveryEngine::recover`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryContext {
    /// Attempts made so far, including the one that just failed
    pub attempt_count: u32,
    /// Effective retry budget for this task
    pub max_retries: u32,
    /// Registered agents that provide the task's capabilities
    pub capable_agents: usize,
    /// Agent the failed attempt ran on
    pub agent_id: Option<String>,
}

/// Stateless recovery policy
#[derive(Debug, Clone, Default)]
pub struct RecoveryEngine {
    retry: RetryConfig,
}

impl RecoveryEngine {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Map a backend error onto a failure kind
    pub fn classify(error: &TaskError) -> FailureKind {
        match error {
            TaskError::Timeout(_) => FailureKind::Timeout,
            TaskError::AgentUnavailable { .. } | TaskError::AgentFailure { .. } => {
                FailureKind::AgentFailure
            }
            TaskError::ResourceExhausted(_) => FailureKind::ResourceExhaustion,
            TaskError::Transient(_) => FailureKind::Transient,
            TaskError::Failed(_) | TaskError::Cancelled => FailureKind::Unknown,
            TaskError::Other(err) => classify_io(err),
        }
    }

    /// Choose the next step for a failed task
    pub fn recover(&self, ctx: &RecoveryContext, kind: FailureKind) -> RecoveryAction {
        if ctx.attempt_count > ctx.max_retries {
            debug!(
                attempts = ctx.attempt_count,
                max_retries = ctx.max_retries,
                "Retry budget exhausted"
            );
            return RecoveryAction::Escalate;
        }

        let delay = self.retry.backoff(ctx.attempt_count);
        match kind {
            FailureKind::Timeout | FailureKind::Transient | FailureKind::Unknown => {
                RecoveryAction::RetryWithBackoff(delay)
            }
            FailureKind::AgentFailure => match ctx.capable_agents {
                0 => RecoveryAction::Escalate,
                1 => RecoveryAction::RetryWithBackoff(delay),
                _ => RecoveryAction::ReassignAgent,
            },
            FailureKind::ResourceExhaustion => RecoveryAction::ReclaimAndRetry(delay),
        }
    }
}

fn classify_io(err: &anyhow::Error) -> FailureKind {
    let Some(io) = err.chain().find_map(|e| e.downcast_ref::<std::io::Error>()) else {
        return FailureKind::Unknown;
    };
    match io.kind() {
        ErrorKind::TimedOut => FailureKind::Timeout,
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock => FailureKind::Transient,
        ErrorKind::OutOfMemory => FailureKind::ResourceExhaustion,
        _ => FailureKind::Unknown,
    }
}
