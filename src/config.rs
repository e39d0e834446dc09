//! Engine configuration
//!
//! Values are layered: built-in defaults, then an optional YAML/TOML/JSON file,
//! then `FLOWPLANE__*` environment variables (for example
//! `FLOWPLANE__MAX_CONCURRENT_FLOWS=8`).

use crate::error::{EngineError, Result};
use crate::policy::PolicyKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const ENV_PREFIX: &str = "FLOWPLANE";

/// Agent declared in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Max concurrent tasks
    #[serde(default = "default_agent_capacity")]
    pub capacity: u32,
}

fn default_agent_capacity() -> u32 {
    4
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            capabilities: BTreeSet::new(),
            capacity,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_flows: usize,
    pub scheduling_policy: PolicyKind,
    /// Per-task default; tasks may override
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Random fraction of the backoff added as jitter
    pub retry_jitter: f64,
    pub task_timeout_secs: u64,
    pub flow_timeout_secs: u64,
    /// Scheduler tick period when no completion event wakes it earlier
    pub tick_interval_ms: u64,
    /// Buffer size of the event broadcast channel
    pub event_capacity: usize,
    pub agents: Vec<AgentConfig>,
    /// Capacity overrides keyed by agent id
    pub resource_capacity_per_agent: HashMap<String, u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_flows: 4,
            scheduling_policy: PolicyKind::default(),
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            retry_jitter: 0.1,
            task_timeout_secs: 300,
            flow_timeout_secs: 3_600,
            tick_interval_ms: 250,
            event_capacity: 1_024,
            agents: vec![AgentConfig::new("local", default_agent_capacity())],
            resource_capacity_per_agent: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(EngineError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_flows == 0 {
            return Err(EngineError::Config(
                "max_concurrent_flows must be at least 1".into(),
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(EngineError::Config(format!(
                "retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(EngineError::Config(
                "retry_jitter must be between 0.0 and 1.0".into(),
            ));
        }
        if self.task_timeout_secs == 0 || self.flow_timeout_secs == 0 {
            return Err(EngineError::Config("timeouts must be non-zero".into()));
        }
        if self.tick_interval_ms == 0 || self.event_capacity == 0 {
            return Err(EngineError::Config(
                "tick_interval_ms and event_capacity must be non-zero".into(),
            ));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
            if self.agent_capacity(agent) == 0 {
                return Err(EngineError::Config(format!(
                    "agent '{}' must have a capacity of at least 1",
                    agent.id
                )));
            }
        }
        for id in self.resource_capacity_per_agent.keys() {
            if !seen.contains(id.as_str()) {
                return Err(EngineError::Config(format!(
                    "capacity override for unknown agent '{id}'"
                )));
            }
        }
        Ok(())
    }

    /// Declared capacity, unless overridden by `resource_capacity_per_agent`
    pub fn agent_capacity(&self, agent: &AgentConfig) -> u32 {
        self.resource_capacity_per_agent
            .get(&agent.id)
            .copied()
            .unwrap_or(agent.capacity)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn flow_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
