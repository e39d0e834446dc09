//! Core data models for the flowplane engine

use crate::recovery::FailureKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use uuid::Uuid;

// Input validation limits
pub const MAX_YAML_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_TASK_COUNT: usize = 1_000;
pub const MAX_NAME_LEN: usize = 64;
pub const MAX_FLOW_NAME_LEN: usize = 128;

pub const DEFAULT_PRIORITY: i32 = 5;

/// Unique flow identifier
pub type FlowId = Uuid;

/// Agent identifier (from configuration)
pub type AgentId = String;

/// Flow definition accepted by `SubmitFlow`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    /// Lower is more urgent
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: Vec<FlowId>,
    /// Abstract capacity units reserved while the flow is dispatched
    #[serde(default = "default_resource_requirements")]
    pub resource_requirements: u32,
    /// Flow-level timeout override (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub context: HashMap<String, String>,
    pub stages: Vec<StageDefinition>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_resource_requirements() -> u32 {
    1
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: DEFAULT_PRIORITY,
            deadline: None,
            dependencies: Vec::new(),
            resource_requirements: default_resource_requirements(),
            timeout_secs: None,
            context: HashMap::new(),
            stages: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_dependency(mut self, dependency: FlowId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_requirements(mut self, units: u32) -> Self {
        self.resource_requirements = units;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|s| s.tasks.len()).sum()
    }
}

/// Stage definition: an ordered phase within a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// A failed task does not fail the stage
    #[serde(default)]
    pub continue_on_task_failure: bool,
    /// A failed stage does not fail the flow
    #[serde(default)]
    pub continue_on_failure: bool,
    pub tasks: Vec<TaskDefinition>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, execution_mode: ExecutionMode) -> Self {
        Self {
            name: name.into(),
            execution_mode,
            continue_on_task_failure: false,
            continue_on_failure: false,
            tasks: Vec::new(),
        }
    }

    pub fn sequential(name: impl Into<String>) -> Self {
        Self::new(name, ExecutionMode::Sequential)
    }

    pub fn parallel(name: impl Into<String>) -> Self {
        Self::new(name, ExecutionMode::Parallel)
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn continue_on_task_failure(mut self) -> Self {
        self.continue_on_task_failure = true;
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }
}

/// How tasks inside a stage are run
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// Task definition: the atomic unit handed to an execution backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    #[serde(rename = "type", default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_agent_type: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_task_type() -> String {
    "shell".to_string()
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_type: default_task_type(),
            required_capabilities: BTreeSet::new(),
            preferred_agent_type: None,
            parameters: Map::new(),
            max_retries: None,
            timeout_secs: None,
        }
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_preferred_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.preferred_agent_type = Some(agent_type.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }
}

/// Flow lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Queued,
    Ready,
    Dispatched,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }

    /// Counts against `max_concurrent_flows`
    pub fn is_active(self) -> bool {
        matches!(
            self,
            FlowStatus::Dispatched | FlowStatus::Running | FlowStatus::Paused
        )
    }

    fn rank(self) -> u8 {
        match self {
            FlowStatus::Queued => 0,
            FlowStatus::Ready => 1,
            FlowStatus::Dispatched => 2,
            FlowStatus::Running | FlowStatus::Paused => 3,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled => 4,
        }
    }

    /// Statuses only move forward, except Running <-> Paused
    pub fn can_transition_to(self, next: FlowStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (FlowStatus::Running, FlowStatus::Paused) | (FlowStatus::Paused, FlowStatus::Running) => {
                true
            }
            _ => next.rank() > self.rank(),
        }
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlowStatus::Queued => "queued",
            FlowStatus::Ready => "ready",
            FlowStatus::Dispatched => "dispatched",
            FlowStatus::Running => "running",
            FlowStatus::Paused => "paused",
            FlowStatus::Completed => "completed",
            FlowStatus::Failed => "failed",
            FlowStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Stage progress
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

/// Task execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a flow ended up Failed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// A task escalated after recovery gave up
    TaskFailed { kind: FailureKind },
    /// Flow-level wall-clock limit expired
    FlowTimeout,
    /// A prerequisite flow failed or was cancelled
    DependencyFailed { dependency: FlowId },
    /// The engine shut down or could not hand the flow to the executor
    Aborted,
}

/// Structured cause attached to every terminal Failed flow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureCause {
    #[serde(flatten)]
    pub reason: FailureReason,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

impl FailureCause {
    pub fn task(kind: FailureKind, stage: &str, task: &str, message: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::TaskFailed { kind },
            message: message.into(),
            stage: Some(stage.to_string()),
            task: Some(task.to_string()),
        }
    }

    pub fn flow_timeout(limit: Duration) -> Self {
        Self {
            reason: FailureReason::FlowTimeout,
            message: format!("flow exceeded its {limit:?} time limit"),
            stage: None,
            task: None,
        }
    }

    pub fn dependency(dependency: FlowId, status: FlowStatus) -> Self {
        Self {
            reason: FailureReason::DependencyFailed { dependency },
            message: format!("dependency {dependency} finished as {status}"),
            stage: None,
            task: None,
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::Aborted,
            message: message.into(),
            stage: None,
            task: None,
        }
    }
}

/// Runtime task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub task_type: String,
    pub required_capabilities: BTreeSet<String>,
    pub preferred_agent_type: Option<String>,
    pub parameters: Map<String, Value>,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<AgentId>,
    pub attempt_count: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl From<TaskDefinition> for Task {
    fn from(def: TaskDefinition) -> Self {
        Self {
            name: def.name,
            task_type: def.task_type,
            required_capabilities: def.required_capabilities,
            preferred_agent_type: def.preferred_agent_type,
            parameters: def.parameters,
            max_retries: def.max_retries,
            timeout: def.timeout_secs.map(Duration::from_secs),
            status: TaskStatus::Pending,
            assigned_agent_id: None,
            attempt_count: 0,
            result: None,
            error: None,
        }
    }
}

/// Runtime stage record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub execution_mode: ExecutionMode,
    pub continue_on_task_failure: bool,
    pub continue_on_failure: bool,
    pub status: StageStatus,
    pub tasks: Vec<Task>,
}

impl From<StageDefinition> for Stage {
    fn from(def: StageDefinition) -> Self {
        Self {
            name: def.name,
            execution_mode: def.execution_mode,
            continue_on_task_failure: def.continue_on_task_failure,
            continue_on_failure: def.continue_on_failure,
            status: StageStatus::Pending,
            tasks: def.tasks.into_iter().map(Task::from).collect(),
        }
    }
}

/// Runtime flow record, owned by the orchestrator's flow table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    pub stages: Vec<Stage>,
    pub priority: i32,
    pub deadline: Option<DateTime<Utc>>,
    pub dependencies: BTreeSet<FlowId>,
    pub status: FlowStatus,
    pub resource_requirements: u32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub context: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub failure: Option<FailureCause>,
    /// Submission order, used as the final deterministic tie-break
    pub seq: u64,
}

impl Flow {
    pub fn from_definition(id: FlowId, def: FlowDefinition, seq: u64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: def.name,
            stages: def.stages.into_iter().map(Stage::from).collect(),
            priority: def.priority,
            deadline: def.deadline,
            dependencies: def.dependencies.into_iter().collect(),
            status: FlowStatus::Queued,
            resource_requirements: def.resource_requirements,
            submitted_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            context: def.context,
            timeout: def.timeout_secs.map(Duration::from_secs),
            failure: None,
            seq,
        }
    }

    /// Bucket key used by the load-balanced policy
    pub fn agent_class(&self) -> String {
        let tasks = || self.stages.iter().flat_map(|s| s.tasks.iter());
        if let Some(preferred) = tasks().find_map(|t| t.preferred_agent_type.clone()) {
            return preferred;
        }
        let capabilities: BTreeSet<&str> = tasks()
            .flat_map(|t| t.required_capabilities.iter().map(String::as_str))
            .collect();
        if capabilities.is_empty() {
            "default".to_string()
        } else {
            capabilities.into_iter().collect::<Vec<_>>().join(",")
        }
    }

    pub fn summary(&self) -> FlowSummary {
        FlowSummary {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            priority: self.priority,
            deadline: self.deadline,
            submitted_at: self.submitted_at,
            completed_at: self.completed_at,
        }
    }

    pub fn result(&self) -> FlowResult {
        let duration = match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => end.signed_duration_since(start).to_std().ok(),
            _ => None,
        };
        FlowResult {
            flow_id: self.id,
            name: self.name.clone(),
            status: self.status,
            stages: self
                .stages
                .iter()
                .map(|stage| StageResult {
                    name: stage.name.clone(),
                    status: stage.status,
                    tasks: stage
                        .tasks
                        .iter()
                        .map(|task| TaskResult {
                            name: task.name.clone(),
                            status: task.status,
                            agent_id: task.assigned_agent_id.clone(),
                            attempts: task.attempt_count,
                            output: task.result.clone(),
                            error: task.error.clone(),
                        })
                        .collect(),
                })
                .collect(),
            failure: self.failure.clone(),
            retry_count: self.retry_count,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration,
        }
    }
}

/// Outcome of a single task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub name: String,
    pub status: TaskStatus,
    pub agent_id: Option<AgentId>,
    pub attempts: u32,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// Outcome of a single stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    pub tasks: Vec<TaskResult>,
}

/// Outcome of a flow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResult {
    pub flow_id: FlowId,
    pub name: String,
    pub status: FlowStatus,
    pub stages: Vec<StageResult>,
    pub failure: Option<FailureCause>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
}

impl FlowResult {
    pub fn is_success(&self) -> bool {
        self.status == FlowStatus::Completed
    }

    pub fn task(&self, stage: &str, task: &str) -> Option<&TaskResult> {
        self.stages
            .iter()
            .find(|s| s.name == stage)
            .and_then(|s| s.tasks.iter().find(|t| t.name == task))
    }
}

/// Row returned by `ListFlows`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    pub id: FlowId,
    pub name: String,
    pub status: FlowStatus,
    pub priority: i32,
    pub deadline: Option<DateTime<Utc>>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Filter for `ListFlows`; empty filter matches everything
#[derive(Debug, Clone, Default)]
pub struct FlowFilter {
    pub statuses: Vec<FlowStatus>,
    pub name_contains: Option<String>,
    pub limit: Option<usize>,
}

impl FlowFilter {
    pub fn status(status: FlowStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Default::default()
        }
    }

    pub fn matches(&self, flow: &Flow) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&flow.status) {
            return false;
        }
        match &self.name_contains {
            Some(needle) => flow.name.contains(needle.as_str()),
            None => true,
        }
    }
}

/// Lifecycle notifications published by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    Submitted { flow_id: FlowId },
    Ready { flow_id: FlowId },
    Dispatched { flow_id: FlowId },
    Started { flow_id: FlowId },
    Paused { flow_id: FlowId },
    Resumed { flow_id: FlowId },
    TaskRetrying {
        flow_id: FlowId,
        stage: String,
        task: String,
        attempt: u32,
        kind: FailureKind,
    },
    Finished { flow_id: FlowId, status: FlowStatus },
}

impl FlowEvent {
    pub fn flow_id(&self) -> FlowId {
        match self {
            FlowEvent::Submitted { flow_id }
            | FlowEvent::Ready { flow_id }
            | FlowEvent::Dispatched { flow_id }
            | FlowEvent::Started { flow_id }
            | FlowEvent::Paused { flow_id }
            | FlowEvent::Resumed { flow_id }
            | FlowEvent::TaskRetrying { flow_id, .. }
            | FlowEvent::Finished { flow_id, .. } => *flow_id,
        }
    }
}
