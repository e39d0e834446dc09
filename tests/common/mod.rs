//! Shared helpers for orchestrator integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use flowplane::backends::{AgentInfo, TaskBackend, TaskOutput, TaskRequest};
use flowplane::config::{AgentConfig, EngineConfig};
use flowplane::control::CancelSignal;
use flowplane::error::TaskError;
use flowplane::models::{FlowDefinition, FlowId, StageDefinition, TaskDefinition};
use flowplane::orchestrator::Orchestrator;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One backend call as seen by the scripted backend
#[derive(Debug, Clone)]
pub struct Call {
    pub flow_id: FlowId,
    pub task: String,
    pub agent: String,
    pub attempt: u32,
    pub started: Instant,
    pub finished: Option<Instant>,
}

#[derive(Default)]
struct Recorder {
    calls: Vec<Call>,
    in_flight: HashMap<String, usize>,
    peak: HashMap<String, usize>,
    total_in_flight: usize,
    total_peak: usize,
}

/// Backend driven by task parameters:
///
/// - `sleep_ms`: how long the call takes (cancellable)
/// - `fail_times`: fail this many attempts before succeeding
/// - `always_fail`: fail every attempt
/// - `error`: `timeout`, `transient` or `failed` (default) for the failures
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    recorder: Arc<Mutex<Recorder>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.recorder.lock().calls.clone()
    }

    pub fn calls_for(&self, task: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.task == task).collect()
    }

    /// Flow ids in the order their first task started
    pub fn flow_start_order(&self) -> Vec<FlowId> {
        let mut order = Vec::new();
        for call in self.calls() {
            if !order.contains(&call.flow_id) {
                order.push(call.flow_id);
            }
        }
        order
    }

    pub fn peak_for_agent(&self, agent: &str) -> usize {
        self.recorder.lock().peak.get(agent).copied().unwrap_or(0)
    }

    pub fn peak_total(&self) -> usize {
        self.recorder.lock().total_peak
    }

    fn begin(&self, request: &TaskRequest, agent: &str) -> usize {
        let mut rec = self.recorder.lock();
        rec.calls.push(Call {
            flow_id: request.flow_id,
            task: request.task.clone(),
            agent: agent.to_string(),
            attempt: request.attempt,
            started: Instant::now(),
            finished: None,
        });
        let index = rec.calls.len() - 1;

        let now = {
            let load = rec.in_flight.entry(agent.to_string()).or_insert(0);
            *load += 1;
            *load
        };
        let peak = rec.peak.entry(agent.to_string()).or_insert(0);
        *peak = (*peak).max(now);
        rec.total_in_flight += 1;
        rec.total_peak = rec.total_peak.max(rec.total_in_flight);
        index
    }

    fn end(&self, index: usize, agent: &str) {
        let mut rec = self.recorder.lock();
        rec.calls[index].finished = Some(Instant::now());
        if let Some(load) = rec.in_flight.get_mut(agent) {
            *load -= 1;
        }
        rec.total_in_flight -= 1;
    }
}

#[async_trait]
impl TaskBackend for ScriptedBackend {
    async fn execute_task(
        &self,
        request: &TaskRequest,
        agent: &AgentInfo,
        cancel: CancelSignal,
    ) -> Result<TaskOutput, TaskError> {
        let params = &request.parameters;
        let sleep_ms = params.get("sleep_ms").and_then(|v| v.as_u64()).unwrap_or(0);
        let fail_times = params.get("fail_times").and_then(|v| v.as_u64()).unwrap_or(0);
        let always_fail = params
            .get("always_fail")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let error = params
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("failed")
            .to_string();

        let index = self.begin(request, &agent.id);
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => false,
            _ = cancel.cancelled() => true,
        };
        self.end(index, &agent.id);

        if cancelled {
            return Err(TaskError::Cancelled);
        }
        if always_fail || u64::from(request.attempt) <= fail_times {
            return Err(match error.as_str() {
                "timeout" => TaskError::Timeout(Duration::from_millis(sleep_ms)),
                "transient" => TaskError::Transient("connection reset".into()),
                _ => TaskError::Failed(format!("scripted failure of {}", request.task)),
            });
        }
        Ok(TaskOutput::new(json!({
            "task": request.task,
            "agent": agent.id,
            "attempt": request.attempt,
        })))
    }
}

/// Fast-ticking config with one unrestricted agent
pub fn test_config(max_concurrent: usize) -> EngineConfig {
    EngineConfig {
        max_concurrent_flows: max_concurrent,
        tick_interval_ms: 20,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 100,
        agents: vec![AgentConfig::new("local", 8)],
        ..Default::default()
    }
}

pub fn orchestrator(config: EngineConfig) -> (Orchestrator, ScriptedBackend) {
    let backend = ScriptedBackend::new();
    let orchestrator = Orchestrator::new(config, Arc::new(backend.clone())).unwrap();
    (orchestrator, backend)
}

/// Single-stage, single-task flow
pub fn simple_flow(name: &str, priority: i32) -> FlowDefinition {
    FlowDefinition::new(name)
        .with_priority(priority)
        .with_stage(StageDefinition::sequential("main").with_task(TaskDefinition::new("work")))
}

pub fn sleeping_flow(name: &str, sleep_ms: u64) -> FlowDefinition {
    FlowDefinition::new(name).with_stage(
        StageDefinition::sequential("main")
            .with_task(TaskDefinition::new("work").with_parameter("sleep_ms", sleep_ms)),
    )
}

pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
