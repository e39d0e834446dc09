//! Flow executor
//!
//! Runs one flow's stages in order. Tasks in a sequential stage run one after
//! another; tasks in a parallel stage run concurrently, bounded by the slots
//! of the agents able to run them. Every attempt:
//!
//! 1. waits at the pause gate,
//! 2. leases an agent slot from the ledger (the task stays Pending until then),
//! 3. calls the backend under the task timeout, racing the cancel signal,
//! 4. releases the slot, and on failure asks the recovery engine what to do.
//!
//! A flow-level timer cancels the flow's [`CancelSignal`] when the flow timeout
//! expires; in-flight tasks observe it and stop.

use crate::backends::{AgentInfo, TaskBackend, TaskRequest};
use crate::config::EngineConfig;
use crate::control::{CancelReason, FlowControl};
use crate::error::TaskError;
use crate::ledger::ResourceLedger;
use crate::metrics::EngineMetrics;
use crate::models::{
    ExecutionMode, FailureCause, Flow, FlowId, FlowResult, FlowStatus, Stage, StageStatus, Task,
    TaskStatus,
};
use crate::recovery::{FailureKind, RecoveryAction, RecoveryContext, RecoveryEngine, RetryConfig};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Receives progress updates while a flow runs
pub trait ExecutionObserver: Send + Sync {
    fn flow_started(&self, _flow: &Flow) {}

    fn stage_updated(&self, _flow_id: FlowId, _stage: usize, _status: StageStatus) {}

    fn task_updated(&self, _flow_id: FlowId, _stage: usize, _index: usize, _task: &Task) {}

    /// `paused` is true when a task blocks on the pause gate, false when it passes again
    fn flow_paused(&self, _flow_id: FlowId, _paused: bool) {}

    fn task_retrying(
        &self,
        _flow_id: FlowId,
        _stage: &str,
        _task: &str,
        _attempt: u32,
        _kind: FailureKind,
    ) {
    }
}

/// Observer that ignores every update
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Completed,
    Failed(FailureCause),
    Interrupted(CancelReason),
}

/// Per-stage data shared by the stage's task futures
struct StageScope<'a> {
    flow_id: FlowId,
    index: usize,
    name: &'a str,
    control: &'a FlowControl,
    context: &'a HashMap<String, String>,
}

/// Runs flows against a backend
#[derive(Clone)]
pub struct Executor {
    backend: Arc<dyn TaskBackend>,
    ledger: ResourceLedger,
    recovery: RecoveryEngine,
    metrics: EngineMetrics,
    observer: Arc<dyn ExecutionObserver>,
    task_timeout: Duration,
    flow_timeout: Duration,
}

impl Executor {
    pub fn new(
        config: &EngineConfig,
        backend: Arc<dyn TaskBackend>,
        ledger: ResourceLedger,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            backend,
            ledger,
            recovery: RecoveryEngine::new(RetryConfig::from_config(config)),
            metrics,
            observer: Arc::new(NoopObserver),
            task_timeout: config.task_timeout(),
            flow_timeout: config.flow_timeout(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Run a flow to a terminal state and report its result
    pub async fn run(&self, flow: Flow, control: FlowControl) -> FlowResult {
        self.execute(flow, control).await.result()
    }

    /// Run a flow to a terminal state and return the final record
    pub async fn execute(&self, mut flow: Flow, control: FlowControl) -> Flow {
        let limit = flow.timeout.unwrap_or(self.flow_timeout);
        flow.status = FlowStatus::Running;
        flow.started_at = Some(Utc::now());
        info!(flow_id = %flow.id, "Starting flow: {}", flow.name);
        self.observer.flow_started(&flow);

        let timer = {
            let cancel = control.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                cancel.cancel(CancelReason::FlowTimeout);
            })
        };

        let outcome = self.run_stages(&mut flow, &control).await;
        timer.abort();

        flow.retry_count = flow
            .stages
            .iter()
            .flat_map(|s| s.tasks.iter())
            .map(|t| t.attempt_count.saturating_sub(1))
            .sum();
        flow.completed_at = Some(Utc::now());

        match outcome {
            Outcome::Completed => {
                flow.status = FlowStatus::Completed;
                info!(flow_id = %flow.id, "Flow '{}' completed", flow.name);
            }
            Outcome::Failed(cause) => {
                error!(flow_id = %flow.id, "Flow '{}' failed: {}", flow.name, cause.message);
                flow.status = FlowStatus::Failed;
                flow.failure = Some(cause);
            }
            Outcome::Interrupted(CancelReason::Requested) => {
                warn!(flow_id = %flow.id, "Flow '{}' cancelled", flow.name);
                flow.status = FlowStatus::Cancelled;
            }
            Outcome::Interrupted(CancelReason::FlowTimeout) => {
                error!(flow_id = %flow.id, "Flow '{}' timed out after {:?}", flow.name, limit);
                flow.status = FlowStatus::Failed;
                flow.failure = Some(FailureCause::flow_timeout(limit));
            }
            Outcome::Interrupted(CancelReason::Shutdown) => {
                warn!(flow_id = %flow.id, "Flow '{}' aborted by shutdown", flow.name);
                flow.status = FlowStatus::Failed;
                flow.failure = Some(FailureCause::aborted("engine shut down while flow was running"));
            }
        }
        flow
    }

    async fn run_stages(&self, flow: &mut Flow, control: &FlowControl) -> Outcome {
        let mut outcome = Outcome::Completed;

        for index in 0..flow.stages.len() {
            if outcome != Outcome::Completed {
                let status = match outcome {
                    Outcome::Interrupted(_) => StageStatus::Cancelled,
                    _ => StageStatus::Skipped,
                };
                flow.stages[index].status = status;
                self.observer.stage_updated(flow.id, index, status);
                continue;
            }
            if let Some(reason) = control.cancel.reason() {
                outcome = Outcome::Interrupted(reason);
                flow.stages[index].status = StageStatus::Cancelled;
                self.observer
                    .stage_updated(flow.id, index, StageStatus::Cancelled);
                continue;
            }

            let scope = StageScope {
                flow_id: flow.id,
                index,
                name: &flow.stages[index].name,
                control,
                context: &flow.context,
            };
            let stage = &flow.stages[index];
            info!(
                flow_id = %scope.flow_id,
                "Starting stage '{}' ({} tasks, {:?})",
                stage.name,
                stage.tasks.len(),
                stage.execution_mode
            );
            self.observer
                .stage_updated(scope.flow_id, index, StageStatus::Running);

            let (tasks, stage_outcome) = self.run_stage(&scope, stage).await;
            let stage = &mut flow.stages[index];
            stage.tasks = tasks;
            stage.status = match &stage_outcome {
                Outcome::Completed => StageStatus::Completed,
                Outcome::Failed(_) => StageStatus::Failed,
                Outcome::Interrupted(_) => StageStatus::Cancelled,
            };
            self.observer.stage_updated(flow.id, index, stage.status);

            outcome = match stage_outcome {
                Outcome::Failed(cause) if stage.continue_on_failure => {
                    warn!(
                        flow_id = %flow.id,
                        "Stage '{}' failed but continue_on_failure=true, continuing: {}",
                        stage.name,
                        cause.message
                    );
                    Outcome::Completed
                }
                other => other,
            };
        }
        outcome
    }

    /// Returns the updated task records and the stage outcome
    async fn run_stage(&self, scope: &StageScope<'_>, stage: &Stage) -> (Vec<Task>, Outcome) {
        match stage.execution_mode {
            ExecutionMode::Sequential => self.run_sequential(scope, stage).await,
            ExecutionMode::Parallel => self.run_parallel(scope, stage).await,
        }
    }

    async fn run_sequential(&self, scope: &StageScope<'_>, stage: &Stage) -> (Vec<Task>, Outcome) {
        let mut tasks = stage.tasks.clone();
        let mut outcome = Outcome::Completed;

        for (index, slot) in tasks.iter_mut().enumerate() {
            let (task, task_outcome) = self.run_task(scope, index, slot.clone()).await;
            *slot = task;
            match task_outcome {
                Outcome::Completed => {}
                Outcome::Failed(cause) if stage.continue_on_task_failure => {
                    warn!(
                        "Task '{}' failed but continue_on_task_failure=true, continuing: {}",
                        slot.name, cause.message
                    );
                }
                other => {
                    outcome = other;
                    break;
                }
            }
        }
        (tasks, outcome)
    }

    async fn run_parallel(&self, scope: &StageScope<'_>, stage: &Stage) -> (Vec<Task>, Outcome) {
        let limit = self.parallel_limit(&stage.tasks);
        debug!("Running {} tasks with parallelism {}", stage.tasks.len(), limit);

        let results: Vec<(usize, Task, Outcome)> = stream::iter(stage.tasks.iter().cloned().enumerate())
            .map(|(index, task)| async move {
                let (task, outcome) = self.run_task(scope, index, task).await;
                (index, task, outcome)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        let mut tasks = stage.tasks.clone();
        let mut failure = None;
        let mut interrupted = None;
        for (index, task, outcome) in results {
            tasks[index] = task;
            match outcome {
                Outcome::Completed => {}
                Outcome::Failed(cause) => {
                    if stage.continue_on_task_failure {
                        warn!(
                            "Task '{}' failed but continue_on_task_failure=true, continuing: {}",
                            tasks[index].name, cause.message
                        );
                    } else if failure.is_none() {
                        failure = Some(cause);
                    }
                }
                Outcome::Interrupted(reason) => interrupted = Some(reason),
            }
        }

        let outcome = match (interrupted, failure) {
            (Some(reason), _) => Outcome::Interrupted(reason),
            (None, Some(cause)) => Outcome::Failed(cause),
            (None, None) => Outcome::Completed,
        };
        (tasks, outcome)
    }

    /// Total slots of agents able to run at least one task of the stage
    fn parallel_limit(&self, tasks: &[Task]) -> usize {
        let slots = self
            .ledger
            .capable_slots(tasks.iter().map(|t| &t.required_capabilities));
        (slots as usize).clamp(1, tasks.len().max(1))
    }

    async fn run_task(&self, scope: &StageScope<'_>, index: usize, mut task: Task) -> (Task, Outcome) {
        let cancel = &scope.control.cancel;
        let pause = &scope.control.pause;
        let max_retries = task
            .max_retries
            .unwrap_or(self.recovery.retry_config().max_retries);
        let timeout = task.timeout.unwrap_or(self.task_timeout);
        let mut exclude: HashSet<String> = HashSet::new();

        loop {
            if pause.is_paused() {
                self.observer.flow_paused(scope.flow_id, true);
                let resumed = pause.wait_resumed(cancel).await;
                if resumed {
                    self.observer.flow_paused(scope.flow_id, false);
                }
            }
            if let Some(reason) = cancel.reason() {
                return self.interrupt(scope, index, task, reason);
            }

            task.status = TaskStatus::Pending;
            self.observer
                .task_updated(scope.flow_id, scope.index, index, &task);

            let lease = match self
                .ledger
                .lease(&task.required_capabilities, &exclude, cancel)
                .await
            {
                Ok(lease) => lease,
                Err(TaskError::Cancelled) => {
                    let reason = cancel.reason().unwrap_or(CancelReason::Requested);
                    return self.interrupt(scope, index, task, reason);
                }
                Err(err) => {
                    let kind = RecoveryEngine::classify(&err);
                    let action = self.decide(&task, max_retries, kind, None);
                    if !action.is_terminal() {
                        // Capable agents exist, one will free up
                        continue;
                    }
                    return self.escalate(scope, index, task, kind, &err);
                }
            };

            let agent = AgentInfo {
                id: lease.agent_id().to_string(),
                capabilities: lease.agent().capabilities.clone(),
            };
            task.status = TaskStatus::Assigned;
            task.assigned_agent_id = Some(agent.id.clone());
            self.observer
                .task_updated(scope.flow_id, scope.index, index, &task);

            task.attempt_count += 1;
            task.status = TaskStatus::Running;
            task.error = None;
            self.observer
                .task_updated(scope.flow_id, scope.index, index, &task);
            info!(
                flow_id = %scope.flow_id,
                agent = %agent.id,
                "Executing task '{}' (attempt {}/{})",
                task.name,
                task.attempt_count,
                max_retries + 1
            );

            let request = TaskRequest {
                flow_id: scope.flow_id,
                stage: scope.name.to_string(),
                task: task.name.clone(),
                task_type: task.task_type.clone(),
                parameters: task.parameters.clone(),
                context: scope.context.clone(),
                attempt: task.attempt_count,
            };

            let start = Instant::now();
            let result = tokio::select! {
                result = tokio::time::timeout(
                    timeout,
                    self.backend.execute_task(&request, &agent, cancel.clone()),
                ) => match result {
                    Ok(result) => result,
                    Err(_) => Err(TaskError::Timeout(timeout)),
                },
                reason = cancel.cancelled() => {
                    drop(lease);
                    self.metrics.record_task_attempt("cancelled", start.elapsed());
                    return self.interrupt(scope, index, task, reason);
                }
            };
            drop(lease);

            let err = match result {
                Ok(output) => {
                    self.metrics.record_task_attempt("success", start.elapsed());
                    task.status = TaskStatus::Completed;
                    task.result = Some(output.output);
                    self.observer
                        .task_updated(scope.flow_id, scope.index, index, &task);
                    info!(flow_id = %scope.flow_id, "Task '{}' completed successfully", task.name);
                    return (task, Outcome::Completed);
                }
                Err(TaskError::Cancelled) if cancel.is_cancelled() => {
                    self.metrics.record_task_attempt("cancelled", start.elapsed());
                    let reason = cancel.reason().unwrap_or(CancelReason::Requested);
                    return self.interrupt(scope, index, task, reason);
                }
                Err(err) => err,
            };

            self.metrics.record_task_attempt("failure", start.elapsed());
            let kind = RecoveryEngine::classify(&err);
            task.error = Some(err.to_string());
            warn!(
                flow_id = %scope.flow_id,
                "Task '{}' attempt {} failed ({}): {}",
                task.name, task.attempt_count, kind, err
            );

            let action = self.decide(&task, max_retries, kind, Some(agent.id.clone()));
            let delay = match action {
                RecoveryAction::Escalate => return self.escalate(scope, index, task, kind, &err),
                RecoveryAction::ReassignAgent => {
                    exclude.insert(agent.id);
                    Duration::ZERO
                }
                RecoveryAction::RetryWithBackoff(delay) | RecoveryAction::ReclaimAndRetry(delay) => {
                    exclude.clear();
                    delay
                }
            };

            warn!(
                "Task '{}' will retry in {:?} ({}, attempt {}/{})",
                task.name,
                delay,
                action.label(),
                task.attempt_count + 1,
                max_retries + 1
            );
            self.observer.task_retrying(
                scope.flow_id,
                scope.name,
                &task.name,
                task.attempt_count,
                kind,
            );
            task.status = TaskStatus::Pending;
            self.observer
                .task_updated(scope.flow_id, scope.index, index, &task);

            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    reason = cancel.cancelled() => {
                        return self.interrupt(scope, index, task, reason);
                    }
                }
            }
        }
    }

    fn decide(
        &self,
        task: &Task,
        max_retries: u32,
        kind: FailureKind,
        agent_id: Option<String>,
    ) -> RecoveryAction {
        let capabilities: &BTreeSet<String> = &task.required_capabilities;
        let ctx = RecoveryContext {
            attempt_count: task.attempt_count,
            max_retries,
            capable_agents: self.ledger.capable_agents(capabilities),
            agent_id,
        };
        let action = self.recovery.recover(&ctx, kind);
        self.metrics.record_recovery(kind, &action);
        action
    }

    fn escalate(
        &self,
        scope: &StageScope<'_>,
        index: usize,
        mut task: Task,
        kind: FailureKind,
        err: &TaskError,
    ) -> (Task, Outcome) {
        error!(
            flow_id = %scope.flow_id,
            "Task '{}' failed after {} attempts: {}",
            task.name, task.attempt_count, err
        );
        task.status = TaskStatus::Failed;
        task.error = Some(err.to_string());
        self.observer
            .task_updated(scope.flow_id, scope.index, index, &task);
        let cause = FailureCause::task(kind, scope.name, &task.name, err.to_string());
        (task, Outcome::Failed(cause))
    }

    fn interrupt(
        &self,
        scope: &StageScope<'_>,
        index: usize,
        mut task: Task,
        reason: CancelReason,
    ) -> (Task, Outcome) {
        // Tasks that never started stay Pending
        if task.attempt_count > 0 && !task.status.is_terminal() {
            task.status = TaskStatus::Failed;
            task.error = Some("cancelled".to_string());
            self.observer
                .task_updated(scope.flow_id, scope.index, index, &task);
        }
        debug!(flow_id = %scope.flow_id, "Task '{}' interrupted: {:?}", task.name, reason);
        (task, Outcome::Interrupted(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MockTaskBackend, TaskOutput};
    use crate::control::CancelSignal;
    use crate::models::{FailureReason, FlowDefinition, StageDefinition, TaskDefinition};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn test_config() -> EngineConfig {
        EngineConfig {
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 100,
            retry_jitter: 0.0,
            max_retries: 2,
            task_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn ledger() -> ResourceLedger {
        let ledger = ResourceLedger::new();
        ledger
            .register_agent("local", BTreeSet::new(), 4)
            .unwrap();
        ledger
    }

    fn executor(backend: impl TaskBackend + 'static) -> Executor {
        Executor::new(
            &test_config(),
            Arc::new(backend),
            ledger(),
            EngineMetrics::new().unwrap(),
        )
    }

    fn flow(def: FlowDefinition) -> Flow {
        Flow::from_definition(Uuid::new_v4(), def, 0, Utc::now())
    }

    fn two_stage_flow() -> Flow {
        flow(
            FlowDefinition::new("pipeline")
                .with_stage(
                    StageDefinition::sequential("build")
                        .with_task(TaskDefinition::new("compile"))
                        .with_task(TaskDefinition::new("link")),
                )
                .with_stage(StageDefinition::sequential("test").with_task(TaskDefinition::new("unit"))),
        )
    }

    #[tokio::test]
    async fn test_sequential_success() {
        let mut backend = MockTaskBackend::new();
        backend
            .expect_execute_task()
            .times(3)
            .returning(|req, _, _| Ok(TaskOutput::new(json!({"task": req.task}))));

        let result = executor(backend).run(two_stage_flow(), FlowControl::new()).await;
        assert_eq!(result.status, FlowStatus::Completed);
        assert!(result.failure.is_none());
        let link = result.task("build", "link").unwrap();
        assert_eq!(link.status, TaskStatus::Completed);
        assert_eq!(link.attempts, 1);
        assert_eq!(link.agent_id.as_deref(), Some("local"));
        assert_eq!(link.output, Some(json!({"task": "link"})));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut backend = MockTaskBackend::new();
        {
            let calls = calls.clone();
            backend.expect_execute_task().returning(move |_, _, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TaskError::Transient("connection reset".into()))
                } else {
                    Ok(TaskOutput::default())
                }
            });
        }

        let def = FlowDefinition::new("retry")
            .with_stage(StageDefinition::sequential("s").with_task(TaskDefinition::new("t")));
        let result = executor(backend).run(flow(def), FlowControl::new()).await;
        assert_eq!(result.status, FlowStatus::Completed);
        assert_eq!(result.task("s", "t").unwrap().attempts, 2);
        assert_eq!(result.retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_bound_and_failure_cause() {
        let mut backend = MockTaskBackend::new();
        backend
            .expect_execute_task()
            .times(3)
            .returning(|_, _, _| Err(TaskError::Timeout(Duration::from_millis(1))));

        let result = executor(backend).run(two_stage_flow(), FlowControl::new()).await;
        assert_eq!(result.status, FlowStatus::Failed);
        let compile = result.task("build", "compile").unwrap();
        assert_eq!(compile.status, TaskStatus::Failed);
        assert_eq!(compile.attempts, 3);
        // Later tasks and stages never start
        assert_eq!(result.task("build", "link").unwrap().status, TaskStatus::Pending);
        assert_eq!(result.stages[1].status, StageStatus::Skipped);

        let cause = result.failure.unwrap();
        assert_eq!(
            cause.reason,
            FailureReason::TaskFailed {
                kind: FailureKind::Timeout
            }
        );
        assert_eq!(cause.task.as_deref(), Some("compile"));
        assert_eq!(cause.stage.as_deref(), Some("build"));
    }

    #[tokio::test]
    async fn test_task_override_of_max_retries() {
        let mut backend = MockTaskBackend::new();
        backend
            .expect_execute_task()
            .times(1)
            .returning(|_, _, _| Err(TaskError::Failed("exit 1".into())));

        let def = FlowDefinition::new("once").with_stage(
            StageDefinition::sequential("s").with_task(TaskDefinition::new("t").with_max_retries(0)),
        );
        let result = executor(backend).run(flow(def), FlowControl::new()).await;
        assert_eq!(result.status, FlowStatus::Failed);
        assert_eq!(result.task("s", "t").unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_continue_on_task_failure() {
        let mut backend = MockTaskBackend::new();
        backend.expect_execute_task().returning(|req, _, _| {
            if req.task == "flaky" {
                Err(TaskError::Failed("boom".into()))
            } else {
                Ok(TaskOutput::default())
            }
        });

        let def = FlowDefinition::new("tolerant").with_stage(
            StageDefinition::sequential("s")
                .continue_on_task_failure()
                .with_task(TaskDefinition::new("flaky").with_max_retries(0))
                .with_task(TaskDefinition::new("after")),
        );
        let result = executor(backend).run(flow(def), FlowControl::new()).await;
        assert_eq!(result.status, FlowStatus::Completed);
        assert_eq!(result.stages[0].status, StageStatus::Completed);
        assert_eq!(result.task("s", "flaky").unwrap().status, TaskStatus::Failed);
        assert_eq!(result.task("s", "after").unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_continue_on_stage_failure() {
        let mut backend = MockTaskBackend::new();
        backend.expect_execute_task().returning(|req, _, _| {
            if req.stage == "optional" {
                Err(TaskError::Failed("boom".into()))
            } else {
                Ok(TaskOutput::default())
            }
        });

        let def = FlowDefinition::new("f")
            .with_stage(
                StageDefinition::sequential("optional")
                    .continue_on_failure()
                    .with_task(TaskDefinition::new("t").with_max_retries(0)),
            )
            .with_stage(StageDefinition::sequential("main").with_task(TaskDefinition::new("t")));
        let result = executor(backend).run(flow(def), FlowControl::new()).await;
        assert_eq!(result.status, FlowStatus::Completed);
        assert_eq!(result.stages[0].status, StageStatus::Failed);
        assert_eq!(result.stages[1].status, StageStatus::Completed);
    }

    #[tokio::test]
    async fn test_no_capable_agent_escalates_immediately() {
        let mut backend = MockTaskBackend::new();
        backend.expect_execute_task().never();

        let def = FlowDefinition::new("gpu").with_stage(
            StageDefinition::sequential("s").with_task(TaskDefinition::new("train").with_capability("gpu")),
        );
        let result = executor(backend).run(flow(def), FlowControl::new()).await;
        assert_eq!(result.status, FlowStatus::Failed);
        let cause = result.failure.as_ref().unwrap();
        assert_eq!(
            cause.reason,
            FailureReason::TaskFailed {
                kind: FailureKind::AgentFailure
            }
        );
        assert_eq!(result.task("s", "train").unwrap().attempts, 0);
    }

    /// Sleeps for the configured time, honouring cancellation
    struct SleepBackend {
        delay: Duration,
        running: Arc<AtomicU32>,
        peak: Arc<AtomicU32>,
    }

    impl SleepBackend {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                running: Arc::new(AtomicU32::new(0)),
                peak: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl TaskBackend for SleepBackend {
        async fn execute_task(
            &self,
            _request: &TaskRequest,
            _agent: &AgentInfo,
            cancel: CancelSignal,
        ) -> Result<TaskOutput, TaskError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let result = tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(TaskOutput::default()),
                _ = cancel.cancelled() => Err(TaskError::Cancelled),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test]
    async fn test_parallel_stage_bounded_by_agent_slots() {
        let backend = SleepBackend::new(Duration::from_millis(50));
        let peak = backend.peak.clone();
        let ledger = ResourceLedger::new();
        ledger.register_agent("a", BTreeSet::new(), 2).unwrap();
        let executor = Executor::new(
            &test_config(),
            Arc::new(backend),
            ledger,
            EngineMetrics::new().unwrap(),
        );

        let mut stage = StageDefinition::parallel("fan-out");
        for i in 0..6 {
            stage = stage.with_task(TaskDefinition::new(format!("t{i}")));
        }
        let result = executor
            .run(flow(FlowDefinition::new("p").with_stage(stage)), FlowControl::new())
            .await;
        assert_eq!(result.status, FlowStatus::Completed);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_flow_timeout_cancels_in_flight_tasks() {
        let executor = executor(SleepBackend::new(Duration::from_secs(30)));
        let def = FlowDefinition::new("slow")
            .with_timeout(Duration::from_secs(1))
            .with_stage(StageDefinition::sequential("s").with_task(TaskDefinition::new("t")))
            .with_stage(StageDefinition::sequential("next").with_task(TaskDefinition::new("t")));

        let start = Instant::now();
        let result = executor.run(flow(def), FlowControl::new()).await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(result.status, FlowStatus::Failed);
        assert_eq!(result.failure.as_ref().unwrap().reason, FailureReason::FlowTimeout);
        assert_eq!(result.task("s", "t").unwrap().status, TaskStatus::Failed);
        assert_eq!(result.stages[1].status, StageStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_marks_flow_cancelled() {
        let executor = executor(SleepBackend::new(Duration::from_secs(30)));
        let control = FlowControl::new();
        let def = FlowDefinition::new("cancel-me")
            .with_stage(StageDefinition::sequential("s").with_task(TaskDefinition::new("t")));

        let handle = {
            let executor = executor.clone();
            let control = control.clone();
            let flow = flow(def);
            tokio::spawn(async move { executor.run(flow, control).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        control.cancel.cancel(CancelReason::Requested);

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, FlowStatus::Cancelled);
        assert!(result.failure.is_none());
    }

    #[derive(Default)]
    struct RecordingObserver {
        statuses: Mutex<Vec<TaskStatus>>,
        retries: Mutex<Vec<(u32, FailureKind)>>,
    }

    impl ExecutionObserver for RecordingObserver {
        fn task_updated(&self, _flow_id: FlowId, _stage: usize, _index: usize, task: &Task) {
            self.statuses.lock().push(task.status);
        }

        fn task_retrying(
            &self,
            _flow_id: FlowId,
            _stage: &str,
            _task: &str,
            attempt: u32,
            kind: FailureKind,
        ) {
            self.retries.lock().push((attempt, kind));
        }
    }

    #[tokio::test]
    async fn test_observer_sees_task_lifecycle() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut backend = MockTaskBackend::new();
        {
            let calls = calls.clone();
            backend.expect_execute_task().returning(move |_, _, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TaskError::ResourceExhausted("disk full".into()))
                } else {
                    Ok(TaskOutput::default())
                }
            });
        }
        let observer = Arc::new(RecordingObserver::default());
        let executor = executor(backend).with_observer(observer.clone());
        let def = FlowDefinition::new("obs")
            .with_stage(StageDefinition::sequential("s").with_task(TaskDefinition::new("t")));
        let result = executor.run(flow(def), FlowControl::new()).await;
        assert!(result.is_success());

        use TaskStatus::*;
        assert_eq!(
            *observer.statuses.lock(),
            vec![Pending, Assigned, Running, Pending, Pending, Assigned, Running, Completed]
        );
        assert_eq!(
            *observer.retries.lock(),
            vec![(1, FailureKind::ResourceExhaustion)]
        );
    }
}
