//! Orchestrator façade
//!
//! Owns the flow table, ledger, scheduler and executor of one engine instance
//! and exposes the public operations. Flows may be submitted before
//! [`Orchestrator::start`]; they queue until the scheduler loop runs.
//!
//! # Example
//!
//! ```no_run
//! use flowplane::backends::shell::ShellBackend;
//! use flowplane::config::EngineConfig;
//! use flowplane::models::{FlowDefinition, StageDefinition, TaskDefinition};
//! use flowplane::orchestrator::Orchestrator;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> flowplane::error::Result<()> {
//! let orchestrator = Orchestrator::new(EngineConfig::default(), Arc::new(ShellBackend::new()))?;
//! orchestrator.start()?;
//!
//! let flow = FlowDefinition::new("hello").with_stage(
//!     StageDefinition::sequential("greet").with_task(
//!         TaskDefinition::new("echo")
//!             .with_parameter("command", "/bin/echo")
//!             .with_parameter("args", vec!["hello"]),
//!     ),
//! );
//! let result = orchestrator
//!     .execute_flow_sync(flow, Duration::from_secs(30))
//!     .await?;
//! assert!(result.is_success());
//!
//! orchestrator.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::backends::TaskBackend;
use crate::config::EngineConfig;
use crate::control::CancelReason;
use crate::error::{EngineError, Result};
use crate::executor::{ExecutionObserver, Executor};
use crate::ledger::ResourceLedger;
use crate::metrics::EngineMetrics;
use crate::models::{
    Flow, FlowDefinition, FlowEvent, FlowFilter, FlowId, FlowResult, FlowStatus, FlowSummary,
};
use crate::parser::{validate_flow_definition, FlowBundle};
use crate::scheduler::{DispatchedFlow, Scheduler, SchedulerStatus};
use crate::state::EngineState;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Background loops of a started orchestrator
struct Runtime {
    shutdown_tx: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

pub struct Orchestrator {
    config: EngineConfig,
    state: Arc<EngineState>,
    executor: Executor,
    runtime: Mutex<Option<Runtime>>,
}

impl Orchestrator {
    /// Build an engine from configuration; agents declared in `config` are registered
    pub fn new(config: EngineConfig, backend: Arc<dyn TaskBackend>) -> Result<Self> {
        config.validate()?;
        let ledger = ResourceLedger::from_config(&config)?;
        let metrics = EngineMetrics::new()?;
        let state = Arc::new(EngineState::new(
            ledger.clone(),
            metrics.clone(),
            config.event_capacity,
        ));
        let observer: Arc<dyn ExecutionObserver> = state.clone();
        let executor = Executor::new(&config, backend, ledger, metrics).with_observer(observer);

        info!(
            "Orchestrator initialized (policy: {}, max concurrent flows: {}, agents: {})",
            config.scheduling_policy,
            config.max_concurrent_flows,
            config.agents.len()
        );
        Ok(Self {
            config,
            state,
            executor,
            runtime: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Spawn the scheduler loop and the executor intake
    pub fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let (intake_tx, intake_rx) = mpsc::channel(self.config.max_concurrent_flows);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::new(Scheduler::new(&self.config, self.state.clone(), intake_tx));

        let scheduler = tokio::spawn(scheduler.run(shutdown_rx));
        let dispatcher = tokio::spawn(dispatch_loop(
            self.executor.clone(),
            self.state.clone(),
            intake_rx,
        ));

        *runtime = Some(Runtime {
            shutdown_tx,
            scheduler,
            dispatcher,
        });
        info!("Orchestrator started");
        Ok(())
    }

    /// Stop scheduling, cancel in-flight flows and wait for both loops to exit.
    ///
    /// Flows that were still running end as Failed with an aborted cause;
    /// Queued and Ready flows stay where they are.
    pub async fn stop(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            debug!("Stop ignored, orchestrator not running");
            return;
        };
        info!("Stopping orchestrator");

        // No further dispatches once the scheduler has exited
        let _ = runtime.shutdown_tx.send(true);
        if let Err(e) = runtime.scheduler.await {
            error!("Scheduler loop ended abnormally: {}", e);
        }

        let cancelled = self.state.cancel_active(CancelReason::Shutdown);
        if cancelled > 0 {
            warn!("Cancelling {} in-flight flow(s) for shutdown", cancelled);
        }
        if let Err(e) = runtime.dispatcher.await {
            error!("Dispatcher loop ended abnormally: {}", e);
        }
        info!("Orchestrator stopped");
    }

    /// Add an agent at runtime
    pub fn register_agent(
        &self,
        id: impl Into<String>,
        capabilities: BTreeSet<String>,
        capacity: u32,
    ) -> Result<()> {
        self.state
            .ledger()
            .register_agent(id, capabilities, capacity)?;
        self.state.wake_scheduler();
        Ok(())
    }

    /// `SubmitFlow`: validate, register in the graph and queue
    pub fn submit_flow(&self, definition: FlowDefinition) -> Result<FlowId> {
        self.check_admissible(&definition)?;
        self.state.register(definition)
    }

    fn check_admissible(&self, definition: &FlowDefinition) -> Result<()> {
        validate_flow_definition(definition)?;
        let total = self.state.ledger().total_capacity();
        if definition.resource_requirements > total {
            return Err(EngineError::InvalidDefinition(format!(
                "flow '{}' requires {} capacity units but only {} exist",
                definition.name, definition.resource_requirements, total
            )));
        }
        Ok(())
    }

    /// Submit every flow of a bundle in dependency order; returns ids by flow name.
    ///
    /// All-or-nothing: if any flow is rejected, none of the bundle is queued.
    pub fn submit_bundle(&self, bundle: FlowBundle) -> Result<HashMap<String, FlowId>> {
        bundle.validate()?;
        for entry in &bundle.flows {
            self.check_admissible(&entry.definition)?;
        }

        let entries = bundle
            .submission_order()?
            .into_iter()
            .map(|entry| (entry.definition.clone(), entry.depends_on.clone()))
            .collect();
        let ids: HashMap<String, FlowId> = self.state.register_group(entries)?.into_iter().collect();
        info!("Submitted bundle of {} flow(s)", ids.len());
        Ok(ids)
    }

    /// Add a prerequisite to a flow that has not been dispatched
    pub fn add_dependency(&self, flow_id: FlowId, dependency: FlowId) -> Result<()> {
        self.state.add_dependency(flow_id, dependency)
    }

    /// Forget finished flows nothing unfinished depends on; returns how many were dropped
    pub fn purge_finished(&self) -> usize {
        self.state.purge_finished()
    }

    /// `CancelFlow`: idempotent; terminal flows are left untouched
    pub fn cancel_flow(&self, flow_id: FlowId) -> Result<()> {
        self.state.cancel(flow_id)
    }

    /// Returns false if the flow was not running or already paused
    pub fn pause_flow(&self, flow_id: FlowId) -> Result<bool> {
        let paused = self.state.pause(flow_id)?;
        if paused {
            info!(flow_id = %flow_id, "Pause requested");
        }
        Ok(paused)
    }

    pub fn resume_flow(&self, flow_id: FlowId) -> Result<bool> {
        let resumed = self.state.resume(flow_id)?;
        if resumed {
            info!(flow_id = %flow_id, "Resume requested");
        }
        Ok(resumed)
    }

    /// `GetFlowStatus`
    pub fn get_flow_status(&self, flow_id: FlowId) -> Result<FlowStatus> {
        self.state.status(flow_id)
    }

    /// Full runtime record including per-stage and per-task state
    pub fn get_flow(&self, flow_id: FlowId) -> Result<Flow> {
        self.state.get(flow_id)
    }

    /// `ListFlows`
    pub fn list_flows(&self, filter: &FlowFilter) -> Vec<FlowSummary> {
        self.state.list(filter)
    }

    /// Wait until the flow reaches a terminal status
    pub async fn wait_for(&self, flow_id: FlowId) -> Result<FlowResult> {
        let mut status = self.state.watch(flow_id)?;
        status
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| EngineError::Other(format!("status channel closed for flow {flow_id}")))?;
        Ok(self.state.get(flow_id)?.result())
    }

    /// `ExecuteFlowSync`: submit and wait; on timeout the flow is cancelled
    pub async fn execute_flow_sync(
        &self,
        definition: FlowDefinition,
        timeout: Duration,
    ) -> Result<FlowResult> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let flow_id = self.submit_flow(definition)?;
        match tokio::time::timeout(timeout, self.wait_for(flow_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(flow_id = %flow_id, "Synchronous execution timed out after {:?}, cancelling", timeout);
                self.state.cancel(flow_id)?;
                Err(EngineError::Timeout(timeout))
            }
        }
    }

    /// `GetSchedulerStatus`
    pub fn scheduler_status(&self) -> SchedulerStatus {
        SchedulerStatus::capture(
            &self.state,
            self.config.scheduling_policy,
            self.config.max_concurrent_flows,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.state.subscribe()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        self.state.metrics()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        self.state.ledger()
    }
}

/// Run each dispatched flow on its own task until the intake closes,
/// then wait for the flows still running
async fn dispatch_loop(
    executor: Executor,
    state: Arc<EngineState>,
    mut intake: mpsc::Receiver<DispatchedFlow>,
) {
    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            received = intake.recv() => {
                let Some(DispatchedFlow { flow, control }) = received else {
                    break;
                };
                let executor = executor.clone();
                let state = state.clone();
                running.spawn(async move {
                    let flow_id = flow.id;
                    match AssertUnwindSafe(executor.execute(flow, control))
                        .catch_unwind()
                        .await
                    {
                        Ok(flow) => state.finish(flow),
                        Err(_) => {
                            error!(flow_id = %flow_id, "Flow execution panicked");
                            state.abort(flow_id, "flow execution panicked");
                        }
                    }
                });
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    error!("Flow task failed to join: {}", e);
                }
            }
        }
    }

    debug!("Executor intake closed, waiting for {} running flow(s)", running.len());
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            error!("Flow task failed to join: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MockTaskBackend;
    use crate::backends::TaskOutput;
    use crate::models::{StageDefinition, TaskDefinition};
    use crate::policy::PolicyKind;
    use serde_json::json;

    fn orchestrator() -> Orchestrator {
        let mut backend = MockTaskBackend::new();
        backend
            .expect_execute_task()
            .returning(|_, _, _| Ok(TaskOutput::new(json!({"ok": true}))));
        let config = EngineConfig {
            tick_interval_ms: 20,
            ..Default::default()
        };
        Orchestrator::new(config, Arc::new(backend)).unwrap()
    }

    fn def(name: &str) -> FlowDefinition {
        FlowDefinition::new(name)
            .with_stage(StageDefinition::sequential("s").with_task(TaskDefinition::new("t")))
    }

    #[tokio::test]
    async fn test_start_twice() {
        let orch = orchestrator();
        orch.start().unwrap();
        assert!(matches!(orch.start(), Err(EngineError::AlreadyRunning)));
        orch.stop().await;
        assert!(!orch.is_running());
        // Stopping again is harmless
        orch.stop().await;
    }

    #[tokio::test]
    async fn test_sync_requires_running() {
        let orch = orchestrator();
        let result = orch
            .execute_flow_sync(def("early"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(EngineError::NotRunning)));
    }

    #[tokio::test]
    async fn test_submissions_queue_before_start() {
        let orch = orchestrator();
        let id = orch.submit_flow(def("queued")).unwrap();
        assert_eq!(orch.get_flow_status(id).unwrap(), FlowStatus::Ready);
        assert_eq!(orch.scheduler_status().pending_count, 1);

        orch.start().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), orch.wait_for(id))
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_success());
        orch.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_requirements_rejected() {
        let orch = orchestrator();
        let total = orch.ledger().total_capacity();
        let result = orch.submit_flow(def("huge").with_requirements(total + 1));
        assert!(matches!(result, Err(EngineError::InvalidDefinition(_))));
        assert!(orch.list_flows(&FlowFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn test_scheduler_status_reports_policy() {
        let orch = orchestrator();
        let status = orch.scheduler_status();
        assert_eq!(status.active_policy, PolicyKind::Priority);
        assert_eq!(status.dispatched_count, 0);
        assert_eq!(status.system_load_percent, 0.0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = EngineConfig {
            max_concurrent_flows: 0,
            ..Default::default()
        };
        let result = Orchestrator::new(config, Arc::new(MockTaskBackend::new()));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
