//! In-memory flow table
//!
//! [`EngineState`] owns every [`Flow`] record from submission until it is
//! terminal, together with the dependency graph, and publishes status changes.
//!
//! Lock order: `flows` before `graph`. Neither lock is held across an await.

use crate::control::{CancelReason, FlowControl};
use crate::dag::DependencyGraph;
use crate::error::{EngineError, Result};
use crate::executor::ExecutionObserver;
use crate::ledger::{ReservationToken, ResourceLedger};
use crate::metrics::EngineMetrics;
use crate::models::{
    FailureCause, Flow, FlowDefinition, FlowEvent, FlowFilter, FlowId, FlowStatus, FlowSummary,
    StageStatus, Task,
};
use crate::policy::ScheduleCandidate;
use crate::recovery::FailureKind;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::futures::Notified;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct FlowEntry {
    flow: Flow,
    control: FlowControl,
    status_tx: watch::Sender<FlowStatus>,
    reservation: Option<ReservationToken>,
}

/// Queue counters used by the scheduler and `GetSchedulerStatus`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Queued + Ready
    pub pending: usize,
    /// Dispatched + Running + Paused
    pub active: usize,
}

/// Shared engine state
pub struct EngineState {
    flows: Mutex<HashMap<FlowId, FlowEntry>>,
    graph: Mutex<DependencyGraph>,
    ledger: ResourceLedger,
    metrics: EngineMetrics,
    events: broadcast::Sender<FlowEvent>,
    wake: Notify,
    seq: AtomicU64,
}

impl EngineState {
    pub fn new(ledger: ResourceLedger, metrics: EngineMetrics, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            flows: Mutex::new(HashMap::new()),
            graph: Mutex::new(DependencyGraph::new()),
            ledger,
            metrics,
            events,
            wake: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    /// Wake the scheduler loop before its next tick
    pub fn wake_scheduler(&self) {
        self.wake.notify_one();
    }

    pub fn woken(&self) -> Notified<'_> {
        self.wake.notified()
    }

    fn publish(&self, event: FlowEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Add a validated definition to the table and the dependency graph
    pub fn register(&self, definition: FlowDefinition) -> Result<FlowId> {
        let mut flows = self.flows.lock();
        let mut graph = self.graph.lock();

        let id = Uuid::new_v4();
        graph.register(id, &definition.name, &definition.dependencies)?;
        self.insert(&mut flows, &mut graph, id, definition);
        drop(graph);
        drop(flows);

        self.wake_scheduler();
        Ok(id)
    }

    /// Register a group of flows all-or-nothing.
    ///
    /// `entries` must be in dependency order; each entry names earlier entries
    /// by flow name. On any error the graph is restored and no flow is added.
    pub fn register_group(
        &self,
        entries: Vec<(FlowDefinition, Vec<String>)>,
    ) -> Result<Vec<(String, FlowId)>> {
        let mut flows = self.flows.lock();
        let mut graph = self.graph.lock();

        let mut staged: Vec<(FlowId, FlowDefinition)> = Vec::with_capacity(entries.len());
        if let Err(e) = stage_group(&mut graph, entries, &mut staged) {
            for (id, _) in &staged {
                graph.remove(*id);
            }
            return Err(e);
        }

        let mut ids = Vec::with_capacity(staged.len());
        for (id, definition) in staged {
            ids.push((definition.name.clone(), id));
            self.insert(&mut flows, &mut graph, id, definition);
        }
        drop(graph);
        drop(flows);

        self.wake_scheduler();
        Ok(ids)
    }

    /// Create the table entry of a flow already present in the graph
    fn insert(
        &self,
        flows: &mut HashMap<FlowId, FlowEntry>,
        graph: &mut DependencyGraph,
        id: FlowId,
        definition: FlowDefinition,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let flow = Flow::from_definition(id, definition, seq, Utc::now());
        let (status_tx, _) = watch::channel(FlowStatus::Queued);
        info!(flow_id = %id, "Flow '{}' submitted", flow.name);
        flows.insert(
            id,
            FlowEntry {
                flow,
                control: FlowControl::new(),
                status_tx,
                reservation: None,
            },
        );
        self.metrics.record_submitted();
        self.publish(FlowEvent::Submitted { flow_id: id });

        if let Some(dependency) = graph.failed_dependency(id) {
            let status = flows
                .get(&dependency)
                .map(|e| e.flow.status)
                .unwrap_or(FlowStatus::Failed);
            warn!(flow_id = %id, "Dependency {} already {}, failing flow", dependency, status);
            self.settle(
                flows,
                graph,
                id,
                FlowStatus::Failed,
                Some(FailureCause::dependency(dependency, status)),
            );
        } else if graph.is_ready(id) {
            self.promote(flows, id);
        }
    }

    /// Drop terminal flows that no unfinished flow still depends on.
    ///
    /// Purged ids are forgotten entirely: later lookups return `NotFound` and
    /// new submissions naming them fail with `UnknownDependency`.
    pub fn purge_finished(&self) -> usize {
        let mut flows = self.flows.lock();
        let mut graph = self.graph.lock();

        let purgeable: Vec<FlowId> = flows
            .iter()
            .filter(|(_, e)| e.flow.status.is_terminal())
            .filter(|(id, _)| {
                graph.dependents_of(**id).iter().all(|dependent| {
                    flows
                        .get(dependent)
                        .map_or(true, |e| e.flow.status.is_terminal())
                })
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &purgeable {
            flows.remove(id);
            graph.remove(*id);
        }
        if !purgeable.is_empty() {
            debug!("Purged {} finished flow(s)", purgeable.len());
        }
        purgeable.len()
    }

    /// Add a prerequisite to a flow that has not been dispatched yet.
    ///
    /// A Ready flow only accepts dependencies that already completed, since
    /// statuses never move backwards.
    pub fn add_dependency(&self, flow_id: FlowId, dependency: FlowId) -> Result<()> {
        let mut flows = self.flows.lock();
        let mut graph = self.graph.lock();

        let status = flows
            .get(&flow_id)
            .map(|e| e.flow.status)
            .ok_or(EngineError::NotFound(flow_id))?;
        let dep_status = flows
            .get(&dependency)
            .map(|e| e.flow.status)
            .ok_or(EngineError::NotFound(dependency))?;

        match status {
            FlowStatus::Queued => {}
            FlowStatus::Ready if dep_status == FlowStatus::Completed => {}
            other => {
                return Err(EngineError::InvalidDefinition(format!(
                    "cannot add dependency to flow {flow_id} in status {other}"
                )))
            }
        }

        graph.add_dependency(flow_id, dependency)?;
        if let Some(entry) = flows.get_mut(&flow_id) {
            entry.flow.dependencies.insert(dependency);
        }
        debug!(flow_id = %flow_id, "Added dependency on {}", dependency);

        if matches!(dep_status, FlowStatus::Failed | FlowStatus::Cancelled) {
            self.settle(
                &mut flows,
                &mut graph,
                flow_id,
                FlowStatus::Failed,
                Some(FailureCause::dependency(dependency, dep_status)),
            );
        }
        Ok(())
    }

    /// Ready flows as policy candidates, in submission order
    pub fn ready_candidates(&self) -> Vec<ScheduleCandidate> {
        let flows = self.flows.lock();
        let mut candidates: Vec<ScheduleCandidate> = flows
            .values()
            .filter(|e| e.flow.status == FlowStatus::Ready)
            .map(|e| ScheduleCandidate::from_flow(&e.flow))
            .collect();
        candidates.sort_by_key(|c| c.seq);
        candidates
    }

    pub fn counts(&self) -> QueueCounts {
        let flows = self.flows.lock();
        let mut counts = QueueCounts::default();
        for entry in flows.values() {
            match entry.flow.status {
                FlowStatus::Queued | FlowStatus::Ready => counts.pending += 1,
                status if status.is_active() => counts.active += 1,
                _ => {}
            }
        }
        counts
    }

    /// Move a Ready flow to Dispatched and attach its reservation.
    ///
    /// Returns `None` if the flow is no longer Ready (cancelled in the
    /// meantime); the caller still owns the token then.
    pub fn dispatch(&self, flow_id: FlowId, token: ReservationToken) -> Option<(Flow, FlowControl)> {
        let mut flows = self.flows.lock();
        let entry = flows.get_mut(&flow_id)?;
        if entry.flow.status != FlowStatus::Ready {
            return None;
        }
        set_status(entry, FlowStatus::Dispatched);
        entry.reservation = Some(token);
        info!(flow_id = %flow_id, "Flow '{}' dispatched", entry.flow.name);
        let dispatched = (entry.flow.clone(), entry.control.clone());
        drop(flows);

        self.publish(FlowEvent::Dispatched { flow_id });
        Some(dispatched)
    }

    /// Store the executor's final record and settle dependents
    pub fn finish(&self, flow: Flow) {
        let mut flows = self.flows.lock();
        let mut graph = self.graph.lock();
        let id = flow.id;
        let status = flow.status;
        let failure = flow.failure.clone();
        if let Some(entry) = flows.get_mut(&id) {
            if entry.flow.status.is_terminal() {
                return;
            }
            // Keep the live status so settle() sees a legal transition
            let live = entry.flow.status;
            entry.flow = Flow { status: live, ..flow };
        }
        self.settle(&mut flows, &mut graph, id, status, failure);
    }

    /// Fail a flow that could not be handed to the executor
    pub fn abort(&self, flow_id: FlowId, message: &str) {
        let mut flows = self.flows.lock();
        let mut graph = self.graph.lock();
        self.settle(
            &mut flows,
            &mut graph,
            flow_id,
            FlowStatus::Failed,
            Some(FailureCause::aborted(message)),
        );
    }

    /// Cancel a flow. Terminal flows are left untouched.
    pub fn cancel(&self, flow_id: FlowId) -> Result<()> {
        let mut flows = self.flows.lock();
        let mut graph = self.graph.lock();
        let status = flows
            .get(&flow_id)
            .map(|e| e.flow.status)
            .ok_or(EngineError::NotFound(flow_id))?;

        match status {
            status if status.is_terminal() => {
                debug!(flow_id = %flow_id, "Cancel ignored, flow already {}", status);
            }
            FlowStatus::Queued | FlowStatus::Ready => {
                info!(flow_id = %flow_id, "Cancelling flow before dispatch");
                self.settle(&mut flows, &mut graph, flow_id, FlowStatus::Cancelled, None);
            }
            _ => {
                let requested = flows
                    .get(&flow_id)
                    .is_some_and(|e| e.control.cancel.cancel(CancelReason::Requested));
                if requested {
                    info!(flow_id = %flow_id, "Cancellation requested for running flow");
                }
            }
        }
        Ok(())
    }

    /// Signal every dispatched flow to stop
    pub fn cancel_active(&self, reason: CancelReason) -> usize {
        let flows = self.flows.lock();
        flows
            .values()
            .filter(|e| e.flow.status.is_active())
            .filter(|e| e.control.cancel.cancel(reason))
            .count()
    }

    /// Close the pause gate of a dispatched flow; returns false if there was nothing to pause
    pub fn pause(&self, flow_id: FlowId) -> Result<bool> {
        let flows = self.flows.lock();
        let entry = flows.get(&flow_id).ok_or(EngineError::NotFound(flow_id))?;
        match entry.flow.status {
            FlowStatus::Dispatched | FlowStatus::Running => Ok(entry.control.pause.pause()),
            _ => Ok(false),
        }
    }

    pub fn resume(&self, flow_id: FlowId) -> Result<bool> {
        let flows = self.flows.lock();
        let entry = flows.get(&flow_id).ok_or(EngineError::NotFound(flow_id))?;
        if entry.flow.status.is_terminal() {
            return Ok(false);
        }
        Ok(entry.control.pause.resume())
    }

    pub fn status(&self, flow_id: FlowId) -> Result<FlowStatus> {
        self.flows
            .lock()
            .get(&flow_id)
            .map(|e| e.flow.status)
            .ok_or(EngineError::NotFound(flow_id))
    }

    pub fn get(&self, flow_id: FlowId) -> Result<Flow> {
        self.flows
            .lock()
            .get(&flow_id)
            .map(|e| e.flow.clone())
            .ok_or(EngineError::NotFound(flow_id))
    }

    pub fn watch(&self, flow_id: FlowId) -> Result<watch::Receiver<FlowStatus>> {
        self.flows
            .lock()
            .get(&flow_id)
            .map(|e| e.status_tx.subscribe())
            .ok_or(EngineError::NotFound(flow_id))
    }

    /// Summaries in submission order
    pub fn list(&self, filter: &FlowFilter) -> Vec<FlowSummary> {
        let flows = self.flows.lock();
        let mut matching: Vec<&Flow> = flows
            .values()
            .map(|e| &e.flow)
            .filter(|f| filter.matches(f))
            .collect();
        matching.sort_by_key(|f| f.seq);
        matching
            .into_iter()
            .take(filter.limit.unwrap_or(usize::MAX))
            .map(Flow::summary)
            .collect()
    }

    fn promote(&self, flows: &mut HashMap<FlowId, FlowEntry>, flow_id: FlowId) {
        if let Some(entry) = flows.get_mut(&flow_id) {
            if entry.flow.status == FlowStatus::Queued && set_status(entry, FlowStatus::Ready) {
                debug!(flow_id = %flow_id, "Flow '{}' is ready", entry.flow.name);
                self.publish(FlowEvent::Ready { flow_id });
            }
        }
    }

    /// Move a flow to a terminal status, release its reservation and
    /// propagate the outcome through the dependency graph
    fn settle(
        &self,
        flows: &mut HashMap<FlowId, FlowEntry>,
        graph: &mut DependencyGraph,
        flow_id: FlowId,
        status: FlowStatus,
        failure: Option<FailureCause>,
    ) {
        let Some(entry) = flows.get_mut(&flow_id) else {
            return;
        };
        if !set_status(entry, status) {
            return;
        }
        if entry.flow.completed_at.is_none() {
            entry.flow.completed_at = Some(Utc::now());
        }
        if failure.is_some() {
            entry.flow.failure = failure;
        }
        if let Some(token) = entry.reservation.take() {
            self.ledger.release(token);
        }
        self.metrics.record_finished(status);
        self.publish(FlowEvent::Finished { flow_id, status });

        match status {
            FlowStatus::Completed => {
                for ready in graph.mark_completed(flow_id) {
                    self.promote(flows, ready);
                }
            }
            _ => {
                for blocked in graph.mark_failed(flow_id) {
                    let Some(entry) = flows.get_mut(&blocked) else {
                        continue;
                    };
                    warn!(
                        flow_id = %blocked,
                        "Dependency {} finished as {}, failing flow",
                        flow_id,
                        status
                    );
                    if set_status(entry, FlowStatus::Failed) {
                        entry.flow.completed_at = Some(Utc::now());
                        entry.flow.failure = Some(FailureCause::dependency(flow_id, status));
                        self.metrics.record_finished(FlowStatus::Failed);
                        self.publish(FlowEvent::Finished {
                            flow_id: blocked,
                            status: FlowStatus::Failed,
                        });
                    }
                }
            }
        }
        self.wake_scheduler();
    }

    fn with_entry(&self, flow_id: FlowId, f: impl FnOnce(&mut FlowEntry)) {
        if let Some(entry) = self.flows.lock().get_mut(&flow_id) {
            f(entry);
        }
    }
}

/// Add every group entry to the graph, resolving names to the ids assigned so far
fn stage_group(
    graph: &mut DependencyGraph,
    entries: Vec<(FlowDefinition, Vec<String>)>,
    staged: &mut Vec<(FlowId, FlowDefinition)>,
) -> Result<()> {
    let mut by_name: HashMap<String, FlowId> = HashMap::with_capacity(entries.len());
    for (mut definition, depends_on) in entries {
        for dep in &depends_on {
            let id = by_name
                .get(dep)
                .copied()
                .ok_or_else(|| EngineError::UnknownDependency {
                    flow: definition.name.clone(),
                    dependency: dep.clone(),
                })?;
            if !definition.dependencies.contains(&id) {
                definition.dependencies.push(id);
            }
        }

        let id = Uuid::new_v4();
        graph.register(id, &definition.name, &definition.dependencies)?;
        by_name.insert(definition.name.clone(), id);
        staged.push((id, definition));
    }
    Ok(())
}

/// Apply a legal transition and notify watchers
fn set_status(entry: &mut FlowEntry, next: FlowStatus) -> bool {
    if !entry.flow.status.can_transition_to(next) {
        return false;
    }
    entry.flow.status = next;
    entry.status_tx.send_replace(next);
    true
}

impl ExecutionObserver for EngineState {
    fn flow_started(&self, flow: &Flow) {
        let mut started = false;
        self.with_entry(flow.id, |entry| {
            entry.flow.started_at = flow.started_at;
            started = set_status(entry, FlowStatus::Running);
        });
        if started {
            self.publish(FlowEvent::Started { flow_id: flow.id });
        }
    }

    fn stage_updated(&self, flow_id: FlowId, stage: usize, status: StageStatus) {
        self.with_entry(flow_id, |entry| {
            if let Some(stage) = entry.flow.stages.get_mut(stage) {
                stage.status = status;
            }
        });
    }

    fn task_updated(&self, flow_id: FlowId, stage: usize, index: usize, task: &Task) {
        self.with_entry(flow_id, |entry| {
            if let Some(slot) = entry
                .flow
                .stages
                .get_mut(stage)
                .and_then(|s| s.tasks.get_mut(index))
            {
                *slot = task.clone();
            }
        });
    }

    fn flow_paused(&self, flow_id: FlowId, paused: bool) {
        let next = if paused {
            FlowStatus::Paused
        } else {
            FlowStatus::Running
        };
        let mut changed = false;
        self.with_entry(flow_id, |entry| changed = set_status(entry, next));
        if changed {
            info!(flow_id = %flow_id, "Flow {}", if paused { "paused" } else { "resumed" });
            self.publish(if paused {
                FlowEvent::Paused { flow_id }
            } else {
                FlowEvent::Resumed { flow_id }
            });
        }
    }

    fn task_retrying(&self, flow_id: FlowId, stage: &str, task: &str, attempt: u32, kind: FailureKind) {
        self.with_entry(flow_id, |entry| entry.flow.retry_count += 1);
        self.publish(FlowEvent::TaskRetrying {
            flow_id,
            stage: stage.to_string(),
            task: task.to_string(),
            attempt,
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailureReason, StageDefinition, TaskDefinition};
    use std::collections::BTreeSet;

    fn state() -> EngineState {
        let ledger = ResourceLedger::new();
        ledger.register_agent("local", BTreeSet::new(), 4).unwrap();
        EngineState::new(ledger, EngineMetrics::new().unwrap(), 64)
    }

    fn def(name: &str) -> FlowDefinition {
        FlowDefinition::new(name)
            .with_stage(StageDefinition::sequential("s").with_task(TaskDefinition::new("t")))
    }

    fn complete(state: &EngineState, id: FlowId) {
        let token = state.ledger().reserve(id, 1).unwrap();
        let (mut flow, _) = state.dispatch(id, token).unwrap();
        flow.status = FlowStatus::Completed;
        state.finish(flow);
    }

    #[test]
    fn test_register_readiness() {
        let state = state();
        let a = state.register(def("a")).unwrap();
        let b = state.register(def("b").with_dependency(a)).unwrap();
        assert_eq!(state.status(a).unwrap(), FlowStatus::Ready);
        assert_eq!(state.status(b).unwrap(), FlowStatus::Queued);
        assert_eq!(state.counts(), QueueCounts { pending: 2, active: 0 });

        complete(&state, a);
        assert_eq!(state.status(a).unwrap(), FlowStatus::Completed);
        assert_eq!(state.status(b).unwrap(), FlowStatus::Ready);
        assert_eq!(state.ledger().reserved(), 0);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let state = state();
        let result = state.register(def("x").with_dependency(Uuid::new_v4()));
        assert!(matches!(result, Err(EngineError::UnknownDependency { .. })));
        assert!(state.list(&FlowFilter::default()).is_empty());
    }

    #[test]
    fn test_cancel_propagates_to_dependents() {
        let state = state();
        let a = state.register(def("a")).unwrap();
        let b = state.register(def("b").with_dependency(a)).unwrap();
        let c = state.register(def("c").with_dependency(b)).unwrap();

        state.cancel(a).unwrap();
        assert_eq!(state.status(a).unwrap(), FlowStatus::Cancelled);
        for id in [b, c] {
            let flow = state.get(id).unwrap();
            assert_eq!(flow.status, FlowStatus::Failed);
            assert_eq!(
                flow.failure.unwrap().reason,
                FailureReason::DependencyFailed { dependency: a }
            );
        }

        // Idempotent
        state.cancel(a).unwrap();
        assert_eq!(state.status(a).unwrap(), FlowStatus::Cancelled);
        assert!(matches!(
            state.cancel(Uuid::new_v4()),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_submit_against_failed_dependency() {
        let state = state();
        let a = state.register(def("a")).unwrap();
        state.cancel(a).unwrap();
        let b = state.register(def("b").with_dependency(a)).unwrap();
        assert_eq!(state.status(b).unwrap(), FlowStatus::Failed);
    }

    #[test]
    fn test_add_dependency_rules() {
        let state = state();
        let a = state.register(def("a")).unwrap();
        let b = state.register(def("b").with_dependency(a)).unwrap();
        let c = state.register(def("c")).unwrap();

        // c is Ready and a has not completed
        assert!(matches!(
            state.add_dependency(c, a),
            Err(EngineError::InvalidDefinition(_))
        ));
        // b -> d -> b
        state.cancel(c).unwrap();
        let d = state.register(def("d").with_dependency(b)).unwrap();
        assert!(matches!(
            state.add_dependency(b, d),
            Err(EngineError::CyclicDependency { .. })
        ));
        assert!(!state.get(b).unwrap().dependencies.contains(&d));
    }

    #[test]
    fn test_dispatch_requires_ready() {
        let state = state();
        let a = state.register(def("a")).unwrap();
        let b = state.register(def("b").with_dependency(a)).unwrap();
        let token = state.ledger().reserve(b, 1).unwrap();
        assert!(state.dispatch(b, token).is_none());
        assert!(state.ledger().release(token));

        let token = state.ledger().reserve(a, 1).unwrap();
        let (flow, _) = state.dispatch(a, token).unwrap();
        assert_eq!(flow.status, FlowStatus::Dispatched);
        assert_eq!(state.counts().active, 1);
        assert!(state.ready_candidates().is_empty());
    }

    #[test]
    fn test_observer_updates_table() {
        let state = state();
        let a = state.register(def("a")).unwrap();
        let mut events = state.subscribe();
        let token = state.ledger().reserve(a, 1).unwrap();
        let (mut flow, _) = state.dispatch(a, token).unwrap();

        flow.started_at = Some(Utc::now());
        state.flow_started(&flow);
        assert_eq!(state.status(a).unwrap(), FlowStatus::Running);

        state.flow_paused(a, true);
        assert_eq!(state.status(a).unwrap(), FlowStatus::Paused);
        state.flow_paused(a, true);
        state.flow_paused(a, false);
        assert_eq!(state.status(a).unwrap(), FlowStatus::Running);

        let mut task = flow.stages[0].tasks[0].clone();
        task.attempt_count = 1;
        state.task_updated(a, 0, 0, &task);
        assert_eq!(state.get(a).unwrap().stages[0].tasks[0].attempt_count, 1);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                FlowEvent::Dispatched { flow_id: a },
                FlowEvent::Started { flow_id: a },
                FlowEvent::Paused { flow_id: a },
                FlowEvent::Resumed { flow_id: a },
            ]
        );
    }

    #[test]
    fn test_list_filter_and_limit() {
        let state = state();
        let a = state.register(def("etl-a")).unwrap();
        state.register(def("etl-b")).unwrap();
        state.register(def("report")).unwrap();
        state.cancel(a).unwrap();

        let etl = state.list(&FlowFilter {
            name_contains: Some("etl".into()),
            ..Default::default()
        });
        assert_eq!(etl.len(), 2);
        assert_eq!(etl[0].name, "etl-a");

        let ready = state.list(&FlowFilter::status(FlowStatus::Ready));
        assert_eq!(ready.len(), 2);

        let limited = state.list(&FlowFilter {
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_register_group_all_or_nothing() {
        let state = state();
        let entries = vec![
            (def("build"), vec![]),
            (
                def("publish").with_dependency(Uuid::new_v4()),
                vec!["build".to_string()],
            ),
        ];
        let result = state.register_group(entries);
        assert!(matches!(result, Err(EngineError::UnknownDependency { .. })));
        assert!(state.list(&FlowFilter::default()).is_empty());
        assert!(state.ready_candidates().is_empty());
        assert!(state.graph.lock().is_empty());

        let ids = state
            .register_group(vec![
                (def("build"), vec![]),
                (def("publish"), vec!["build".to_string()]),
            ])
            .unwrap();
        let (build, publish) = (ids[0].1, ids[1].1);
        assert_eq!(state.status(build).unwrap(), FlowStatus::Ready);
        assert_eq!(state.status(publish).unwrap(), FlowStatus::Queued);
        assert_eq!(state.graph.lock().dependencies_of(publish), vec![build]);
    }

    #[test]
    fn test_purge_keeps_flows_with_pending_dependents() {
        let state = state();
        let a = state.register(def("a")).unwrap();
        let b = state.register(def("b").with_dependency(a)).unwrap();
        let c = state.register(def("c")).unwrap();

        complete(&state, a);
        complete(&state, c);
        // a still has b waiting on it
        assert_eq!(state.purge_finished(), 1);
        assert!(matches!(state.status(c), Err(EngineError::NotFound(_))));
        assert_eq!(state.status(a).unwrap(), FlowStatus::Completed);
        assert_eq!(state.status(b).unwrap(), FlowStatus::Ready);

        complete(&state, b);
        assert_eq!(state.purge_finished(), 2);
        assert!(state.list(&FlowFilter::default()).is_empty());
        assert!(state.graph.lock().is_empty());
        assert_eq!(state.purge_finished(), 0);
    }
}
