//! Scheduler control loop
//!
//! One loop per orchestrator. Each tick takes the Ready set, orders it with
//! the active policy, and admits flows while the concurrency cap and the
//! resource ledger allow. Admitted flows go to the executor intake channel.
//! The loop sleeps until the next tick or until a flow settles, whichever
//! comes first.

use crate::config::EngineConfig;
use crate::control::FlowControl;
use crate::models::{Flow, FlowId};
use crate::policy::{PolicyKind, ScheduleCandidate, SchedulingPolicy, SystemSnapshot};
use crate::state::EngineState;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Flow handed from the scheduler to the executor
#[derive(Debug)]
pub struct DispatchedFlow {
    pub flow: Flow,
    pub control: FlowControl,
}

/// Answer to `GetSchedulerStatus`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub pending_count: usize,
    pub dispatched_count: usize,
    pub system_load_percent: f64,
    pub active_policy: PolicyKind,
    pub max_concurrent_flows: usize,
}

impl SchedulerStatus {
    pub fn capture(state: &EngineState, policy: PolicyKind, max_concurrent: usize) -> Self {
        let counts = state.counts();
        Self {
            pending_count: counts.pending,
            dispatched_count: counts.active,
            system_load_percent: state.ledger().snapshot().load_percent(),
            active_policy: policy,
            max_concurrent_flows: max_concurrent,
        }
    }
}

pub struct Scheduler {
    state: Arc<EngineState>,
    policy: Arc<dyn SchedulingPolicy>,
    policy_kind: PolicyKind,
    max_concurrent: usize,
    tick_interval: Duration,
    intake: mpsc::Sender<DispatchedFlow>,
}

impl Scheduler {
    pub fn new(
        config: &EngineConfig,
        state: Arc<EngineState>,
        intake: mpsc::Sender<DispatchedFlow>,
    ) -> Self {
        Self {
            state,
            policy: config.scheduling_policy.build(),
            policy_kind: config.scheduling_policy,
            max_concurrent: config.max_concurrent_flows,
            tick_interval: config.tick_interval(),
            intake,
        }
    }

    pub fn policy(&self) -> PolicyKind {
        self.policy_kind
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus::capture(&self.state, self.policy_kind, self.max_concurrent)
    }

    /// Run one scheduling pass; returns how many flows were dispatched
    pub async fn tick(&self) -> usize {
        let candidates = self.state.ready_candidates();
        if candidates.is_empty() {
            return 0;
        }

        let counts = self.state.counts();
        let ledger = self.state.ledger();
        let snapshot = SystemSnapshot {
            now: Utc::now(),
            ledger: ledger.snapshot(),
            dispatched: counts.active,
            max_concurrent: self.max_concurrent,
        };
        let order = self.policy.order(&candidates, &snapshot);
        let by_id: HashMap<FlowId, &ScheduleCandidate> =
            candidates.iter().map(|c| (c.flow_id, c)).collect();

        let mut active = counts.active;
        let mut dispatched = 0;
        for entry in order {
            if active >= self.max_concurrent {
                debug!(
                    "Concurrency cap reached ({}/{}), deferring remaining flows",
                    active, self.max_concurrent
                );
                break;
            }
            let Some(candidate) = by_id.get(&entry.flow_id) else {
                continue;
            };

            let requirements = candidate.resource_requirements;
            if !ledger.can_admit(requirements) {
                debug!(flow_id = %entry.flow_id, requirements, "Insufficient capacity, deferring flow");
                continue;
            }
            let token = match ledger.reserve(entry.flow_id, requirements) {
                Ok(token) => token,
                Err(e) => {
                    debug!(flow_id = %entry.flow_id, "Deferring flow: {}", e);
                    continue;
                }
            };
            let Some((flow, control)) = self.state.dispatch(entry.flow_id, token) else {
                ledger.release(token);
                continue;
            };

            if self
                .intake
                .send(DispatchedFlow { flow, control })
                .await
                .is_err()
            {
                error!(flow_id = %entry.flow_id, "Executor intake closed, aborting flow");
                self.state
                    .abort(entry.flow_id, "executor intake closed before the flow could start");
                continue;
            }
            active += 1;
            dispatched += 1;
        }

        if dispatched > 0 {
            debug!("Dispatched {} flow(s) with {} policy", dispatched, self.policy.name());
        }
        dispatched
    }

    fn report(&self) {
        let counts = self.state.counts();
        self.state.metrics().set_queue_state(
            counts.pending,
            counts.active,
            self.state.ledger().snapshot().load_percent(),
        );
    }

    /// Tick until `shutdown` turns true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Scheduler started (policy: {}, max concurrent flows: {})",
            self.policy_kind, self.max_concurrent
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.state.woken() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.tick().await;
            self.report();
        }
        info!("Scheduler stopped");
    }
}
