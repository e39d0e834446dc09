//! Resource ledger: flow-level capacity reservations and agent slot leases
//!
//! Two kinds of accounting live here:
//!
//! - **Reservations**: a dispatched flow holds `resource_requirements` units out
//!   of the pool formed by all agent capacities. Released when the flow settles.
//! - **Leases**: a running task holds one slot on one agent. An [`AgentLease`]
//!   releases its slot when dropped, so every exit path of a task attempt frees
//!   the agent.
//!
//! All mutations go through a single mutex; `current_load <= capacity` holds
//! for every agent at every observable instant.

use crate::config::EngineConfig;
use crate::control::CancelSignal;
use crate::error::{EngineError, Result, TaskError};
use crate::models::{AgentId, FlowId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Handle for a flow-level reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationToken(u64);

/// Point-in-time view of one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub capabilities: BTreeSet<String>,
    pub capacity: u32,
    pub current_load: u32,
}

/// Consistent copy of the ledger taken under one lock acquisition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub total_capacity: u32,
    pub reserved: u32,
    pub agents: Vec<AgentSnapshot>,
}

impl LedgerSnapshot {
    pub fn free(&self) -> u32 {
        self.total_capacity.saturating_sub(self.reserved)
    }

    pub fn load_percent(&self) -> f64 {
        if self.total_capacity == 0 {
            return 0.0;
        }
        f64::from(self.reserved) / f64::from(self.total_capacity) * 100.0
    }
}

#[derive(Debug)]
struct AgentSlot {
    capabilities: BTreeSet<String>,
    capacity: u32,
    current_load: u32,
}

#[derive(Debug)]
struct Reservation {
    flow_id: FlowId,
    units: u32,
}

#[derive(Debug, Default)]
struct LedgerState {
    agents: BTreeMap<AgentId, AgentSlot>,
    reservations: HashMap<ReservationToken, Reservation>,
    reserved: u32,
    next_token: u64,
}

impl LedgerState {
    fn total_capacity(&self) -> u32 {
        self.agents.values().map(|a| a.capacity).sum()
    }

    /// Least-loaded capable agent with a free slot; ties go to the smallest id
    fn pick_agent(
        &self,
        capabilities: &BTreeSet<String>,
        exclude: &HashSet<AgentId>,
    ) -> Option<&AgentId> {
        self.agents
            .iter()
            .filter(|(id, slot)| {
                !exclude.contains(*id)
                    && slot.current_load < slot.capacity
                    && capabilities.is_subset(&slot.capabilities)
            })
            .min_by(|(a_id, a), (b_id, b)| {
                a.current_load
                    .cmp(&b.current_load)
                    .then_with(|| a_id.cmp(b_id))
            })
            .map(|(id, _)| id)
    }

    fn capable<'a>(&'a self, capabilities: &'a BTreeSet<String>) -> impl Iterator<Item = (&'a AgentId, &'a AgentSlot)> + 'a {
        self.agents
            .iter()
            .filter(move |(_, slot)| capabilities.is_subset(&slot.capabilities))
    }

    fn snapshot_agent(id: &AgentId, slot: &AgentSlot) -> AgentSnapshot {
        AgentSnapshot {
            id: id.clone(),
            capabilities: slot.capabilities.clone(),
            capacity: slot.capacity,
            current_load: slot.current_load,
        }
    }
}

/// Shared resource ledger
#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    state: Arc<Mutex<LedgerState>>,
    released: Arc<Notify>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ledger with the agents declared in the configuration
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let ledger = Self::new();
        for agent in &config.agents {
            ledger.register_agent(
                agent.id.clone(),
                agent.capabilities.clone(),
                config.agent_capacity(agent),
            )?;
        }
        Ok(ledger)
    }

    /// Register an agent, or update the capabilities and capacity of an existing one
    pub fn register_agent(
        &self,
        id: impl Into<AgentId>,
        capabilities: BTreeSet<String>,
        capacity: u32,
    ) -> Result<()> {
        let id = id.into();
        if capacity == 0 {
            return Err(EngineError::Config(format!(
                "agent '{id}' must have a capacity of at least 1"
            )));
        }

        let mut state = self.state.lock();
        let total = state.total_capacity();
        let reserved = state.reserved;
        match state.agents.get_mut(&id) {
            Some(slot) => {
                if capacity < slot.current_load {
                    return Err(EngineError::Config(format!(
                        "agent '{id}' has {} task(s) in flight, cannot shrink to {capacity}",
                        slot.current_load
                    )));
                }
                let new_total = total - slot.capacity + capacity;
                if new_total < reserved {
                    return Err(EngineError::Config(format!(
                        "agent '{id}' capacity {capacity} would leave {new_total} units for {reserved} reserved"
                    )));
                }
                slot.capabilities = capabilities;
                slot.capacity = capacity;
            }
            None => {
                state.agents.insert(
                    id.clone(),
                    AgentSlot {
                        capabilities,
                        capacity,
                        current_load: 0,
                    },
                );
            }
        }
        drop(state);

        info!(agent = %id, capacity, "Agent registered");
        self.released.notify_waiters();
        Ok(())
    }

    pub fn total_capacity(&self) -> u32 {
        self.state.lock().total_capacity()
    }

    pub fn reserved(&self) -> u32 {
        self.state.lock().reserved
    }

    /// Would a reservation of `requirements` units succeed right now
    pub fn can_admit(&self, requirements: u32) -> bool {
        let state = self.state.lock();
        state.reserved.saturating_add(requirements) <= state.total_capacity()
    }

    /// Reserve capacity for a dispatched flow
    pub fn reserve(&self, flow_id: FlowId, requirements: u32) -> Result<ReservationToken> {
        let mut state = self.state.lock();
        let total = state.total_capacity();
        let available = total.saturating_sub(state.reserved);
        if requirements > available {
            return Err(EngineError::ResourceExhausted {
                requested: requirements,
                available,
            });
        }

        let token = ReservationToken(state.next_token);
        state.next_token += 1;
        state.reserved += requirements;
        state.reservations.insert(
            token,
            Reservation {
                flow_id,
                units: requirements,
            },
        );
        debug!(flow_id = %flow_id, units = requirements, "Reserved capacity");
        Ok(token)
    }

    /// Release a reservation. Releasing an unknown or already released token
    /// is a no-op; returns whether anything was released.
    pub fn release(&self, token: ReservationToken) -> bool {
        let mut state = self.state.lock();
        match state.reservations.remove(&token) {
            Some(reservation) => {
                state.reserved = state.reserved.saturating_sub(reservation.units);
                debug!(
                    flow_id = %reservation.flow_id,
                    units = reservation.units,
                    "Released capacity"
                );
                true
            }
            None => false,
        }
    }

    /// Least-loaded agent (with a free slot) whose capabilities cover the request
    pub fn agent_for(&self, capabilities: &BTreeSet<String>) -> Option<AgentSnapshot> {
        let state = self.state.lock();
        let id = state.pick_agent(capabilities, &HashSet::new())?;
        state
            .agents
            .get(id)
            .map(|slot| LedgerState::snapshot_agent(id, slot))
    }

    /// Number of agents providing the capabilities, regardless of load
    pub fn capable_agents(&self, capabilities: &BTreeSet<String>) -> usize {
        self.state.lock().capable(capabilities).count()
    }

    /// Total slots across agents providing at least one of the capability sets
    pub fn capable_slots<'a>(
        &self,
        requirements: impl IntoIterator<Item = &'a BTreeSet<String>>,
    ) -> u32 {
        let requirements: Vec<&BTreeSet<String>> = requirements.into_iter().collect();
        self.state
            .lock()
            .agents
            .values()
            .filter(|slot| requirements.iter().any(|caps| caps.is_subset(&slot.capabilities)))
            .map(|slot| slot.capacity)
            .sum()
    }

    /// Atomically pick an agent and take one of its slots
    pub fn try_lease(
        &self,
        capabilities: &BTreeSet<String>,
        exclude: &HashSet<AgentId>,
    ) -> Option<AgentLease> {
        let mut state = self.state.lock();
        let id = state.pick_agent(capabilities, exclude)?.clone();
        let slot = state.agents.get_mut(&id)?;
        slot.current_load += 1;
        let agent = LedgerState::snapshot_agent(&id, slot);
        Some(AgentLease {
            ledger: self.clone(),
            agent,
        })
    }

    /// Wait for a capable agent slot.
    ///
    /// Agents in `exclude` are skipped unless they are the only capable ones.
    /// Fails with `AgentUnavailable` when no registered agent has the
    /// capabilities, and with `Cancelled` when the signal fires first.
    pub async fn lease(
        &self,
        capabilities: &BTreeSet<String>,
        exclude: &HashSet<AgentId>,
        cancel: &CancelSignal,
    ) -> std::result::Result<AgentLease, TaskError> {
        let no_exclusions = HashSet::new();
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let capable: Vec<AgentId> = {
                let state = self.state.lock();
                state.capable(capabilities).map(|(id, _)| id.clone()).collect()
            };
            if capable.is_empty() {
                return Err(TaskError::AgentUnavailable {
                    capabilities: capabilities.iter().cloned().collect(),
                });
            }
            let exclude = if capable.iter().all(|id| exclude.contains(id)) {
                &no_exclusions
            } else {
                exclude
            };

            if let Some(lease) = self.try_lease(capabilities, exclude) {
                return Ok(lease);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(TaskError::Cancelled),
            }
        }
    }

    fn release_agent(&self, id: &str) {
        {
            let mut state = self.state.lock();
            if let Some(slot) = state.agents.get_mut(id) {
                slot.current_load = slot.current_load.saturating_sub(1);
            }
        }
        self.released.notify_waiters();
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock();
        LedgerSnapshot {
            total_capacity: state.total_capacity(),
            reserved: state.reserved,
            agents: state
                .agents
                .iter()
                .map(|(id, slot)| LedgerState::snapshot_agent(id, slot))
                .collect(),
        }
    }
}

/// One slot on one agent, released on drop
#[derive(Debug)]
pub struct AgentLease {
    ledger: ResourceLedger,
    agent: AgentSnapshot,
}

impl AgentLease {
    pub fn agent_id(&self) -> &str {
        &self.agent.id
    }

    /// Agent as seen at lease time
    pub fn agent(&self) -> &AgentSnapshot {
        &self.agent
    }
}

impl Drop for AgentLease {
    fn drop(&mut self) {
        self.ledger.release_agent(&self.agent.id);
    }
}
