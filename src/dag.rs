//! Dependency graph manager for flow-to-flow dependencies
//!
//! Edges point from a prerequisite flow to the flow that waits on it. Every
//! mutation is checked against the whole graph and rolled back on a cycle, so a
//! rejected registration leaves no partial edges behind.

use crate::error::{EngineError, Result};
use crate::models::FlowId;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// Progress of a flow as far as its dependents are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Completed,
    /// Failed or cancelled; dependents can never become ready
    Failed,
}

#[derive(Debug)]
struct FlowNode {
    id: FlowId,
    label: String,
    state: NodeState,
}

/// Dependency graph over submitted flows
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: StableDiGraph<FlowNode, ()>,
    indices: HashMap<FlowId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn contains(&self, flow_id: FlowId) -> bool {
        self.indices.contains_key(&flow_id)
    }

    pub fn state(&self, flow_id: FlowId) -> Option<NodeState> {
        self.indices.get(&flow_id).map(|&idx| self.graph[idx].state)
    }

    /// Register a flow together with its prerequisite edges
    pub fn register(&mut self, flow_id: FlowId, label: &str, dependency_ids: &[FlowId]) -> Result<()> {
        if self.indices.contains_key(&flow_id) {
            return Err(EngineError::InvalidDefinition(format!(
                "flow {flow_id} is already registered"
            )));
        }

        let mut dep_indices = Vec::with_capacity(dependency_ids.len());
        for dep in dependency_ids {
            if *dep == flow_id {
                return Err(EngineError::CyclicDependency {
                    cycle: vec![label.to_string(), label.to_string()],
                });
            }
            let idx = self
                .indices
                .get(dep)
                .copied()
                .ok_or_else(|| EngineError::UnknownDependency {
                    flow: label.to_string(),
                    dependency: dep.to_string(),
                })?;
            if !dep_indices.contains(&idx) {
                dep_indices.push(idx);
            }
        }

        let node = self.graph.add_node(FlowNode {
            id: flow_id,
            label: label.to_string(),
            state: NodeState::Pending,
        });
        for dep_idx in dep_indices {
            self.graph.add_edge(dep_idx, node, ());
        }

        if let Err(e) = self.validate_acyclic() {
            // Removing the node drops every edge added above
            self.graph.remove_node(node);
            return Err(e);
        }

        self.indices.insert(flow_id, node);
        Ok(())
    }

    /// Forget a flow and every edge touching it; returns whether it was present
    pub fn remove(&mut self, flow_id: FlowId) -> bool {
        match self.indices.remove(&flow_id) {
            Some(idx) => self.graph.remove_node(idx).is_some(),
            None => false,
        }
    }

    /// Add one more prerequisite to an already registered flow
    pub fn add_dependency(&mut self, flow_id: FlowId, dependency_id: FlowId) -> Result<()> {
        let node = self.index_of(flow_id)?;
        let dep = self.index_of(dependency_id)?;

        if self.graph.find_edge(dep, node).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(dep, node, ());
        if let Err(e) = self.validate_acyclic() {
            self.graph.remove_edge(edge);
            return Err(e);
        }
        Ok(())
    }

    /// Validate that the graph is acyclic
    pub fn validate_acyclic(&self) -> Result<()> {
        if is_cyclic_directed(&self.graph) {
            return Err(EngineError::CyclicDependency {
                cycle: self.find_cycle(),
            });
        }
        Ok(())
    }

    /// Find a cycle in the graph for error reporting
    fn find_cycle(&self) -> Vec<String> {
        let mut on_stack: HashMap<NodeIndex, bool> = HashMap::new();
        let mut path = Vec::new();

        for node in self.graph.node_indices() {
            if !on_stack.contains_key(&node) {
                if let Some(cycle) = self.dfs_find_cycle(node, &mut on_stack, &mut path) {
                    return cycle;
                }
            }
        }

        Vec::new()
    }

    fn dfs_find_cycle(
        &self,
        node: NodeIndex,
        on_stack: &mut HashMap<NodeIndex, bool>,
        path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<String>> {
        if let Some(&active) = on_stack.get(&node) {
            if active {
                let start = path.iter().position(|&n| n == node).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&n| self.graph[n].label.clone())
                    .collect();
                cycle.push(self.graph[node].label.clone());
                return Some(cycle);
            }
            return None;
        }

        on_stack.insert(node, true);
        path.push(node);

        for next in self.graph.neighbors(node) {
            if let Some(cycle) = self.dfs_find_cycle(next, on_stack, path) {
                return Some(cycle);
            }
        }

        path.pop();
        on_stack.insert(node, false);
        None
    }

    /// A flow is ready when it is pending and every prerequisite completed
    pub fn is_ready(&self, flow_id: FlowId) -> bool {
        let Some(&idx) = self.indices.get(&flow_id) else {
            return false;
        };
        self.graph[idx].state == NodeState::Pending
            && self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .all(|dep| self.graph[dep].state == NodeState::Completed)
    }

    /// Record completion and return the dependents whose last unmet
    /// prerequisite was just satisfied
    pub fn mark_completed(&mut self, flow_id: FlowId) -> Vec<FlowId> {
        let Some(&idx) = self.indices.get(&flow_id) else {
            return Vec::new();
        };
        self.graph[idx].state = NodeState::Completed;

        let mut ready: Vec<FlowId> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .filter(|&dependent| self.is_ready(self.graph[dependent].id))
            .map(|dependent| self.graph[dependent].id)
            .collect();
        ready.sort();
        ready.dedup();
        ready
    }

    /// Record failure or cancellation and return every pending transitive
    /// dependent, now permanently blocked. Those are marked failed as well.
    pub fn mark_failed(&mut self, flow_id: FlowId) -> Vec<FlowId> {
        let Some(&idx) = self.indices.get(&flow_id) else {
            return Vec::new();
        };
        self.graph[idx].state = NodeState::Failed;

        let mut blocked = Vec::new();
        let mut queue = VecDeque::from([idx]);
        let mut seen = HashSet::from([idx]);
        while let Some(current) = queue.pop_front() {
            let dependents: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(current, Direction::Outgoing)
                .collect();
            for dependent in dependents {
                if !seen.insert(dependent) {
                    continue;
                }
                if self.graph[dependent].state == NodeState::Pending {
                    self.graph[dependent].state = NodeState::Failed;
                    blocked.push(self.graph[dependent].id);
                    queue.push_back(dependent);
                }
            }
        }
        blocked
    }

    /// First prerequisite that already failed, if any
    pub fn failed_dependency(&self, flow_id: FlowId) -> Option<FlowId> {
        let &idx = self.indices.get(&flow_id)?;
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .find(|&dep| self.graph[dep].state == NodeState::Failed)
            .map(|dep| self.graph[dep].id)
    }

    /// Flows the given flow waits on
    pub fn dependencies_of(&self, flow_id: FlowId) -> Vec<FlowId> {
        self.neighbors(flow_id, Direction::Incoming)
    }

    /// Flows waiting on the given flow
    pub fn dependents_of(&self, flow_id: FlowId) -> Vec<FlowId> {
        self.neighbors(flow_id, Direction::Outgoing)
    }

    fn neighbors(&self, flow_id: FlowId, direction: Direction) -> Vec<FlowId> {
        match self.indices.get(&flow_id) {
            Some(&idx) => {
                let mut ids: Vec<FlowId> = self
                    .graph
                    .neighbors_directed(idx, direction)
                    .map(|n| self.graph[n].id)
                    .collect();
                ids.sort();
                ids
            }
            None => Vec::new(),
        }
    }

    /// All registered flows, prerequisites first
    pub fn topological_order(&self) -> Result<Vec<FlowId>> {
        let sorted = toposort(&self.graph, None).map_err(|_| EngineError::CyclicDependency {
            cycle: self.find_cycle(),
        })?;
        Ok(sorted.into_iter().map(|idx| self.graph[idx].id).collect())
    }

    fn index_of(&self, flow_id: FlowId) -> Result<NodeIndex> {
        self.indices
            .get(&flow_id)
            .copied()
            .ok_or(EngineError::NotFound(flow_id))
    }
}
