//! YAML parser with validation for flow definitions and flow bundles
//!
//! A flow file holds either a single [`FlowDefinition`] or a [`FlowBundle`]
//! (`flows:` list) whose entries reference each other by name through
//! `depends_on`.

use crate::error::{EngineError, Result};
use crate::models::*;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Contents of one flow file
#[derive(Debug, Clone)]
pub enum FlowDocument {
    Single(FlowDefinition),
    Bundle(FlowBundle),
}

impl FlowDocument {
    /// Number of flows declared by the document
    pub fn flow_count(&self) -> usize {
        match self {
            FlowDocument::Single(_) => 1,
            FlowDocument::Bundle(bundle) => bundle.flows.len(),
        }
    }
}

/// Several flows submitted together, linked by name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowBundle {
    pub flows: Vec<BundleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntry {
    #[serde(flatten)]
    pub definition: FlowDefinition,
    /// Names of other flows in the same bundle
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl FlowBundle {
    /// Validate every entry and the name references between them
    pub fn validate(&self) -> Result<()> {
        if self.flows.is_empty() {
            return Err(EngineError::InvalidDefinition(
                "bundle must contain at least one flow".into(),
            ));
        }

        let mut names = HashSet::with_capacity(self.flows.len());
        for entry in &self.flows {
            validate_flow_definition(&entry.definition)?;
            if !names.insert(entry.definition.name.as_str()) {
                return Err(EngineError::InvalidDefinition(format!(
                    "duplicate flow name '{}' in bundle",
                    entry.definition.name
                )));
            }
        }
        for entry in &self.flows {
            for dep in &entry.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(EngineError::UnknownDependency {
                        flow: entry.definition.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.submission_order().map(|_| ())
    }

    /// Entries ordered so that every flow comes after the flows it depends on
    pub fn submission_order(&self) -> Result<Vec<&BundleEntry>> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..self.flows.len()).map(|i| graph.add_node(i)).collect();
        let index: HashMap<&str, NodeIndex> = self
            .flows
            .iter()
            .zip(&nodes)
            .map(|(entry, node)| (entry.definition.name.as_str(), *node))
            .collect();

        for (entry, node) in self.flows.iter().zip(&nodes) {
            for dep in &entry.depends_on {
                let dep_node = index.get(dep.as_str()).ok_or_else(|| {
                    EngineError::UnknownDependency {
                        flow: entry.definition.name.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                graph.add_edge(*dep_node, *node, ());
            }
        }

        match toposort(&graph, None) {
            Ok(order) => Ok(order.into_iter().map(|n| &self.flows[graph[n]]).collect()),
            Err(_) => Err(EngineError::CyclicDependency {
                cycle: self.find_cycle(&graph),
            }),
        }
    }

    fn find_cycle(&self, graph: &DiGraph<usize, ()>) -> Vec<String> {
        for scc in tarjan_scc(graph) {
            let self_loop = scc.len() == 1 && graph.contains_edge(scc[0], scc[0]);
            if scc.len() > 1 || self_loop {
                let mut cycle: Vec<String> = scc
                    .iter()
                    .rev()
                    .map(|n| self.flows[graph[*n]].definition.name.clone())
                    .collect();
                cycle.push(cycle[0].clone());
                return cycle;
            }
        }
        Vec::new()
    }
}

/// Parse a flow file (single flow or bundle) from disk.
///
/// # Errors
///
/// * `EngineError::Io` - If the file cannot be read
/// * `EngineError::YamlSizeExceeded` - If the file exceeds 1MB
/// * `EngineError::YamlParse` - If the YAML is malformed
/// * `EngineError::InvalidDefinition` - If a definition breaks a validation rule
pub fn parse_flow_file<P: AsRef<Path>>(path: P) -> Result<FlowDocument> {
    let content = fs::read_to_string(path)?;
    parse_flow_yaml(&content)
}

/// Parse a flow document from a YAML string.
///
/// ```
/// use flowplane::parser::{parse_flow_yaml, FlowDocument};
///
/// let yaml = r#"
/// name: nightly-report
/// priority: 2
/// stages:
///   - name: build
///     tasks:
///       - name: render
///         parameters:
///           command: /bin/echo
///           args: ["done"]
/// "#;
///
/// let FlowDocument::Single(flow) = parse_flow_yaml(yaml)? else {
///     unreachable!()
/// };
/// assert_eq!(flow.name, "nightly-report");
/// # Ok::<(), flowplane::error::EngineError>(())
/// ```
pub fn parse_flow_yaml(content: &str) -> Result<FlowDocument> {
    if content.len() > MAX_YAML_SIZE {
        return Err(EngineError::YamlSizeExceeded(content.len()));
    }

    let value: serde_yaml::Value = serde_yaml::from_str(content)?;
    if value.get("flows").is_some() {
        let bundle: FlowBundle = serde_yaml::from_value(value)?;
        bundle.validate()?;
        Ok(FlowDocument::Bundle(bundle))
    } else {
        let definition: FlowDefinition = serde_yaml::from_value(value)?;
        validate_flow_definition(&definition)?;
        Ok(FlowDocument::Single(definition))
    }
}

/// Check a definition against the structural rules enforced at submission
pub fn validate_flow_definition(definition: &FlowDefinition) -> Result<()> {
    let name = definition.name.trim();
    if name.is_empty() {
        return invalid("flow name cannot be empty".into());
    }
    if definition.name.len() > MAX_FLOW_NAME_LEN {
        return invalid(format!(
            "flow name exceeds {MAX_FLOW_NAME_LEN} characters"
        ));
    }
    if definition.name.chars().any(char::is_control) {
        return invalid(format!("flow name '{}' contains control characters", name));
    }
    if definition.stages.is_empty() {
        return invalid(format!("flow '{name}' has no stages"));
    }
    if definition.timeout_secs == Some(0) {
        return invalid(format!("flow '{name}' has a zero timeout"));
    }

    let task_count = definition.task_count();
    if task_count > MAX_TASK_COUNT {
        return invalid(format!(
            "flow '{name}' has {task_count} tasks (limit {MAX_TASK_COUNT})"
        ));
    }

    let mut dependencies = HashSet::with_capacity(definition.dependencies.len());
    for dep in &definition.dependencies {
        if !dependencies.insert(dep) {
            return invalid(format!("flow '{name}' lists dependency {dep} twice"));
        }
    }

    let mut stage_names = HashSet::with_capacity(definition.stages.len());
    for stage in &definition.stages {
        validate_name("stage", &stage.name)?;
        if !stage_names.insert(stage.name.as_str()) {
            return invalid(format!("duplicate stage name '{}'", stage.name));
        }
        if stage.tasks.is_empty() {
            return invalid(format!("stage '{}' has no tasks", stage.name));
        }

        let mut task_names = HashSet::with_capacity(stage.tasks.len());
        for task in &stage.tasks {
            validate_name("task", &task.name)?;
            if !task_names.insert(task.name.as_str()) {
                return invalid(format!(
                    "duplicate task name '{}' in stage '{}'",
                    task.name, stage.name
                ));
            }
            if task.task_type.trim().is_empty() {
                return invalid(format!("task '{}' has an empty type", task.name));
            }
            if task.timeout_secs == Some(0) {
                return invalid(format!("task '{}' has a zero timeout", task.name));
            }
            if task.required_capabilities.iter().any(|c| c.trim().is_empty()) {
                return invalid(format!(
                    "task '{}' requires an empty capability",
                    task.name
                ));
            }
        }
    }

    Ok(())
}

fn invalid(message: String) -> Result<()> {
    Err(EngineError::InvalidDefinition(message))
}

/// Stage and task names: alphanumeric plus `_`, `-` and `.`
fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return invalid(format!("{kind} name cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return invalid(format!(
            "{kind} name '{name}' exceeds {MAX_NAME_LEN} characters"
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return invalid(format!("invalid {kind} name '{name}'"));
    }
    Ok(())
}
