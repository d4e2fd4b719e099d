use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::Graph;
use crate::quality::QualityLabel;

/// Where an input port gets its value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum InputBinding {
  /// A literal value fixed in the pipeline definition.
  Static { value: Value },
  /// The named output of another node.
  Connection { node_id: String, output: String },
  /// A value the caller must supply when submitting the run.
  Unresolved {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prompt: Option<String>,
  },
}

/// Per-node overrides for the adaptive refinement loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinementConfig {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_iterations: Option<u32>,
  /// Judged quality at or above this level is accepted regardless of the
  /// judge's decision.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub quality_threshold: Option<QualityLabel>,
  /// Input ports the optimizer is not allowed to change.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub locked_inputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineNode {
  pub node_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  pub tool_id: String,
  #[serde(default)]
  pub inputs: HashMap<String, InputBinding>,
  #[serde(default)]
  pub adaptive: bool,
  #[serde(default)]
  pub optional: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub refinement: Option<RefinementConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}

impl PipelineNode {
  pub fn new(node_id: impl Into<String>, tool_id: impl Into<String>) -> Self {
    Self {
      node_id: node_id.into(),
      name: None,
      tool_id: tool_id.into(),
      inputs: HashMap::new(),
      adaptive: false,
      optional: false,
      refinement: None,
      timeout_ms: None,
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn with_static(mut self, port: impl Into<String>, value: Value) -> Self {
    self.inputs.insert(port.into(), InputBinding::Static { value });
    self
  }

  pub fn with_connection(
    mut self,
    port: impl Into<String>,
    node_id: impl Into<String>,
    output: impl Into<String>,
  ) -> Self {
    self.inputs.insert(
      port.into(),
      InputBinding::Connection {
        node_id: node_id.into(),
        output: output.into(),
      },
    );
    self
  }

  pub fn with_unresolved(mut self, port: impl Into<String>, prompt: Option<&str>) -> Self {
    self.inputs.insert(
      port.into(),
      InputBinding::Unresolved {
        prompt: prompt.map(str::to_string),
      },
    );
    self
  }

  pub fn adaptive(mut self) -> Self {
    self.adaptive = true;
    self
  }

  pub fn optional(mut self) -> Self {
    self.optional = true;
    self
  }

  pub fn with_refinement(mut self, refinement: RefinementConfig) -> Self {
    self.refinement = Some(refinement);
    self
  }

  pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
    self.timeout_ms = Some(timeout_ms);
    self
  }

  /// Display name, falling back to the node id.
  pub fn display_name(&self) -> &str {
    self.name.as_deref().unwrap_or(&self.node_id)
  }

  /// Static value bound to a port, if any.
  pub fn static_value(&self, port: &str) -> Option<&Value> {
    match self.inputs.get(port) {
      Some(InputBinding::Static { value }) => Some(value),
      _ => None,
    }
  }

  pub fn locked_inputs(&self) -> &[String] {
    self
      .refinement
      .as_ref()
      .map(|r| r.locked_inputs.as_slice())
      .unwrap_or(&[])
  }
}

/// A specific port on a specific node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
  pub node_id: String,
  pub port: String,
}

impl PortRef {
  pub fn new(node_id: impl Into<String>, port: impl Into<String>) -> Self {
    Self {
      node_id: node_id.into(),
      port: port.into(),
    }
  }
}

impl fmt::Display for PortRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.node_id, self.port)
  }
}

/// Data flow from one node's output port to another node's input port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineEdge {
  pub source: PortRef,
  pub target: PortRef,
}

impl PipelineEdge {
  pub fn new(
    source_node: impl Into<String>,
    source_port: impl Into<String>,
    target_node: impl Into<String>,
    target_port: impl Into<String>,
  ) -> Self {
    Self {
      source: PortRef::new(source_node, source_port),
      target: PortRef::new(target_node, target_port),
    }
  }
}

impl fmt::Display for PipelineEdge {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} -> {}", self.source, self.target)
  }
}

/// A declarative graph of tool invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
  pub pipeline_id: String,
  pub name: String,
  #[serde(default)]
  pub description: String,
  pub nodes: Vec<PipelineNode>,
  #[serde(default)]
  pub edges: Vec<PipelineEdge>,
}

impl Pipeline {
  pub fn new(pipeline_id: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      pipeline_id: pipeline_id.into(),
      name: name.into(),
      description: String::new(),
      nodes: Vec::new(),
      edges: Vec::new(),
    }
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  pub fn with_node(mut self, node: PipelineNode) -> Self {
    self.nodes.push(node);
    self
  }

  pub fn with_edge(mut self, edge: PipelineEdge) -> Self {
    self.edges.push(edge);
    self
  }

  /// Get a node by ID.
  pub fn node(&self, node_id: &str) -> Option<&PipelineNode> {
    self.nodes.iter().find(|n| n.node_id == node_id)
  }

  pub fn node_mut(&mut self, node_id: &str) -> Option<&mut PipelineNode> {
    self.nodes.iter_mut().find(|n| n.node_id == node_id)
  }

  /// Explicit edges followed by the edges implied by `Connection` bindings,
  /// with identical duplicates collapsed. Order is deterministic.
  pub fn effective_edges(&self) -> Vec<PipelineEdge> {
    let mut edges: Vec<PipelineEdge> = Vec::with_capacity(self.edges.len());
    for edge in &self.edges {
      if !edges.contains(edge) {
        edges.push(edge.clone());
      }
    }

    for node in &self.nodes {
      let mut ports: Vec<&String> = node.inputs.keys().collect();
      ports.sort();
      for port in ports {
        if let Some(InputBinding::Connection {
          node_id: source,
          output,
        }) = node.inputs.get(port)
        {
          let edge = PipelineEdge::new(source, output, &node.node_id, port);
          if !edges.contains(&edge) {
            edges.push(edge);
          }
        }
      }
    }

    edges
  }

  /// Build the graph structure for traversal.
  pub fn graph(&self) -> Graph {
    Graph::new(self)
  }

  /// Ports still waiting for a caller-supplied value, as `(node_id, port, prompt)`.
  pub fn unresolved_inputs(&self) -> Vec<(&str, &str, Option<&str>)> {
    let mut unresolved = Vec::new();
    for node in &self.nodes {
      for (port, binding) in &node.inputs {
        if let InputBinding::Unresolved { prompt } = binding {
          unresolved.push((node.node_id.as_str(), port.as_str(), prompt.as_deref()));
        }
      }
    }
    unresolved.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    unresolved
  }
}
