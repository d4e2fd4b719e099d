use std::collections::{BTreeMap, HashSet};

use assay_catalog::{PortSpec, ToolCatalog, ToolDefinition, compatible};

use crate::error::{ValidationError, ValidationErrorKind};
use crate::pipeline::{InputBinding, Pipeline, PipelineEdge};

/// Outcome of [`validate`]: every problem found, in check order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
  errors: Vec<ValidationError>,
}

impl ValidationReport {
  pub fn is_valid(&self) -> bool {
    self.errors.is_empty()
  }

  pub fn errors(&self) -> &[ValidationError] {
    &self.errors
  }

  pub fn kinds(&self) -> Vec<ValidationErrorKind> {
    self.errors.iter().map(|e| e.kind()).collect()
  }

  pub fn into_errors(self) -> Vec<ValidationError> {
    self.errors
  }
}

/// Check a pipeline against the catalog.
///
/// Runs reference integrity, fan-in, type compatibility, input satisfaction
/// and acyclicity checks, in that order, and collects every error rather than
/// stopping at the first.
pub fn validate(pipeline: &Pipeline, catalog: &ToolCatalog) -> ValidationReport {
  let edges = pipeline.effective_edges();
  let mut errors = Vec::new();

  check_references(pipeline, catalog, &edges, &mut errors);
  check_fan_in(&edges, &mut errors);
  check_types(pipeline, catalog, &edges, &mut errors);
  check_inputs(pipeline, catalog, &edges, &mut errors);

  if let Err(remainder) = pipeline.graph().topological_order() {
    errors.push(ValidationError::Cycle {
      node_ids: remainder,
    });
  }

  ValidationReport { errors }
}

fn tool_for<'a>(
  pipeline: &Pipeline,
  catalog: &'a ToolCatalog,
  node_id: &str,
) -> Option<&'a ToolDefinition> {
  pipeline
    .node(node_id)
    .and_then(|n| catalog.get(&n.tool_id).ok())
}

/// Resolve both ends of an edge to their port specs, if they exist.
fn edge_ports<'a>(
  pipeline: &Pipeline,
  catalog: &'a ToolCatalog,
  edge: &PipelineEdge,
) -> Option<(&'a PortSpec, &'a PortSpec)> {
  let source = tool_for(pipeline, catalog, &edge.source.node_id)?.get_output(&edge.source.port)?;
  let target = tool_for(pipeline, catalog, &edge.target.node_id)?.get_input(&edge.target.port)?;
  Some((source, target))
}

fn check_references(
  pipeline: &Pipeline,
  catalog: &ToolCatalog,
  edges: &[PipelineEdge],
  errors: &mut Vec<ValidationError>,
) {
  let mut seen: HashSet<&str> = HashSet::new();
  let mut reported: HashSet<&str> = HashSet::new();
  for node in &pipeline.nodes {
    if !seen.insert(node.node_id.as_str()) && reported.insert(node.node_id.as_str()) {
      errors.push(ValidationError::DuplicateNode(node.node_id.clone()));
    }
  }

  for node in &pipeline.nodes {
    let Ok(tool) = catalog.get(&node.tool_id) else {
      errors.push(ValidationError::UnknownTool {
        node_id: node.node_id.clone(),
        tool_id: node.tool_id.clone(),
      });
      continue;
    };

    let mut ports: Vec<&String> = node.inputs.keys().collect();
    ports.sort();
    for port in ports {
      if tool.get_input(port).is_none() {
        errors.push(ValidationError::UnknownPort {
          context: format!("binding on node '{}'", node.node_id),
          node_id: node.node_id.clone(),
          port: port.clone(),
        });
      }
    }
  }

  for edge in edges {
    let context = format!("edge {}", edge);

    for (end, is_source) in [(&edge.source, true), (&edge.target, false)] {
      let Some(node) = pipeline.node(&end.node_id) else {
        errors.push(ValidationError::UnknownNode {
          context: context.clone(),
          node_id: end.node_id.clone(),
        });
        continue;
      };
      // Unknown tools are already reported above.
      let Ok(tool) = catalog.get(&node.tool_id) else {
        continue;
      };
      let port = if is_source {
        tool.get_output(&end.port)
      } else {
        tool.get_input(&end.port)
      };
      if port.is_none() {
        errors.push(ValidationError::UnknownPort {
          context: context.clone(),
          node_id: end.node_id.clone(),
          port: end.port.clone(),
        });
      }
    }
  }
}

fn check_fan_in(edges: &[PipelineEdge], errors: &mut Vec<ValidationError>) {
  let mut incoming: BTreeMap<(&str, &str), Vec<String>> = BTreeMap::new();
  for edge in edges {
    incoming
      .entry((edge.target.node_id.as_str(), edge.target.port.as_str()))
      .or_default()
      .push(edge.source.to_string());
  }

  for ((node_id, port), mut sources) in incoming {
    if sources.len() > 1 {
      sources.sort();
      errors.push(ValidationError::FanIn {
        node_id: node_id.to_string(),
        port: port.to_string(),
        sources,
      });
    }
  }
}

fn check_types(
  pipeline: &Pipeline,
  catalog: &ToolCatalog,
  edges: &[PipelineEdge],
  errors: &mut Vec<ValidationError>,
) {
  for edge in edges {
    let Some((source, target)) = edge_ports(pipeline, catalog, edge) else {
      continue;
    };
    if !compatible(source.data_type, target.data_type) {
      errors.push(ValidationError::TypeMismatch {
        edge: edge.to_string(),
        source_type: source.data_type,
        target_type: target.data_type,
      });
    }
  }
}

fn check_inputs(
  pipeline: &Pipeline,
  catalog: &ToolCatalog,
  edges: &[PipelineEdge],
  errors: &mut Vec<ValidationError>,
) {
  let connected: HashSet<(&str, &str)> = edges
    .iter()
    .map(|e| (e.target.node_id.as_str(), e.target.port.as_str()))
    .collect();

  for node in &pipeline.nodes {
    let Ok(tool) = catalog.get(&node.tool_id) else {
      continue;
    };

    for port in tool.inputs.iter().filter(|p| p.required) {
      if connected.contains(&(node.node_id.as_str(), port.name.as_str())) {
        continue;
      }
      let satisfied = match node.inputs.get(&port.name) {
        Some(InputBinding::Static { .. }) => true,
        Some(InputBinding::Unresolved { .. }) => false,
        Some(InputBinding::Connection { .. }) | None => port.default.is_some(),
      };
      if !satisfied {
        errors.push(ValidationError::UnsatisfiedInput {
          node_id: node.node_id.clone(),
          port: port.name.clone(),
        });
      }
    }
  }
}
