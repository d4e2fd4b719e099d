//! Input resolution.
//!
//! Each declared input port of a node's tool is filled from, in order:
//! 1. the value carried by its incoming edge, when the producer completed and
//!    produced that output;
//! 2. the node's static binding;
//! 3. the tool's default for the port;
//!
//! and is otherwise left absent. Values are then coerced across the numeric
//! class to the port's declared type.

use std::collections::{HashMap, HashSet};

use assay_catalog::{PortSpec, PortValues, ToolDefinition};
use assay_pipeline::{PipelineNode, PortRef};
use serde_json::Value;

use crate::error::ExecutionError;

/// Outcome of resolving a node's inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
  Ready(PortValues),
  /// A required input's only producer was removed.
  Blocked(String),
}

fn fallback(node: &PipelineNode, port: &PortSpec) -> Option<Value> {
  node
    .static_value(&port.name)
    .cloned()
    .or_else(|| port.default.clone())
}

/// Resolve a node's inputs against the outputs of its settled producers.
///
/// `incoming` maps the node's input ports to the producer port feeding them.
/// `completed` holds the outputs of completed nodes and `removed` the ids of
/// nodes excised by refinement.
pub fn resolve_inputs(
  node: &PipelineNode,
  tool: &ToolDefinition,
  incoming: &HashMap<String, PortRef>,
  completed: &HashMap<String, PortValues>,
  removed: &HashSet<String>,
) -> Result<Resolution, ExecutionError> {
  let mut resolved = PortValues::new();

  for port in &tool.inputs {
    let value = match incoming.get(&port.name) {
      Some(source) => {
        if let Some(outputs) = completed.get(&source.node_id) {
          match outputs.get(&source.port) {
            Some(value) => Some(value.clone()),
            None => match fallback(node, port) {
              Some(value) => Some(value),
              None if port.required => {
                return Err(ExecutionError::InputResolution {
                  node_id: node.node_id.clone(),
                  message: format!(
                    "upstream '{}' did not produce output '{}' for required input '{}'",
                    source.node_id, source.port, port.name
                  ),
                });
              }
              None => None,
            },
          }
        } else if removed.contains(&source.node_id) {
          match fallback(node, port) {
            Some(value) => Some(value),
            None if port.required => {
              return Ok(Resolution::Blocked(format!(
                "required producer '{}' removed",
                source.node_id
              )));
            }
            None => None,
          }
        } else {
          return Err(ExecutionError::InputResolution {
            node_id: node.node_id.clone(),
            message: format!("upstream '{}' has not completed", source.node_id),
          });
        }
      }
      None => fallback(node, port),
    };

    match value {
      Some(value) => {
        resolved.insert(port.name.clone(), port.coerce(value));
      }
      None if port.required => {
        return Err(ExecutionError::InputResolution {
          node_id: node.node_id.clone(),
          message: format!("required input '{}' has no value", port.name),
        });
      }
      None => {}
    }
  }

  Ok(Resolution::Ready(resolved))
}
