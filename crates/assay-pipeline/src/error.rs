use std::fmt;

use assay_catalog::DataType;
use serde::Serialize;
use thiserror::Error;

/// A single reason a pipeline cannot be executed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
  #[error("duplicate node id: {0}")]
  DuplicateNode(String),

  #[error("node '{node_id}' references unknown tool '{tool_id}'")]
  UnknownTool { node_id: String, tool_id: String },

  #[error("{context} references unknown node '{node_id}'")]
  UnknownNode { context: String, node_id: String },

  #[error("{context} references unknown port '{port}' on node '{node_id}'")]
  UnknownPort {
    context: String,
    node_id: String,
    port: String,
  },

  #[error("input {node_id}.{port} has multiple incoming edges: {}", .sources.join(", "))]
  FanIn {
    node_id: String,
    port: String,
    sources: Vec<String>,
  },

  #[error("type mismatch on edge {edge}: {source_type} cannot feed {target_type}")]
  TypeMismatch {
    edge: String,
    source_type: DataType,
    target_type: DataType,
  },

  #[error("required input {node_id}.{port} has no value, default or connection")]
  UnsatisfiedInput { node_id: String, port: String },

  #[error("cycle detected among nodes: {}", .node_ids.join(", "))]
  Cycle { node_ids: Vec<String> },
}

/// Category of a [`ValidationError`], one per validation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
  ReferenceIntegrity,
  FanIn,
  TypeMismatch,
  UnsatisfiedInput,
  Cycle,
}

impl ValidationError {
  pub fn kind(&self) -> ValidationErrorKind {
    match self {
      ValidationError::DuplicateNode(_)
      | ValidationError::UnknownTool { .. }
      | ValidationError::UnknownNode { .. }
      | ValidationError::UnknownPort { .. } => ValidationErrorKind::ReferenceIntegrity,
      ValidationError::FanIn { .. } => ValidationErrorKind::FanIn,
      ValidationError::TypeMismatch { .. } => ValidationErrorKind::TypeMismatch,
      ValidationError::UnsatisfiedInput { .. } => ValidationErrorKind::UnsatisfiedInput,
      ValidationError::Cycle { .. } => ValidationErrorKind::Cycle,
    }
  }
}

impl fmt::Display for ValidationErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ValidationErrorKind::ReferenceIntegrity => "reference_integrity",
      ValidationErrorKind::FanIn => "fan_in",
      ValidationErrorKind::TypeMismatch => "type_mismatch",
      ValidationErrorKind::UnsatisfiedInput => "unsatisfied_input",
      ValidationErrorKind::Cycle => "cycle",
    };
    f.write_str(s)
  }
}
