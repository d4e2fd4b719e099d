//! Runtime error types.

use assay_pipeline::ValidationError;
use assay_store::StoreError;

use crate::capability::{CapabilityError, ToolError};

/// Errors that can occur while executing a single node.
///
/// Every variant except `Store` is caught at the node boundary and recorded
/// on the node's result rather than aborting the run.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
  /// The tool returned an error.
  #[error("tool '{tool_id}' failed on node '{node_id}': {source}")]
  ToolExecution {
    node_id: String,
    tool_id: String,
    #[source]
    source: ToolError,
  },

  /// The tool panicked.
  #[error("tool '{tool_id}' panicked on node '{node_id}': {message}")]
  ToolPanicked {
    node_id: String,
    tool_id: String,
    message: String,
  },

  /// The node's task died outside the tool and refinement boundaries.
  #[error("node '{node_id}' task aborted: {message}")]
  TaskAborted { node_id: String, message: String },

  /// A single tool invocation exceeded its time limit.
  #[error("tool '{tool_id}' on node '{node_id}' timed out after {timeout_ms}ms")]
  Timeout {
    node_id: String,
    tool_id: String,
    timeout_ms: u64,
  },

  /// Failed to assemble a node's inputs.
  #[error("input resolution failed for node '{node_id}': {message}")]
  InputResolution { node_id: String, message: String },

  /// The quality judge could not produce a judgment.
  #[error("quality judge failed for node '{node_id}': {source}")]
  Judge {
    node_id: String,
    #[source]
    source: CapabilityError,
  },

  /// The parameter optimizer could not produce adjusted inputs.
  #[error("parameter optimizer failed for node '{node_id}': {source}")]
  Optimizer {
    node_id: String,
    #[source]
    source: CapabilityError,
  },

  /// A required adaptive node used its whole budget without an accepted result.
  #[error("node '{node_id}' not accepted after {iterations} iterations: {rationale}")]
  RefinementExhausted {
    node_id: String,
    iterations: u32,
    rationale: String,
  },

  /// The judge asked to remove a node that is not optional.
  #[error("judge requested removal of required node '{node_id}': {rationale}")]
  RemovalRejected { node_id: String, rationale: String },

  /// Execution was cancelled.
  #[error("execution cancelled")]
  Cancelled,

  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Errors returned by [`PipelineEngine`](crate::PipelineEngine).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// The pipeline failed validation; nothing was executed.
  #[error("pipeline failed validation: {}", format_validation(.0))]
  Validation(Vec<ValidationError>),

  #[error("run not found: {0}")]
  RunNotFound(String),

  /// A user-supplied input targets a port that is not awaiting one.
  #[error("no unresolved input {node_id}.{port} to fill")]
  UnexpectedUserInput { node_id: String, port: String },

  #[error(transparent)]
  Store(#[from] StoreError),
}

fn format_validation(errors: &[ValidationError]) -> String {
  errors
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join("; ")
}
