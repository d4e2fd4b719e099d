//! Capabilities the engine consumes from its host.
//!
//! The engine never implements analysis, judging or optimization itself. It
//! calls out through three traits:
//!
//! - [`ToolExecutor`] runs a catalog tool against resolved inputs.
//! - [`QualityJudge`] rates the outputs of one refinement iteration.
//! - [`ParameterOptimizer`] proposes new inputs from the iteration history.
//!
//! [`Toolbox`] is a ready-made `ToolExecutor` backed by per-tool
//! registrations. [`AcceptingJudge`] and [`PassthroughOptimizer`] are the
//! defaults used when the host provides neither.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use assay_catalog::{PortValues, ToolDefinition};
use assay_pipeline::QualityLabel;
use assay_store::{Decision, Iteration, Judgment};
use async_trait::async_trait;

/// Error returned by a tool implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
  #[error("{0}")]
  Failed(String),

  #[error("no implementation registered for tool '{0}'")]
  NotImplemented(String),

  #[error("invalid input '{port}': {message}")]
  InvalidInput { port: String, message: String },
}

/// Error returned by a judge or optimizer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
  #[error("{0}")]
  Failed(String),

  #[error("invalid response: {0}")]
  InvalidResponse(String),
}

/// What a judge or optimizer knows about the node it is looking at.
#[derive(Debug, Clone)]
pub struct NodeContext {
  pub run_id: String,
  pub pipeline_id: String,
  /// The pipeline's stated purpose.
  pub pipeline_description: String,
  pub node_id: String,
  pub node_name: String,
  pub tool: ToolDefinition,
  /// 1-based index of the iteration being judged or optimized.
  pub iteration: u32,
  pub locked_inputs: Vec<String>,
}

/// Runs a catalog tool.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
  async fn execute(&self, tool_id: &str, inputs: PortValues) -> Result<PortValues, ToolError>;
}

/// A single tool implementation, registered in a [`Toolbox`].
#[async_trait]
pub trait Tool: Send + Sync {
  async fn call(&self, inputs: PortValues) -> Result<PortValues, ToolError>;
}

/// Rates the outputs of one refinement iteration.
#[async_trait]
pub trait QualityJudge: Send + Sync {
  async fn judge(
    &self,
    ctx: &NodeContext,
    outputs: &PortValues,
  ) -> Result<Judgment, CapabilityError>;
}

/// Proposes adjusted inputs for the next refinement iteration.
///
/// The returned map is merged over the current inputs; ports it leaves out
/// keep their value.
#[async_trait]
pub trait ParameterOptimizer: Send + Sync {
  async fn optimize(
    &self,
    ctx: &NodeContext,
    history: &[Iteration],
  ) -> Result<PortValues, CapabilityError>;
}

struct FnTool<F>(F);

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
  F: Fn(PortValues) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<PortValues, ToolError>> + Send + 'static,
{
  async fn call(&self, inputs: PortValues) -> Result<PortValues, ToolError> {
    (self.0)(inputs).await
  }
}

/// [`ToolExecutor`] that dispatches to registered [`Tool`]s by id.
#[derive(Default, Clone)]
pub struct Toolbox {
  tools: HashMap<String, Arc<dyn Tool>>,
}

impl Toolbox {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register an implementation, replacing any earlier one for the same id.
  pub fn register(&mut self, tool_id: impl Into<String>, tool: impl Tool + 'static) -> &mut Self {
    self.tools.insert(tool_id.into(), Arc::new(tool));
    self
  }

  /// Register an async closure as a tool.
  pub fn register_fn<F, Fut>(&mut self, tool_id: impl Into<String>, f: F) -> &mut Self
  where
    F: Fn(PortValues) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PortValues, ToolError>> + Send + 'static,
  {
    self.register(tool_id, FnTool(f))
  }

  pub fn contains(&self, tool_id: &str) -> bool {
    self.tools.contains_key(tool_id)
  }
}

#[async_trait]
impl ToolExecutor for Toolbox {
  async fn execute(&self, tool_id: &str, inputs: PortValues) -> Result<PortValues, ToolError> {
    let tool = self
      .tools
      .get(tool_id)
      .cloned()
      .ok_or_else(|| ToolError::NotImplemented(tool_id.to_string()))?;
    tool.call(inputs).await
  }
}

/// Judge that accepts every iteration.
#[derive(Debug, Clone, Default)]
pub struct AcceptingJudge;

#[async_trait]
impl QualityJudge for AcceptingJudge {
  async fn judge(
    &self,
    _ctx: &NodeContext,
    _outputs: &PortValues,
  ) -> Result<Judgment, CapabilityError> {
    Ok(Judgment::new(QualityLabel::Good, Decision::Accept, "accepted without review"))
  }
}

/// Optimizer that proposes no changes.
#[derive(Debug, Clone, Default)]
pub struct PassthroughOptimizer;

#[async_trait]
impl ParameterOptimizer for PassthroughOptimizer {
  async fn optimize(
    &self,
    _ctx: &NodeContext,
    _history: &[Iteration],
  ) -> Result<PortValues, CapabilityError> {
    Ok(PortValues::new())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_toolbox_dispatch() {
    let mut toolbox = Toolbox::new();
    toolbox.register_fn("double", |inputs: PortValues| async move {
      let x = inputs.get("x").and_then(|v| v.as_i64()).unwrap_or(0);
      let mut out = PortValues::new();
      out.insert("y".to_string(), json!(x * 2));
      Ok(out)
    });

    let mut inputs = PortValues::new();
    inputs.insert("x".to_string(), json!(21));
    let out = toolbox.execute("double", inputs).await.unwrap();
    assert_eq!(out["y"], json!(42));
    assert!(toolbox.contains("double"));
  }

  #[tokio::test]
  async fn test_toolbox_unknown_tool() {
    let toolbox = Toolbox::new();
    let err = toolbox.execute("missing", PortValues::new()).await.unwrap_err();
    assert_eq!(err, ToolError::NotImplemented("missing".to_string()));
  }
}
