//! Shared fixtures for runtime integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assay_catalog::{DataType, PortSpec, PortValues, ToolCatalog, ToolDefinition};
use assay_pipeline::QualityLabel;
use assay_runtime::{
  CapabilityError, NodeContext, ParameterOptimizer, QualityJudge, ToolError, Toolbox,
};
use assay_store::{Decision, Iteration, Judgment};
use async_trait::async_trait;
use serde_json::{Value, json};

/// Records the order tools are invoked in, as `tool_id` entries.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
  pub fn push(&self, entry: impl Into<String>) {
    self.0.lock().unwrap().push(entry.into());
  }

  pub fn calls(&self) -> Vec<String> {
    self.0.lock().unwrap().clone()
  }
}

pub fn values(value: Value) -> PortValues {
  value.as_object().cloned().unwrap()
}

pub fn catalog() -> ToolCatalog {
  let mut catalog = ToolCatalog::new();
  let tools = [
    ToolDefinition::new("load_image", "io")
      .input(PortSpec::required("path", DataType::String))
      .output("image", DataType::Image),
    ToolDefinition::new("gaussian_blur", "filter")
      .input(PortSpec::required("image", DataType::Image))
      .input(PortSpec::optional("sigma", DataType::Float, json!(1.0)).with_range(0.1, 10.0))
      .output("image", DataType::Image),
    ToolDefinition::new("threshold", "segmentation")
      .input(PortSpec::required("image", DataType::Image))
      .input(
        PortSpec::optional("method", DataType::String, json!("otsu"))
          .with_choices(["otsu", "li", "triangle"]),
      )
      .input(PortSpec::optional("level", DataType::Int, json!(128)).with_range(0.0, 255.0))
      .output("mask", DataType::Mask),
    ToolDefinition::new("count_objects", "measurement")
      .input(PortSpec::required("mask", DataType::Mask))
      .output("count", DataType::Int),
    ToolDefinition::new("delay", "test")
      .input(PortSpec::optional("input", DataType::String, json!("")))
      .output("output", DataType::String),
  ];
  for tool in tools {
    catalog.register(tool).unwrap();
  }
  catalog
}

fn text(inputs: &PortValues, port: &str) -> String {
  inputs
    .get(port)
    .and_then(|v| v.as_str())
    .unwrap_or_default()
    .to_string()
}

/// Working implementations of every catalog tool. `delay` sleeps for
/// `delay_ms` before echoing its input.
pub fn toolbox(log: &CallLog, delay_ms: u64) -> Toolbox {
  let mut toolbox = Toolbox::new();

  let l = log.clone();
  toolbox.register_fn("load_image", move |inputs: PortValues| {
    let l = l.clone();
    async move {
      l.push("load_image");
      Ok(values(json!({ "image": format!("loaded:{}", text(&inputs, "path")) })))
    }
  });

  let l = log.clone();
  toolbox.register_fn("gaussian_blur", move |inputs: PortValues| {
    let l = l.clone();
    async move {
      l.push("gaussian_blur");
      Ok(values(json!({ "image": format!("blurred:{}", text(&inputs, "image")) })))
    }
  });

  let l = log.clone();
  toolbox.register_fn("threshold", move |inputs: PortValues| {
    let l = l.clone();
    async move {
      l.push("threshold");
      let mask = format!("mask:{}:{}", text(&inputs, "image"), text(&inputs, "method"));
      Ok(values(json!({ "mask": mask })))
    }
  });

  let l = log.clone();
  toolbox.register_fn("count_objects", move |_inputs: PortValues| {
    let l = l.clone();
    async move {
      l.push("count_objects");
      Ok(values(json!({ "count": 42 })))
    }
  });

  let l = log.clone();
  toolbox.register_fn("delay", move |inputs: PortValues| {
    let l = l.clone();
    async move {
      l.push("delay");
      tokio::time::sleep(Duration::from_millis(delay_ms)).await;
      Ok(values(json!({ "output": format!("{}+", text(&inputs, "input")) })))
    }
  });

  toolbox
}

type ToolResult = std::future::Ready<Result<PortValues, ToolError>>;

/// A tool implementation that always fails with `message`.
pub fn failing(message: &'static str) -> impl Fn(PortValues) -> ToolResult + Send + Sync + 'static {
  move |_inputs| std::future::ready(Err(ToolError::Failed(message.to_string())))
}

/// Judge that replays a script of judgments, repeating the last one.
pub struct ScriptedJudge {
  script: Mutex<VecDeque<Judgment>>,
  last: Mutex<Option<Judgment>>,
  pub seen: Mutex<Vec<(String, u32)>>,
}

impl ScriptedJudge {
  pub fn new(script: Vec<Judgment>) -> Self {
    Self {
      script: Mutex::new(script.into()),
      last: Mutex::new(None),
      seen: Mutex::new(Vec::new()),
    }
  }

  pub fn always(quality: QualityLabel, decision: Decision, rationale: &str) -> Self {
    Self::new(vec![Judgment::new(quality, decision, rationale)])
  }
}

#[async_trait]
impl QualityJudge for ScriptedJudge {
  async fn judge(
    &self,
    ctx: &NodeContext,
    _outputs: &PortValues,
  ) -> Result<Judgment, CapabilityError> {
    self
      .seen
      .lock()
      .unwrap()
      .push((ctx.node_id.clone(), ctx.iteration));

    let next = self.script.lock().unwrap().pop_front();
    let mut last = self.last.lock().unwrap();
    if let Some(judgment) = next {
      *last = Some(judgment);
    }
    last
      .clone()
      .ok_or_else(|| CapabilityError::Failed("empty script".to_string()))
  }
}

/// Optimizer that always proposes the same adjustments and records the
/// history length it was shown.
pub struct FixedOptimizer {
  proposal: PortValues,
  pub history_lengths: Mutex<Vec<usize>>,
}

impl FixedOptimizer {
  pub fn new(proposal: Value) -> Self {
    Self {
      proposal: values(proposal),
      history_lengths: Mutex::new(Vec::new()),
    }
  }
}

#[async_trait]
impl ParameterOptimizer for FixedOptimizer {
  async fn optimize(
    &self,
    _ctx: &NodeContext,
    history: &[Iteration],
  ) -> Result<PortValues, CapabilityError> {
    self.history_lengths.lock().unwrap().push(history.len());
    Ok(self.proposal.clone())
  }
}
