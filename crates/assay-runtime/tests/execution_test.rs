mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use assay_catalog::PortValues;
use assay_pipeline::{Pipeline, PipelineNode, ValidationErrorKind};
use assay_runtime::{
  ChannelNotifier, ConfigError, EngineConfig, EngineError, ExecutionEvent, ExecutionNotifier,
  PipelineEngine, ToolError, Toolbox,
};
use assay_store::{NodeStatus, RunState, RunStatus, StepResult};
use common::{CallLog, catalog, failing, toolbox, values};
use serde_json::json;
use tokio::sync::mpsc;

fn chain() -> Pipeline {
  Pipeline::new("cells", "Count cells")
    .with_description("Count nuclei in a fluorescence image")
    .with_node(PipelineNode::new("load", "load_image").with_static("path", json!("cells.tif")))
    .with_node(
      PipelineNode::new("blur", "gaussian_blur")
        .with_connection("image", "load", "image")
        .with_static("sigma", json!(1.0)),
    )
    .with_node(
      PipelineNode::new("thresh", "threshold")
        .with_connection("image", "blur", "image")
        .with_static("method", json!("otsu")),
    )
    .with_node(PipelineNode::new("count", "count_objects").with_connection("mask", "thresh", "mask"))
}

/// Two independent `delay` chains: a -> b and c -> d.
fn branches() -> Pipeline {
  Pipeline::new("branches", "Two branches")
    .with_node(PipelineNode::new("a", "delay"))
    .with_node(PipelineNode::new("b", "delay").with_connection("input", "a", "output"))
    .with_node(PipelineNode::new("c", "delay"))
    .with_node(PipelineNode::new("d", "delay").with_connection("input", "c", "output"))
}

fn engine(tools: Toolbox) -> PipelineEngine {
  PipelineEngine::new(Arc::new(catalog()), Arc::new(tools))
}

fn step<'a>(status: &'a RunStatus, step_id: &str) -> &'a StepResult {
  status
    .result
    .as_ref()
    .expect("terminal run has a result")
    .step_results
    .iter()
    .find(|s| s.step_id == step_id)
    .expect("step present")
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
  let mut events = Vec::new();
  while let Ok(event) = rx.try_recv() {
    events.push(event);
  }
  events
}

#[tokio::test]
async fn test_linear_chain_runs_in_order() {
  let log = CallLog::default();
  let engine = engine(toolbox(&log, 0));

  let status = engine.run(chain(), false).await.unwrap();

  assert_eq!(status.status, RunState::Completed);
  assert_eq!(
    log.calls(),
    vec!["load_image", "gaussian_blur", "threshold", "count_objects"]
  );
  assert_eq!(status.progress, 1.0);
  assert_eq!(status.completed_nodes, 4);
  assert_eq!(status.total_nodes, 4);
  assert!(status.current_node.is_none());
  assert!(status.refinement_info.is_none());
  assert!(status.error.is_none());

  let result = status.result.as_ref().unwrap();
  let order: Vec<&str> = result.step_results.iter().map(|s| s.step_id.as_str()).collect();
  assert_eq!(order, vec!["load", "blur", "thresh", "count"]);
  assert_eq!(result.final_outputs.len(), 1);
  assert_eq!(result.final_outputs["count"]["count"], json!(42));
  assert_eq!(
    step(&status, "thresh").outputs["mask"],
    json!("mask:blurred:loaded:cells.tif:otsu")
  );
}

#[tokio::test]
async fn test_invalid_pipeline_never_runs() {
  let log = CallLog::default();
  let engine = engine(toolbox(&log, 0));

  let pipeline = Pipeline::new("cells", "Count cells")
    .with_node(PipelineNode::new("load", "load_image").with_static("path", json!("cells.tif")))
    .with_node(PipelineNode::new("thresh", "threshold"));

  let err = engine.submit(pipeline, false).await.unwrap_err();
  match err {
    EngineError::Validation(errors) => {
      assert_eq!(errors.len(), 1);
      assert_eq!(errors[0].kind(), ValidationErrorKind::UnsatisfiedInput);
      assert!(errors[0].to_string().contains("thresh.image"));
    }
    other => panic!("expected validation error, got {:?}", other),
  }
  assert!(log.calls().is_empty());
  assert!(engine.runs_for_pipeline("cells").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_independent_branches_run_concurrently() {
  let log = CallLog::default();
  let (tx, mut rx) = mpsc::unbounded_channel();
  let engine = PipelineEngine::with_notifier(
    Arc::new(catalog()),
    Arc::new(toolbox(&log, 200)),
    ChannelNotifier::new(tx),
  );

  let started = Instant::now();
  let status = engine.run(branches(), false).await.unwrap();
  let elapsed = started.elapsed();

  assert_eq!(status.status, RunState::Completed);
  assert!(
    elapsed < Duration::from_millis(700),
    "branches ran serially: {:?}",
    elapsed
  );

  let mut first_started: Vec<String> = drain(&mut rx)
    .into_iter()
    .filter_map(|e| match e {
      ExecutionEvent::NodeStarted { node_id, .. } => Some(node_id),
      _ => None,
    })
    .take(2)
    .collect();
  first_started.sort();
  assert_eq!(first_started, vec!["a", "c"]);
  assert_eq!(step(&status, "b").outputs["output"], json!("++"));
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
  let log = CallLog::default();
  let engine = engine(toolbox(&log, 100)).with_config(EngineConfig {
    max_concurrency: 1,
    ..EngineConfig::default()
  })
  .unwrap();

  let started = Instant::now();
  let status = engine.run(branches(), false).await.unwrap();

  assert_eq!(status.status, RunState::Completed);
  assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test]
async fn test_failure_blocks_only_dependents() {
  let log = CallLog::default();
  let mut tools = toolbox(&log, 0);
  tools.register_fn("threshold", failing("no foreground found"));
  let engine = engine(tools);

  let pipeline = chain().with_node(PipelineNode::new("side", "delay"));
  let status = engine.run(pipeline, false).await.unwrap();

  assert_eq!(status.status, RunState::Failed);
  assert!(status.error.as_deref().unwrap().contains("thresh"));

  let thresh = step(&status, "thresh");
  assert_eq!(thresh.status, NodeStatus::Failed);
  assert!(thresh.error_message.as_deref().unwrap().contains("no foreground found"));

  let count = step(&status, "count");
  assert_eq!(count.status, NodeStatus::Blocked);
  assert_eq!(count.error_message.as_deref(), Some("upstream 'thresh' failed"));

  assert_eq!(step(&status, "side").status, NodeStatus::Completed);
  assert!(!log.calls().contains(&"count_objects".to_string()));
  assert_eq!(status.progress, 1.0);
}

#[test]
fn test_zero_concurrency_config_rejected() {
  let log = CallLog::default();
  let result = engine(toolbox(&log, 0)).with_config(EngineConfig {
    max_concurrency: 0,
    ..EngineConfig::default()
  });
  assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[tokio::test]
async fn test_tool_timeout_fails_node() {
  let log = CallLog::default();
  let mut tools = toolbox(&log, 0);
  tools.register_fn("gaussian_blur", |inputs: PortValues| async move {
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(inputs)
  });
  let engine = engine(tools);

  let mut pipeline = chain();
  if let Some(blur) = pipeline.node_mut("blur") {
    blur.timeout_ms = Some(20);
  }

  let status = engine.run(pipeline, false).await.unwrap();

  assert_eq!(status.status, RunState::Failed);
  let blur = step(&status, "blur");
  assert_eq!(blur.status, NodeStatus::Failed);
  assert!(blur.error_message.as_deref().unwrap().contains("timed out after 20ms"));
  assert_eq!(step(&status, "thresh").status, NodeStatus::Blocked);
}

#[tokio::test]
async fn test_engine_wide_timeout_applies() {
  let log = CallLog::default();
  let engine = engine(toolbox(&log, 300)).with_config(EngineConfig {
    tool_timeout_ms: Some(20),
    ..EngineConfig::default()
  })
  .unwrap();

  let pipeline = Pipeline::new("slow", "Slow").with_node(PipelineNode::new("a", "delay"));
  let status = engine.run(pipeline, false).await.unwrap();

  assert_eq!(status.status, RunState::Failed);
  assert!(step(&status, "a").error_message.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_tool_panic_fails_node() {
  let log = CallLog::default();
  let mut tools = toolbox(&log, 0);
  tools.register_fn("count_objects", |_inputs: PortValues| async move {
    if true {
      panic!("segfault in labeling");
    }
    Ok::<_, ToolError>(PortValues::new())
  });
  let engine = engine(tools);

  let status = engine.run(chain(), false).await.unwrap();

  assert_eq!(status.status, RunState::Failed);
  let count = step(&status, "count");
  assert_eq!(count.status, NodeStatus::Failed);
  assert!(count.error_message.as_deref().unwrap().contains("segfault in labeling"));
  assert_eq!(step(&status, "thresh").status, NodeStatus::Completed);
}

#[tokio::test]
async fn test_missing_declared_output_fails_consumer() {
  let log = CallLog::default();
  let mut tools = toolbox(&log, 0);
  tools.register_fn("threshold", |_inputs: PortValues| async move {
    Ok::<_, ToolError>(PortValues::new())
  });
  let engine = engine(tools);

  let status = engine.run(chain(), false).await.unwrap();

  assert_eq!(status.status, RunState::Failed);
  assert_eq!(step(&status, "thresh").status, NodeStatus::Completed);
  let count = step(&status, "count");
  assert_eq!(count.status, NodeStatus::Failed);
  assert!(count.error_message.as_deref().unwrap().contains("did not produce output 'mask'"));
}

#[tokio::test]
async fn test_cancel_stops_new_nodes() {
  let log = CallLog::default();
  let engine = engine(toolbox(&log, 200));

  let pipeline = Pipeline::new("slow", "Slow chain")
    .with_node(PipelineNode::new("a", "delay"))
    .with_node(PipelineNode::new("b", "delay").with_connection("input", "a", "output"))
    .with_node(PipelineNode::new("c", "delay").with_connection("input", "b", "output"));

  let run_id = engine.submit(pipeline, false).await.unwrap();
  tokio::time::sleep(Duration::from_millis(50)).await;
  engine.cancel(&run_id).await.unwrap();
  let status = engine.wait(&run_id).await.unwrap();

  assert_eq!(status.status, RunState::Failed);
  assert_eq!(status.error.as_deref(), Some("run cancelled"));
  assert_eq!(log.calls().len(), 1);
  assert_eq!(step(&status, "a").status, NodeStatus::Completed);
  assert_eq!(step(&status, "b").status, NodeStatus::Ready);
  assert_eq!(step(&status, "c").status, NodeStatus::Pending);
}

#[tokio::test]
async fn test_submit_with_inputs_fills_unresolved() {
  let log = CallLog::default();
  let engine = engine(toolbox(&log, 0));

  let mut pipeline = chain();
  pipeline.nodes[0] = PipelineNode::new("load", "load_image").with_unresolved("path", Some("Which image?"));

  let err = engine.submit(pipeline.clone(), false).await.unwrap_err();
  assert!(matches!(err, EngineError::Validation(_)));

  let inputs = HashMap::from([("load".to_string(), values(json!({ "path": "nuclei.tif" })))]);
  let run_id = engine
    .submit_with_inputs(pipeline.clone(), false, inputs)
    .await
    .unwrap();
  let status = engine.wait(&run_id).await.unwrap();
  assert_eq!(status.status, RunState::Completed);
  assert_eq!(step(&status, "load").outputs["image"], json!("loaded:nuclei.tif"));

  let wrong = HashMap::from([("blur".to_string(), values(json!({ "sigma": 2.0 })))]);
  let err = engine
    .submit_with_inputs(pipeline, false, wrong)
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    EngineError::UnexpectedUserInput { node_id, port } if node_id == "blur" && port == "sigma"
  ));
}

#[tokio::test]
async fn test_event_stream_mirrors_transitions() {
  let log = CallLog::default();
  let (tx, mut rx) = mpsc::unbounded_channel();
  let engine = PipelineEngine::with_notifier(
    Arc::new(catalog()),
    Arc::new(toolbox(&log, 0)),
    ChannelNotifier::new(tx),
  );

  let run_id = engine.submit(chain(), false).await.unwrap();
  engine.wait(&run_id).await.unwrap();
  let events = drain(&mut rx);

  assert!(matches!(&events[0], ExecutionEvent::RunStarted { run_id: id, .. } if *id == run_id));
  assert!(matches!(events.last(), Some(ExecutionEvent::RunCompleted { .. })));

  let started: Vec<&str> = events
    .iter()
    .filter_map(|e| match e {
      ExecutionEvent::NodeStarted { node_id, .. } => Some(node_id.as_str()),
      _ => None,
    })
    .collect();
  assert_eq!(started, vec!["load", "blur", "thresh", "count"]);

  let completed = events
    .iter()
    .filter(|e| matches!(e, ExecutionEvent::NodeCompleted { .. }))
    .count();
  assert_eq!(completed, 4);
}

#[tokio::test]
async fn test_unknown_run() {
  let log = CallLog::default();
  let engine = engine(toolbox(&log, 0));

  assert!(matches!(
    engine.status("missing").await,
    Err(EngineError::RunNotFound(_))
  ));
  assert!(matches!(
    engine.cancel("missing").await,
    Err(EngineError::RunNotFound(_))
  ));
}

#[tokio::test]
async fn test_discard_and_supersede() {
  let log = CallLog::default();
  let engine = engine(toolbox(&log, 0));

  let first = engine.run(chain(), false).await.unwrap().run_id;
  let second = engine.run(chain(), false).await.unwrap().run_id;

  // A new run of the same pipeline replaces the finished one.
  assert_eq!(engine.runs_for_pipeline("cells").await.unwrap(), vec![second.clone()]);
  assert!(matches!(
    engine.status(&first).await,
    Err(EngineError::RunNotFound(_))
  ));

  engine.discard(&second).await.unwrap();
  assert!(matches!(
    engine.status(&second).await,
    Err(EngineError::RunNotFound(_))
  ));
}

#[tokio::test]
async fn test_finished_run_handles_are_dropped() {
  let log = CallLog::default();
  let engine = engine(toolbox(&log, 0));

  let first = engine.submit(chain(), false).await.unwrap();
  // Finish the first run without waiting on it through the engine.
  while !engine.status(&first).await.unwrap().status.is_terminal() {
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  // The run task signals completion just after its final store write.
  tokio::time::sleep(Duration::from_millis(20)).await;

  let second = engine.submit(chain(), false).await.unwrap();
  assert_eq!(engine.tracked_runs().await, 1);

  // The first run was superseded in the store, so the engine forgets it too.
  assert!(matches!(
    engine.cancel(&first).await,
    Err(EngineError::RunNotFound(_))
  ));

  engine.wait(&second).await.unwrap();
  assert_eq!(engine.tracked_runs().await, 0);
  // Cancelling a finished run is a no-op.
  engine.cancel(&second).await.unwrap();
}

/// Panics while announcing that `node_id` completed.
struct PanickingNotifier {
  node_id: &'static str,
}

impl ExecutionNotifier for PanickingNotifier {
  fn notify(&self, event: ExecutionEvent) {
    if let ExecutionEvent::NodeCompleted { node_id, .. } = &event
      && node_id == self.node_id
    {
      panic!("notifier crashed on {}", node_id);
    }
  }
}

#[tokio::test]
async fn test_node_task_panic_outside_tool_fails_node() {
  let log = CallLog::default();
  let engine = PipelineEngine::with_notifier(
    Arc::new(catalog()),
    Arc::new(toolbox(&log, 0)),
    PanickingNotifier { node_id: "a" },
  );

  let pipeline = Pipeline::new("pair", "Pair")
    .with_node(PipelineNode::new("a", "delay"))
    .with_node(PipelineNode::new("b", "delay").with_connection("input", "a", "output"))
    .with_node(PipelineNode::new("side", "delay"));
  let status = engine.run(pipeline, false).await.unwrap();

  assert_eq!(status.status, RunState::Failed);
  assert!(status.error.as_deref().unwrap().contains("node 'a' failed"));

  let a = step(&status, "a");
  assert_eq!(a.status, NodeStatus::Failed);
  assert!(a.error_message.as_deref().unwrap().contains("task aborted"));
  assert_eq!(step(&status, "b").status, NodeStatus::Blocked);
  assert_eq!(step(&status, "side").status, NodeStatus::Completed);
  assert_eq!(status.progress, 1.0);
}
