//! Run scheduling.
//!
//! A node becomes ready once every producer feeding it has settled. Ready
//! nodes are launched onto a [`JoinSet`] up to the configured concurrency, and
//! each finished node releases its consumers. Failures never abort the run:
//! a failed node's transitive dependents are marked blocked and the rest of
//! the graph keeps going.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use assay_catalog::{PortValues, ToolCatalog, ToolDefinition};
use assay_pipeline::{Graph, Pipeline, PipelineNode, PortRef};
use assay_store::{ExecutionStore, NodeResult, NodeStatus, RunState};
use futures::FutureExt;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::capability::{ParameterOptimizer, QualityJudge, ToolExecutor};
use crate::config::EngineConfig;
use crate::error::ExecutionError;
use crate::events::{ExecutionEvent, ExecutionNotifier};
use crate::input::{Resolution, resolve_inputs};
use crate::refinement::refine;
use crate::task::{ToolInvocation, invoke_tool};

/// How a node settled.
#[derive(Debug)]
pub(crate) enum NodeOutcome {
  Completed(PortValues),
  Failed(ExecutionError),
  /// Excised by refinement, with the reason.
  Removed(String),
}

/// Everything a run needs, shared by the scheduler and its node tasks.
pub(crate) struct RunContext {
  pub run_id: String,
  pub pipeline: Arc<Pipeline>,
  pub catalog: Arc<ToolCatalog>,
  pub tools: Arc<dyn ToolExecutor>,
  pub judge: Arc<dyn QualityJudge>,
  pub optimizer: Arc<dyn ParameterOptimizer>,
  pub store: Arc<dyn ExecutionStore>,
  pub notifier: Arc<dyn ExecutionNotifier>,
  pub config: EngineConfig,
  pub adaptive_mode: bool,
  pub cancel: CancellationToken,
  /// node id -> input port -> the producer port feeding it
  pub incoming: HashMap<String, HashMap<String, PortRef>>,
}

impl RunContext {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    run_id: String,
    pipeline: Arc<Pipeline>,
    catalog: Arc<ToolCatalog>,
    tools: Arc<dyn ToolExecutor>,
    judge: Arc<dyn QualityJudge>,
    optimizer: Arc<dyn ParameterOptimizer>,
    store: Arc<dyn ExecutionStore>,
    notifier: Arc<dyn ExecutionNotifier>,
    config: EngineConfig,
    adaptive_mode: bool,
    cancel: CancellationToken,
  ) -> Self {
    let mut incoming: HashMap<String, HashMap<String, PortRef>> = HashMap::new();
    for edge in pipeline.effective_edges() {
      incoming
        .entry(edge.target.node_id)
        .or_default()
        .insert(edge.target.port, edge.source);
    }

    Self {
      run_id,
      pipeline,
      catalog,
      tools,
      judge,
      optimizer,
      store,
      notifier,
      config,
      adaptive_mode,
      cancel,
      incoming,
    }
  }

  pub fn notify(&self, event: ExecutionEvent) {
    self.notifier.notify(event);
  }

  /// The node's own timeout, else the engine-wide one.
  pub fn timeout_for(&self, node: &PipelineNode) -> Option<u64> {
    node.timeout_ms.or(self.config.tool_timeout_ms)
  }
}

/// Scheduler-side bookkeeping for one run.
struct Schedule {
  graph: Graph,
  results: HashMap<String, NodeResult>,
  remaining: HashMap<String, usize>,
  ready: VecDeque<String>,
  completed: HashMap<String, PortValues>,
  removed: HashSet<String>,
  /// task id -> the node it runs, for settling nodes whose task dies
  running: HashMap<Id, String>,
}

impl Schedule {
  async fn write(&self, ctx: &RunContext, node_id: &str) -> Result<(), ExecutionError> {
    if let Some(result) = self.results.get(node_id) {
      ctx.store.update(&ctx.run_id, node_id, result.clone()).await?;
    }
    Ok(())
  }

  async fn mark_ready(&mut self, ctx: &RunContext, node_id: &str) -> Result<(), ExecutionError> {
    if let Some(result) = self.results.get_mut(node_id) {
      result.transition(NodeStatus::Ready, None);
    }
    self.write(ctx, node_id).await?;
    debug!(node_id = %node_id, "node_ready");
    ctx.notify(ExecutionEvent::NodeReady {
      run_id: ctx.run_id.clone(),
      node_id: node_id.to_string(),
    });
    self.ready.push_back(node_id.to_string());
    Ok(())
  }

  /// Count a settled producer against each consumer, readying any consumer
  /// whose producers have all settled.
  async fn release(&mut self, ctx: &RunContext, node_id: &str) -> Result<(), ExecutionError> {
    let downstream = self.graph.downstream(node_id).to_vec();
    for next in downstream {
      let Some(count) = self.remaining.get_mut(&next) else {
        continue;
      };
      *count = count.saturating_sub(1);
      let pending = self
        .results
        .get(&next)
        .is_some_and(|r| r.status == NodeStatus::Pending);
      if *count == 0 && pending {
        self.mark_ready(ctx, &next).await?;
      }
    }
    Ok(())
  }

  async fn block(
    &mut self,
    ctx: &RunContext,
    node_id: &str,
    reason: String,
  ) -> Result<(), ExecutionError> {
    let Some(result) = self.results.get_mut(node_id) else {
      return Ok(());
    };
    if result.status.is_terminal() || result.status == NodeStatus::Running {
      return Ok(());
    }
    result.transition(NodeStatus::Blocked, Some(reason.clone()));
    self.ready.retain(|id| id != node_id);
    self.write(ctx, node_id).await?;

    warn!(node_id = %node_id, reason = %reason, "node_blocked");
    ctx.notify(ExecutionEvent::NodeBlocked {
      run_id: ctx.run_id.clone(),
      node_id: node_id.to_string(),
      reason,
    });
    Ok(())
  }

  /// Block every node reachable from `node_id`.
  async fn block_dependents(
    &mut self,
    ctx: &RunContext,
    node_id: &str,
    cause: &str,
  ) -> Result<(), ExecutionError> {
    for dependent in self.graph.dependents(node_id) {
      self
        .block(ctx, &dependent, format!("upstream '{}' {}", node_id, cause))
        .await?;
    }
    Ok(())
  }

  async fn fail(
    &mut self,
    ctx: &RunContext,
    node_id: &str,
    err: &ExecutionError,
  ) -> Result<(), ExecutionError> {
    if let Some(result) = self.results.get_mut(node_id) {
      result.transition(NodeStatus::Failed, Some(err.to_string()));
    }
    self.write(ctx, node_id).await?;
    error!(node_id = %node_id, error = %err, "node_failed");
    ctx.notify(ExecutionEvent::NodeFailed {
      run_id: ctx.run_id.clone(),
      node_id: node_id.to_string(),
      error: err.to_string(),
    });
    self.block_dependents(ctx, node_id, "failed").await
  }
}

/// Execute a created run to completion and record its terminal status.
///
/// `Err` means the store rejected a write, usually because the run was
/// discarded mid-flight.
#[instrument(
  name = "run_execute",
  skip(ctx),
  fields(run_id = %ctx.run_id, pipeline_id = %ctx.pipeline.pipeline_id)
)]
pub(crate) async fn execute_run(ctx: Arc<RunContext>) -> Result<RunState, ExecutionError> {
  ctx.store.mark_running(&ctx.run_id).await?;
  info!(
    nodes = ctx.pipeline.nodes.len(),
    adaptive_mode = ctx.adaptive_mode,
    "run_started"
  );
  ctx.notify(ExecutionEvent::RunStarted {
    run_id: ctx.run_id.clone(),
    pipeline_id: ctx.pipeline.pipeline_id.clone(),
  });

  let state = ctx.store.get(&ctx.run_id).await?;
  let graph = ctx.pipeline.graph();
  let remaining = graph
    .nodes()
    .iter()
    .map(|id| (id.clone(), graph.in_degree(id)))
    .collect();
  let entry_points = graph.entry_points().to_vec();

  let mut schedule = Schedule {
    graph,
    results: state.nodes,
    remaining,
    ready: VecDeque::new(),
    completed: HashMap::new(),
    removed: HashSet::new(),
    running: HashMap::new(),
  };

  for node_id in &entry_points {
    schedule.mark_ready(&ctx, node_id).await?;
  }

  let mut tasks: JoinSet<(String, NodeResult, NodeOutcome)> = JoinSet::new();

  loop {
    while tasks.len() < ctx.config.max_concurrency && !ctx.cancel.is_cancelled() {
      let Some(node_id) = schedule.ready.pop_front() else {
        break;
      };
      launch(&ctx, &mut schedule, &mut tasks, node_id).await?;
    }

    let Some(joined) = tasks.join_next_with_id().await else {
      break;
    };

    let (node_id, result, outcome) = match joined {
      Ok((id, done)) => {
        schedule.running.remove(&id);
        done
      }
      Err(e) => {
        abort_node(&ctx, &mut schedule, e.id(), e.to_string()).await?;
        continue;
      }
    };
    schedule.results.insert(node_id.clone(), result);

    match outcome {
      NodeOutcome::Completed(outputs) => {
        schedule.completed.insert(node_id.clone(), outputs);
        schedule.release(&ctx, &node_id).await?;
      }
      NodeOutcome::Removed(_) => {
        schedule.removed.insert(node_id.clone());
        schedule.release(&ctx, &node_id).await?;
      }
      NodeOutcome::Failed(ExecutionError::Store(e)) => return Err(e.into()),
      NodeOutcome::Failed(_) => {
        schedule.block_dependents(&ctx, &node_id, "failed").await?;
      }
    }
  }

  finish(&ctx, &schedule).await
}

/// Resolve a ready node's inputs and spawn it, or settle it on the spot if
/// its inputs cannot be assembled.
async fn launch(
  ctx: &Arc<RunContext>,
  schedule: &mut Schedule,
  tasks: &mut JoinSet<(String, NodeResult, NodeOutcome)>,
  node_id: String,
) -> Result<(), ExecutionError> {
  let Some(node) = ctx.pipeline.node(&node_id).cloned() else {
    return Ok(());
  };
  let tool = match ctx.catalog.get(&node.tool_id) {
    Ok(tool) => tool.clone(),
    Err(e) => {
      let err = ExecutionError::InputResolution {
        node_id: node_id.clone(),
        message: e.to_string(),
      };
      return schedule.fail(ctx, &node_id, &err).await;
    }
  };

  let empty = HashMap::new();
  let incoming = ctx.incoming.get(&node_id).unwrap_or(&empty);

  match resolve_inputs(&node, &tool, incoming, &schedule.completed, &schedule.removed) {
    Ok(Resolution::Ready(inputs)) => {
      let Some(result) = schedule.results.remove(&node_id) else {
        return Ok(());
      };
      let task_ctx = ctx.clone();
      let task_node_id = node_id.clone();
      let handle = tasks.spawn(async move {
        let (result, outcome) = run_node(task_ctx, node, tool, inputs, result).await;
        (task_node_id, result, outcome)
      });
      schedule.running.insert(handle.id(), node_id);
      Ok(())
    }
    Ok(Resolution::Blocked(reason)) => {
      schedule.block(ctx, &node_id, reason).await?;
      schedule.block_dependents(ctx, &node_id, "blocked").await
    }
    Err(err) => schedule.fail(ctx, &node_id, &err).await,
  }
}

/// Settle a node whose task panicked or was cancelled before returning its
/// result. The store may still hold it as running.
async fn abort_node(
  ctx: &RunContext,
  schedule: &mut Schedule,
  id: Id,
  message: String,
) -> Result<(), ExecutionError> {
  let Some(node_id) = schedule.running.remove(&id) else {
    error!(error = %message, "node_task_aborted");
    return Ok(());
  };
  error!(node_id = %node_id, error = %message, "node_task_aborted");

  // The task took the node's result with it; the store has its last write.
  let mut state = ctx.store.get(&ctx.run_id).await?;
  if let Some(result) = state.nodes.remove(&node_id) {
    schedule.results.insert(node_id.clone(), result);
  }

  let err = ExecutionError::TaskAborted {
    node_id: node_id.clone(),
    message,
  };
  schedule.fail(ctx, &node_id, &err).await
}

/// Execute one node and write its settled result.
#[instrument(
  name = "node_execute",
  skip(ctx, node, tool, inputs, result),
  fields(run_id = %ctx.run_id, node_id = %node.node_id, tool_id = %tool.tool_id)
)]
async fn run_node(
  ctx: Arc<RunContext>,
  node: PipelineNode,
  tool: ToolDefinition,
  inputs: PortValues,
  mut result: NodeResult,
) -> (NodeResult, NodeOutcome) {
  result.inputs = inputs.clone();
  result.transition(NodeStatus::Running, None);
  if let Err(e) = ctx.store.update(&ctx.run_id, &node.node_id, result.clone()).await {
    return (result, NodeOutcome::Failed(e.into()));
  }
  info!("node_started");
  ctx.notify(ExecutionEvent::NodeStarted {
    run_id: ctx.run_id.clone(),
    node_id: node.node_id.clone(),
  });

  let refining = ctx.adaptive_mode && node.adaptive;
  let body = async {
    if refining {
      refine(&ctx, &node, &tool, inputs, &mut result).await
    } else {
      invoke_tool(
        ctx.tools.as_ref(),
        ToolInvocation {
          run_id: &ctx.run_id,
          node_id: &node.node_id,
          tool_id: &tool.tool_id,
          inputs,
          timeout_ms: ctx.timeout_for(&node),
        },
      )
      .await
      .map(NodeOutcome::Completed)
    }
  };

  // Tool panics are already caught per invocation; this covers the judge
  // and optimizer.
  let outcome = match AssertUnwindSafe(body).catch_unwind().await {
    Ok(Ok(outcome)) => outcome,
    Ok(Err(e)) => NodeOutcome::Failed(e),
    Err(_) => NodeOutcome::Failed(ExecutionError::ToolPanicked {
      node_id: node.node_id.clone(),
      tool_id: tool.tool_id.clone(),
      message: "refinement capability panicked".to_string(),
    }),
  };

  match &outcome {
    NodeOutcome::Completed(outputs) => {
      result.outputs = outputs.clone();
      result.transition(NodeStatus::Completed, None);
      info!(outputs = outputs.len(), "node_completed");
      ctx.notify(ExecutionEvent::NodeCompleted {
        run_id: ctx.run_id.clone(),
        node_id: node.node_id.clone(),
        outputs: outputs.clone(),
      });
    }
    NodeOutcome::Failed(e) => {
      result.transition(NodeStatus::Failed, Some(e.to_string()));
      error!(error = %e, "node_failed");
      ctx.notify(ExecutionEvent::NodeFailed {
        run_id: ctx.run_id.clone(),
        node_id: node.node_id.clone(),
        error: e.to_string(),
      });
    }
    NodeOutcome::Removed(reason) => {
      result.transition(NodeStatus::Removed, Some(reason.clone()));
      info!(reason = %reason, "node_removed");
      ctx.notify(ExecutionEvent::NodeRemoved {
        run_id: ctx.run_id.clone(),
        node_id: node.node_id.clone(),
        reason: reason.clone(),
      });
    }
  }

  if let Err(e) = ctx.store.update(&ctx.run_id, &node.node_id, result.clone()).await {
    return (result, NodeOutcome::Failed(e.into()));
  }
  (result, outcome)
}

/// Decide the run's terminal status from its node results.
async fn finish(ctx: &RunContext, schedule: &Schedule) -> Result<RunState, ExecutionError> {
  let mut first_failure = None;
  let mut unsettled = 0usize;
  for node in &ctx.pipeline.nodes {
    // A node without a result was handed to a task that never reported back.
    let Some(result) = schedule.results.get(&node.node_id) else {
      unsettled += 1;
      continue;
    };
    match result.status {
      NodeStatus::Failed | NodeStatus::Blocked if first_failure.is_none() => {
        first_failure = Some(format!(
          "node '{}' {}: {}",
          result.node_id,
          if result.status == NodeStatus::Failed { "failed" } else { "blocked" },
          result.error.as_deref().unwrap_or("no error recorded")
        ));
      }
      status if !status.is_terminal() => unsettled += 1,
      _ => {}
    }
  }

  let error = if ctx.cancel.is_cancelled() && (unsettled > 0 || first_failure.is_some()) {
    Some("run cancelled".to_string())
  } else if let Some(failure) = first_failure {
    Some(failure)
  } else if unsettled > 0 {
    Some(format!("{} nodes never became ready", unsettled))
  } else {
    None
  };

  let status = if error.is_some() {
    RunState::Failed
  } else {
    RunState::Completed
  };
  ctx.store.finalize(&ctx.run_id, status, error.clone()).await?;

  match error {
    None => {
      info!("run_completed");
      ctx.notify(ExecutionEvent::RunCompleted {
        run_id: ctx.run_id.clone(),
      });
    }
    Some(error) => {
      error!(error = %error, "run_failed");
      ctx.notify(ExecutionEvent::RunFailed {
        run_id: ctx.run_id.clone(),
        error,
      });
    }
  }

  Ok(status)
}
