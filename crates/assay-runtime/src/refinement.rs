//! Adaptive refinement.
//!
//! An adaptive node is executed, judged and, if the judge asks for it,
//! re-executed with optimizer-adjusted inputs until its output is accepted,
//! it is removed, or the iteration budget runs out.
//!
//! ```text
//! Draft ──▶ Executed ──▶ Judged ──┬──▶ Accepted
//!              ▲                  ├──▶ Removed   (optional nodes only)
//!              └──── Retrying ◀───┘
//! ```
//!
//! Every iteration is appended to the node's [`RefinementRecord`] and pushed
//! to the store as soon as it changes.

use std::collections::HashMap;
use std::time::Instant;

use assay_catalog::{DataType, PortValues, ToolDefinition};
use assay_pipeline::{PipelineNode, PortRef};
use assay_store::{Decision, Iteration, NodeResult, RefinementPhase, RefinementRecord};
use tracing::{info, instrument, warn};

use crate::capability::NodeContext;
use crate::error::ExecutionError;
use crate::events::ExecutionEvent;
use crate::executor::{NodeOutcome, RunContext};
use crate::task::{ToolInvocation, invoke_tool};

/// File references among an iteration's image and mask outputs.
fn artifacts(tool: &ToolDefinition, outputs: &PortValues) -> Vec<String> {
  tool
    .outputs
    .iter()
    .filter(|p| matches!(p.data_type, DataType::Image | DataType::Mask))
    .filter_map(|p| outputs.get(&p.name).and_then(|v| v.as_str()))
    .map(str::to_string)
    .collect()
}

/// Merge optimizer-proposed values over the current inputs.
///
/// Proposals for undeclared ports, edge-fed ports or locked ports are
/// dropped, as are values outside the port's range or choices. Dropped
/// proposals keep the current value.
pub fn apply_adjustments(
  node_id: &str,
  tool: &ToolDefinition,
  current: &PortValues,
  proposed: PortValues,
  locked: &[String],
  edge_fed: &HashMap<String, PortRef>,
) -> PortValues {
  let mut next = current.clone();

  for (port, value) in proposed {
    if current.get(&port) == Some(&value) {
      continue;
    }

    let rejection = match tool.get_input(&port) {
      None => Some("not an input of the tool".to_string()),
      Some(_) if locked.contains(&port) => Some("input is locked".to_string()),
      Some(_) if edge_fed.contains_key(&port) => {
        Some("input is fed by an upstream node".to_string())
      }
      Some(spec) => match spec.check(value) {
        Ok(value) => {
          next.insert(port.clone(), value);
          None
        }
        Err(reason) => Some(reason),
      },
    };

    if let Some(reason) = rejection {
      warn!(node_id = %node_id, port = %port, reason = %reason, "adjustment_rejected");
    }
  }

  next
}

fn node_context(
  ctx: &RunContext,
  node: &PipelineNode,
  tool: &ToolDefinition,
  iteration: u32,
) -> NodeContext {
  NodeContext {
    run_id: ctx.run_id.clone(),
    pipeline_id: ctx.pipeline.pipeline_id.clone(),
    pipeline_description: ctx.pipeline.description.clone(),
    node_id: node.node_id.clone(),
    node_name: node.display_name().to_string(),
    tool: tool.clone(),
    iteration,
    locked_inputs: node.locked_inputs().to_vec(),
  }
}

async fn publish(
  ctx: &RunContext,
  node_id: &str,
  result: &mut NodeResult,
  record: &RefinementRecord,
) -> Result<(), ExecutionError> {
  result.refinement = Some(record.clone());
  ctx
    .store
    .update_refinement(&ctx.run_id, node_id, record.clone())
    .await?;
  Ok(())
}

/// Run the refinement loop for one adaptive node.
///
/// Returns the node's outcome. `Err` is reserved for store failures.
#[instrument(
  name = "node_refine",
  skip(ctx, node, tool, inputs, result),
  fields(run_id = %ctx.run_id, node_id = %node.node_id, tool_id = %tool.tool_id)
)]
pub(crate) async fn refine(
  ctx: &RunContext,
  node: &PipelineNode,
  tool: &ToolDefinition,
  inputs: PortValues,
  result: &mut NodeResult,
) -> Result<NodeOutcome, ExecutionError> {
  let settings = node.refinement.clone().unwrap_or_default();
  let max_iterations = settings
    .max_iterations
    .unwrap_or(ctx.config.default_max_iterations)
    .max(1);
  let threshold = settings
    .quality_threshold
    .or(ctx.config.default_quality_threshold);
  let edge_fed = ctx.incoming.get(&node.node_id).cloned().unwrap_or_default();

  let mut record = RefinementRecord::default();
  publish(ctx, &node.node_id, result, &record).await?;

  let mut current = inputs;

  for index in 1..=max_iterations {
    if ctx.cancel.is_cancelled() {
      record.phase = RefinementPhase::Failed;
      publish(ctx, &node.node_id, result, &record).await?;
      return Ok(NodeOutcome::Failed(ExecutionError::Cancelled));
    }

    let started = Instant::now();
    let call = invoke_tool(
      ctx.tools.as_ref(),
      ToolInvocation {
        run_id: &ctx.run_id,
        node_id: &node.node_id,
        tool_id: &tool.tool_id,
        inputs: current.clone(),
        timeout_ms: ctx.timeout_for(node),
      },
    )
    .await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let outputs = match call {
      Ok(outputs) => outputs,
      Err(e) => {
        record.iterations.push(Iteration {
          index,
          inputs: current,
          outputs: PortValues::new(),
          judgment: None,
          duration_ms,
          artifacts: Vec::new(),
          error: Some(e.to_string()),
        });
        record.phase = RefinementPhase::Failed;
        publish(ctx, &node.node_id, result, &record).await?;
        return Ok(NodeOutcome::Failed(e));
      }
    };

    record.iterations.push(Iteration {
      index,
      inputs: current.clone(),
      outputs: outputs.clone(),
      judgment: None,
      duration_ms,
      artifacts: artifacts(tool, &outputs),
      error: None,
    });
    record.phase = RefinementPhase::Executed;
    publish(ctx, &node.node_id, result, &record).await?;

    let node_ctx = node_context(ctx, node, tool, index);
    let judgment = match ctx.judge.judge(&node_ctx, &outputs).await {
      Ok(judgment) => judgment,
      Err(source) => {
        record.phase = RefinementPhase::Failed;
        publish(ctx, &node.node_id, result, &record).await?;
        return Ok(NodeOutcome::Failed(ExecutionError::Judge {
          node_id: node.node_id.clone(),
          source,
        }));
      }
    };

    info!(
      iteration = index,
      quality = %judgment.quality,
      decision = ?judgment.decision,
      rationale = %judgment.rationale,
      "iteration_judged"
    );
    ctx.notify(ExecutionEvent::IterationJudged {
      run_id: ctx.run_id.clone(),
      node_id: node.node_id.clone(),
      iteration: index,
      quality: judgment.quality,
      decision: judgment.decision,
    });

    let decision = judgment.decision;
    let meets_threshold = threshold.is_some_and(|t| judgment.quality >= t);
    let rationale = judgment.rationale.clone();
    if let Some(last) = record.iterations.last_mut() {
      last.judgment = Some(judgment);
    }
    record.phase = RefinementPhase::Judged;

    if decision == Decision::Accept || meets_threshold {
      record.phase = RefinementPhase::Accepted;
      record.final_iteration = Some(index);
      publish(ctx, &node.node_id, result, &record).await?;
      return Ok(NodeOutcome::Completed(outputs));
    }

    if decision == Decision::Remove {
      if node.optional {
        record.phase = RefinementPhase::Removed;
        record.final_iteration = Some(index);
        record.was_removed = true;
        record.removal_reason = Some(rationale.clone());
        publish(ctx, &node.node_id, result, &record).await?;
        return Ok(NodeOutcome::Removed(rationale));
      }

      record.phase = RefinementPhase::Failed;
      publish(ctx, &node.node_id, result, &record).await?;
      return Ok(NodeOutcome::Failed(ExecutionError::RemovalRejected {
        node_id: node.node_id.clone(),
        rationale,
      }));
    }

    if index == max_iterations {
      break;
    }

    record.phase = RefinementPhase::Retrying;
    publish(ctx, &node.node_id, result, &record).await?;

    let proposed = match ctx.optimizer.optimize(&node_ctx, &record.iterations).await {
      Ok(proposed) => proposed,
      Err(source) => {
        record.phase = RefinementPhase::Failed;
        publish(ctx, &node.node_id, result, &record).await?;
        return Ok(NodeOutcome::Failed(ExecutionError::Optimizer {
          node_id: node.node_id.clone(),
          source,
        }));
      }
    };

    current = apply_adjustments(
      &node.node_id,
      tool,
      &current,
      proposed,
      node.locked_inputs(),
      &edge_fed,
    );
  }

  let rationale = record.last_rationale().unwrap_or_default().to_string();

  if node.optional {
    let reason = format!(
      "not accepted after {} iterations: {}",
      max_iterations, rationale
    );
    record.phase = RefinementPhase::Removed;
    record.final_iteration = Some(max_iterations);
    record.was_removed = true;
    record.removal_reason = Some(reason.clone());
    publish(ctx, &node.node_id, result, &record).await?;
    return Ok(NodeOutcome::Removed(reason));
  }

  record.phase = RefinementPhase::Failed;
  publish(ctx, &node.node_id, result, &record).await?;
  Ok(NodeOutcome::Failed(ExecutionError::RefinementExhausted {
    node_id: node.node_id.clone(),
    iterations: max_iterations,
    rationale,
  }))
}
