use std::collections::HashMap;

use assay_catalog::PortValues;
use serde::{Deserialize, Serialize};

use crate::types::{ExecutionState, Iteration, NodeStatus, RunState};

/// Polled view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
  pub run_id: String,
  pub status: RunState,
  /// Fraction of nodes that have settled, 0.0 to 1.0.
  pub progress: f64,
  pub completed_nodes: usize,
  pub total_nodes: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub current_node: Option<String>,
  /// Present once the run is terminal.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub result: Option<RunResult>,
  /// Present for adaptive runs.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub refinement_info: Option<RefinementInfo>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
  pub step_results: Vec<StepResult>,
  /// Outputs of every completed node with no completed downstream node.
  pub final_outputs: HashMap<String, PortValues>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
  pub step_id: String,
  pub step_name: String,
  pub status: NodeStatus,
  pub outputs: PortValues,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error_message: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub iterations: Vec<Iteration>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub final_iteration: Option<u32>,
  pub was_removed: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub removal_reason: Option<String>,
}

/// Aggregate refinement statistics for a run, computed at query time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinementInfo {
  pub steps_refined: usize,
  pub tools_removed: usize,
  pub total_iterations: usize,
}

impl RefinementInfo {
  pub fn from_state(state: &ExecutionState) -> Self {
    state
      .ordered_nodes()
      .filter_map(|n| n.refinement.as_ref())
      .fold(Self::default(), |mut info, record| {
        info.total_iterations += record.iterations.len();
        if record.was_refined() {
          info.steps_refined += 1;
        }
        if record.was_removed {
          info.tools_removed += 1;
        }
        info
      })
  }
}

impl RunResult {
  pub fn from_state(state: &ExecutionState) -> Self {
    let step_results = state
      .ordered_nodes()
      .map(|node| {
        let refinement = node.refinement.as_ref();
        StepResult {
          step_id: node.node_id.clone(),
          step_name: node.node_name.clone(),
          status: node.status,
          outputs: node.outputs.clone(),
          error_message: node.error.clone(),
          iterations: refinement.map(|r| r.iterations.clone()).unwrap_or_default(),
          final_iteration: refinement.and_then(|r| r.final_iteration),
          was_removed: refinement.is_some_and(|r| r.was_removed),
          removal_reason: refinement.and_then(|r| r.removal_reason.clone()),
        }
      })
      .collect();

    let is_completed =
      |id: &str| state.node(id).is_some_and(|n| n.status == NodeStatus::Completed);

    let final_outputs = state
      .ordered_nodes()
      .filter(|n| n.status == NodeStatus::Completed)
      .filter(|n| {
        !state
          .downstream
          .get(&n.node_id)
          .is_some_and(|down| down.iter().any(|d| is_completed(d.as_str())))
      })
      .map(|n| (n.node_id.clone(), n.outputs.clone()))
      .collect();

    Self {
      step_results,
      final_outputs,
    }
  }
}

impl From<&ExecutionState> for RunStatus {
  fn from(state: &ExecutionState) -> Self {
    let total_nodes = state.nodes.len();
    let settled = state.nodes.values().filter(|n| n.status.is_terminal()).count();
    let completed_nodes = state
      .nodes
      .values()
      .filter(|n| n.status == NodeStatus::Completed)
      .count();

    let progress = if total_nodes == 0 {
      if state.status.is_terminal() { 1.0 } else { 0.0 }
    } else {
      settled as f64 / total_nodes as f64
    };

    let current_node = state
      .execution_order
      .iter()
      .find(|id| state.node(id).is_some_and(|n| n.status == NodeStatus::Running))
      .cloned();

    Self {
      run_id: state.run_id.clone(),
      status: state.status,
      progress,
      completed_nodes,
      total_nodes,
      current_node,
      result: state
        .status
        .is_terminal()
        .then(|| RunResult::from_state(state)),
      refinement_info: state
        .adaptive_mode
        .then(|| RefinementInfo::from_state(state)),
      error: state.error.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{Decision, Judgment, RefinementRecord};
  use assay_pipeline::{Pipeline, PipelineNode, QualityLabel};
  use serde_json::json;

  fn state(adaptive: bool) -> ExecutionState {
    let pipeline = Pipeline::new("p", "p")
      .with_node(PipelineNode::new("load", "load_image"))
      .with_node(PipelineNode::new("blur", "gaussian_blur").with_connection("image", "load", "image"))
      .with_node(PipelineNode::new("count", "count_objects").with_connection("mask", "blur", "image"));
    ExecutionState::new("run", &pipeline, adaptive)
  }

  fn complete(state: &mut ExecutionState, node_id: &str, outputs: serde_json::Value) {
    let node = state.nodes.get_mut(node_id).unwrap();
    node.transition(NodeStatus::Running, None);
    node.outputs = outputs.as_object().cloned().unwrap();
    node.transition(NodeStatus::Completed, None);
  }

  fn iteration(index: u32, decision: Decision) -> Iteration {
    Iteration {
      index,
      inputs: PortValues::new(),
      outputs: PortValues::new(),
      judgment: Some(Judgment::new(QualityLabel::Poor, decision, "noisy")),
      duration_ms: 5,
      artifacts: Vec::new(),
      error: None,
    }
  }

  #[test]
  fn test_running_status_has_no_result() {
    let mut state = state(false);
    state.status = RunState::Running;
    complete(&mut state, "load", json!({ "image": "a.tif" }));
    let blur = state.nodes.get_mut("blur").unwrap();
    blur.transition(NodeStatus::Running, None);
    state.execution_order = vec!["load".to_string(), "blur".to_string()];

    let status = RunStatus::from(&state);
    assert_eq!(status.status, RunState::Running);
    assert_eq!(status.completed_nodes, 1);
    assert_eq!(status.total_nodes, 3);
    assert!((status.progress - 1.0 / 3.0).abs() < f64::EPSILON);
    assert_eq!(status.current_node.as_deref(), Some("blur"));
    assert!(status.result.is_none());
    assert!(status.refinement_info.is_none());
  }

  #[test]
  fn test_final_outputs_are_completed_sinks() {
    let mut state = state(false);
    complete(&mut state, "load", json!({ "image": "a.tif" }));
    complete(&mut state, "blur", json!({ "image": "b.tif" }));
    state
      .nodes
      .get_mut("count")
      .unwrap()
      .transition(NodeStatus::Failed, Some("boom".to_string()));
    state.status = RunState::Failed;

    let result = RunStatus::from(&state).result.unwrap();
    assert_eq!(result.step_results.len(), 3);
    assert_eq!(result.step_results[2].error_message.as_deref(), Some("boom"));
    assert_eq!(result.final_outputs.len(), 1);
    assert_eq!(result.final_outputs["blur"]["image"], json!("b.tif"));
  }

  #[test]
  fn test_refinement_info_aggregates_records() {
    let mut state = state(true);
    state.nodes.get_mut("blur").unwrap().refinement = Some(RefinementRecord {
      iterations: vec![iteration(1, Decision::Retry), iteration(2, Decision::Accept)],
      final_iteration: Some(2),
      ..Default::default()
    });
    state.nodes.get_mut("count").unwrap().refinement = Some(RefinementRecord {
      iterations: vec![iteration(1, Decision::Remove)],
      final_iteration: Some(1),
      was_removed: true,
      removal_reason: Some("noisy".to_string()),
      ..Default::default()
    });
    state.nodes.get_mut("load").unwrap().refinement = Some(RefinementRecord {
      iterations: vec![iteration(1, Decision::Accept)],
      final_iteration: Some(1),
      ..Default::default()
    });
    state.status = RunState::Completed;

    let status = RunStatus::from(&state);
    assert_eq!(
      status.refinement_info,
      Some(RefinementInfo {
        steps_refined: 2,
        tools_removed: 1,
        total_iterations: 4,
      })
    );

    let steps = status.result.unwrap().step_results;
    assert_eq!(steps[1].iterations.len(), 2);
    assert_eq!(steps[1].final_iteration, Some(2));
    assert!(steps[2].was_removed);
    assert_eq!(steps[2].removal_reason.as_deref(), Some("noisy"));
  }

  #[test]
  fn test_empty_terminal_run_is_fully_progressed() {
    let pipeline = Pipeline::new("empty", "empty");
    let mut state = ExecutionState::new("run", &pipeline, false);
    state.status = RunState::Completed;
    let status = RunStatus::from(&state);
    assert_eq!(status.progress, 1.0);
    assert!(status.result.unwrap().final_outputs.is_empty());
  }
}
