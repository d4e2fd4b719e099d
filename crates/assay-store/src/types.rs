use std::collections::HashMap;

use assay_catalog::PortValues;
use assay_pipeline::{Pipeline, QualityLabel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
  Queued,
  Running,
  Completed,
  Failed,
}

impl RunState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, RunState::Completed | RunState::Failed)
  }
}

/// Status of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
  Pending,
  Ready,
  Running,
  Completed,
  Failed,
  /// Not executed because an upstream node failed or was removed.
  Blocked,
  /// Excised by adaptive refinement.
  Removed,
}

impl NodeStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Removed
    )
  }
}

/// One entry in a node's status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTransition {
  pub status: NodeStatus,
  pub at: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
}

/// Phase of the refinement loop for an adaptive node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementPhase {
  Draft,
  Executed,
  Judged,
  Accepted,
  Retrying,
  Removed,
  Failed,
}

/// What the quality judge wants done with a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
  Accept,
  Retry,
  Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
  pub quality: QualityLabel,
  pub decision: Decision,
  #[serde(default)]
  pub rationale: String,
}

impl Judgment {
  pub fn new(quality: QualityLabel, decision: Decision, rationale: impl Into<String>) -> Self {
    Self {
      quality,
      decision,
      rationale: rationale.into(),
    }
  }
}

/// A single attempt of an adaptive node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
  /// 1-based.
  pub index: u32,
  pub inputs: PortValues,
  pub outputs: PortValues,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub judgment: Option<Judgment>,
  pub duration_ms: u64,
  /// File references to images and masks produced by this attempt.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub artifacts: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementRecord {
  pub phase: RefinementPhase,
  pub iterations: Vec<Iteration>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub final_iteration: Option<u32>,
  pub was_removed: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub removal_reason: Option<String>,
}

impl Default for RefinementRecord {
  fn default() -> Self {
    Self {
      phase: RefinementPhase::Draft,
      iterations: Vec::new(),
      final_iteration: None,
      was_removed: false,
      removal_reason: None,
    }
  }
}

impl RefinementRecord {
  /// Whether the step needed more than one attempt or was removed.
  pub fn was_refined(&self) -> bool {
    self.iterations.len() > 1 || self.was_removed
  }

  pub fn last_rationale(&self) -> Option<&str> {
    self
      .iterations
      .iter()
      .rev()
      .find_map(|i| i.judgment.as_ref())
      .map(|j| j.rationale.as_str())
  }
}

/// Result of one node within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
  pub node_id: String,
  pub node_name: String,
  pub tool_id: String,
  pub status: NodeStatus,
  #[serde(default)]
  pub inputs: PortValues,
  #[serde(default)]
  pub outputs: PortValues,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub duration_ms: Option<u64>,
  #[serde(default)]
  pub transitions: Vec<NodeTransition>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub refinement: Option<RefinementRecord>,
}

impl NodeResult {
  pub fn new(
    node_id: impl Into<String>,
    node_name: impl Into<String>,
    tool_id: impl Into<String>,
  ) -> Self {
    Self {
      node_id: node_id.into(),
      node_name: node_name.into(),
      tool_id: tool_id.into(),
      status: NodeStatus::Pending,
      inputs: PortValues::new(),
      outputs: PortValues::new(),
      error: None,
      started_at: None,
      finished_at: None,
      duration_ms: None,
      transitions: Vec::new(),
      refinement: None,
    }
  }

  /// Move to `status`, appending a timestamped entry to the status log.
  ///
  /// Entering `Running` stamps `started_at`; entering a terminal status
  /// stamps `finished_at` and, if the node ran, `duration_ms`. A terminal
  /// reason on `Failed`/`Blocked` is also recorded as the node's error.
  pub fn transition(&mut self, status: NodeStatus, reason: Option<String>) {
    let now = Utc::now();
    if status == NodeStatus::Running {
      self.started_at = Some(now);
    }
    if status.is_terminal() {
      self.finished_at = Some(now);
      if let Some(started) = self.started_at {
        self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
      }
      if matches!(status, NodeStatus::Failed | NodeStatus::Blocked) && self.error.is_none() {
        self.error = reason.clone();
      }
    }

    self.status = status;
    self.transitions.push(NodeTransition {
      status,
      at: now,
      reason,
    });
  }
}

/// Everything known about one run of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
  pub run_id: String,
  pub pipeline_id: String,
  pub pipeline_name: String,
  pub adaptive_mode: bool,
  pub status: RunState,
  pub created_at: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// Node ids in pipeline order.
  pub node_order: Vec<String>,
  /// Node ids in the order they started running.
  #[serde(default)]
  pub execution_order: Vec<String>,
  /// node_id -> direct downstream node ids.
  pub downstream: HashMap<String, Vec<String>>,
  pub nodes: HashMap<String, NodeResult>,
}

impl ExecutionState {
  /// A queued run with every node pending.
  pub fn new(run_id: impl Into<String>, pipeline: &Pipeline, adaptive_mode: bool) -> Self {
    let graph = pipeline.graph();
    let node_order: Vec<String> = graph.nodes().to_vec();
    let downstream = node_order
      .iter()
      .map(|id| (id.clone(), graph.downstream(id).to_vec()))
      .collect();
    let nodes = pipeline
      .nodes
      .iter()
      .map(|n| {
        (
          n.node_id.clone(),
          NodeResult::new(&n.node_id, n.display_name(), &n.tool_id),
        )
      })
      .collect();

    Self {
      run_id: run_id.into(),
      pipeline_id: pipeline.pipeline_id.clone(),
      pipeline_name: pipeline.name.clone(),
      adaptive_mode,
      status: RunState::Queued,
      created_at: Utc::now(),
      started_at: None,
      finished_at: None,
      error: None,
      node_order,
      execution_order: Vec::new(),
      downstream,
      nodes,
    }
  }

  pub fn node(&self, node_id: &str) -> Option<&NodeResult> {
    self.nodes.get(node_id)
  }

  /// Node results in pipeline order.
  pub fn ordered_nodes(&self) -> impl Iterator<Item = &NodeResult> {
    self.node_order.iter().filter_map(|id| self.nodes.get(id))
  }
}
