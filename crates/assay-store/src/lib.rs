//! Assay Store
//!
//! This crate provides the storage trait and the in-memory implementation for
//! pipeline runs. Each run is an [`ExecutionState`] holding one
//! [`NodeResult`] per pipeline node.
//!
//! The [`ExecutionStore`] trait defines operations for:
//! - Creating runs and moving them through their lifecycle
//! - Writing node results and refinement records as they change
//! - Projecting a run into the polled [`RunStatus`] view
//!
//! The executor is the only writer. Readers always observe the latest write.

mod memory;
mod status;
mod types;

pub use memory::MemoryStore;
pub use status::{RefinementInfo, RunResult, RunStatus, StepResult};
pub use types::{
  Decision, ExecutionState, Iteration, Judgment, NodeResult, NodeStatus, NodeTransition,
  RefinementPhase, RefinementRecord, RunState,
};

use assay_pipeline::Pipeline;
use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("run not found: {0}")]
  RunNotFound(String),

  #[error("node '{node_id}' not found in run {run_id}")]
  NodeNotFound { run_id: String, node_id: String },
}

/// Storage for run state.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
  /// Create a queued run for a pipeline and return its id.
  async fn create(&self, pipeline: &Pipeline, adaptive_mode: bool) -> Result<String, StoreError>;

  /// Get a snapshot of a run.
  async fn get(&self, run_id: &str) -> Result<ExecutionState, StoreError>;

  /// Replace a node's result. A result entering `Running` for the first time
  /// is appended to the run's execution order.
  async fn update(&self, run_id: &str, node_id: &str, result: NodeResult)
  -> Result<(), StoreError>;

  /// Replace a node's refinement record without touching the rest of its result.
  async fn update_refinement(
    &self,
    run_id: &str,
    node_id: &str,
    record: RefinementRecord,
  ) -> Result<(), StoreError>;

  /// Mark a queued run as running.
  async fn mark_running(&self, run_id: &str) -> Result<(), StoreError>;

  /// Set a run's terminal status.
  async fn finalize(
    &self,
    run_id: &str,
    status: RunState,
    error: Option<String>,
  ) -> Result<(), StoreError>;

  /// Drop a run.
  async fn discard(&self, run_id: &str) -> Result<(), StoreError>;

  /// Run ids for a pipeline, oldest first.
  async fn runs_for_pipeline(&self, pipeline_id: &str) -> Result<Vec<String>, StoreError>;

  /// Project a run into its polled status view.
  async fn status(&self, run_id: &str) -> Result<RunStatus, StoreError> {
    let state = self.get(run_id).await?;
    Ok(RunStatus::from(&state))
  }
}
