use std::collections::HashMap;
use std::sync::Arc;

use assay_pipeline::Pipeline;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::types::{ExecutionState, NodeResult, NodeStatus, RefinementRecord, RunState};
use crate::{ExecutionStore, StoreError};

type RunHandle = Arc<RwLock<ExecutionState>>;

/// In-memory run storage.
///
/// Each run sits behind its own lock, so writes to different runs never
/// contend. The outer map lock is only held to insert, look up or drop runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
  runs: RwLock<HashMap<String, RunHandle>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  async fn run(&self, run_id: &str) -> Result<RunHandle, StoreError> {
    self
      .runs
      .read()
      .await
      .get(run_id)
      .cloned()
      .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
  }
}

fn node_mut<'a>(
  state: &'a mut ExecutionState,
  node_id: &str,
) -> Result<&'a mut NodeResult, StoreError> {
  let run_id = state.run_id.clone();
  state
    .nodes
    .get_mut(node_id)
    .ok_or_else(|| StoreError::NodeNotFound {
      run_id,
      node_id: node_id.to_string(),
    })
}

#[async_trait]
impl ExecutionStore for MemoryStore {
  async fn create(&self, pipeline: &Pipeline, adaptive_mode: bool) -> Result<String, StoreError> {
    let run_id = uuid::Uuid::new_v4().to_string();
    let state = ExecutionState::new(&run_id, pipeline, adaptive_mode);

    let mut runs = self.runs.write().await;

    // Finished runs of the same pipeline are superseded by the new one.
    let mut superseded = Vec::new();
    for (id, handle) in runs.iter() {
      let existing = handle.read().await;
      if existing.pipeline_id == pipeline.pipeline_id && existing.status.is_terminal() {
        superseded.push(id.clone());
      }
    }
    for id in superseded {
      runs.remove(&id);
    }

    runs.insert(run_id.clone(), Arc::new(RwLock::new(state)));
    Ok(run_id)
  }

  async fn get(&self, run_id: &str) -> Result<ExecutionState, StoreError> {
    let handle = self.run(run_id).await?;
    let state = handle.read().await;
    Ok(state.clone())
  }

  async fn update(
    &self,
    run_id: &str,
    node_id: &str,
    result: NodeResult,
  ) -> Result<(), StoreError> {
    let handle = self.run(run_id).await?;
    let mut state = handle.write().await;

    let started = result.status == NodeStatus::Running;
    *node_mut(&mut state, node_id)? = result;

    if started && !state.execution_order.iter().any(|id| id == node_id) {
      state.execution_order.push(node_id.to_string());
    }
    Ok(())
  }

  async fn update_refinement(
    &self,
    run_id: &str,
    node_id: &str,
    record: RefinementRecord,
  ) -> Result<(), StoreError> {
    let handle = self.run(run_id).await?;
    let mut state = handle.write().await;
    node_mut(&mut state, node_id)?.refinement = Some(record);
    Ok(())
  }

  async fn mark_running(&self, run_id: &str) -> Result<(), StoreError> {
    let handle = self.run(run_id).await?;
    let mut state = handle.write().await;
    state.status = RunState::Running;
    state.started_at = Some(Utc::now());
    Ok(())
  }

  async fn finalize(
    &self,
    run_id: &str,
    status: RunState,
    error: Option<String>,
  ) -> Result<(), StoreError> {
    let handle = self.run(run_id).await?;
    let mut state = handle.write().await;
    state.status = status;
    state.error = error;
    state.finished_at = Some(Utc::now());
    Ok(())
  }

  async fn discard(&self, run_id: &str) -> Result<(), StoreError> {
    self
      .runs
      .write()
      .await
      .remove(run_id)
      .map(|_| ())
      .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
  }

  async fn runs_for_pipeline(&self, pipeline_id: &str) -> Result<Vec<String>, StoreError> {
    let runs = self.runs.read().await;
    let mut matching = Vec::new();
    for (id, handle) in runs.iter() {
      let state = handle.read().await;
      if state.pipeline_id == pipeline_id {
        matching.push((state.created_at, id.clone()));
      }
    }
    matching.sort();
    Ok(matching.into_iter().map(|(_, id)| id).collect())
  }
}
