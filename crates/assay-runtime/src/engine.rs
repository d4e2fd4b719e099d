//! Pipeline engine.
//!
//! The `PipelineEngine` is the entry point hosts talk to. It validates
//! pipelines, starts runs in the background and answers status queries from
//! the store.

use std::collections::HashMap;
use std::sync::Arc;

use assay_catalog::{PortValues, ToolCatalog};
use assay_pipeline::{InputBinding, Pipeline, ValidationReport, validate};
use assay_store::{ExecutionStore, MemoryStore, RunState, RunStatus, StoreError};
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::capability::{
  AcceptingJudge, ParameterOptimizer, PassthroughOptimizer, QualityJudge, ToolExecutor,
};
use crate::config::{ConfigError, EngineConfig};
use crate::error::EngineError;
use crate::events::{ExecutionNotifier, NoopNotifier};
use crate::executor::{RunContext, execute_run};

struct RunHandle {
  cancel: CancellationToken,
  /// Flips to `true` once the run's background task has finished.
  done: watch::Receiver<bool>,
}

/// The pipeline execution engine.
///
/// Generic over `N: ExecutionNotifier` to allow different notification strategies.
/// Use `PipelineEngine::new()` for an engine with no-op notifications,
/// or `PipelineEngine::with_notifier()` to provide a custom notifier.
pub struct PipelineEngine<N: ExecutionNotifier + 'static = NoopNotifier> {
  catalog: Arc<ToolCatalog>,
  tools: Arc<dyn ToolExecutor>,
  judge: Arc<dyn QualityJudge>,
  optimizer: Arc<dyn ParameterOptimizer>,
  store: Arc<dyn ExecutionStore>,
  config: EngineConfig,
  notifier: Arc<N>,
  runs: RwLock<HashMap<String, RunHandle>>,
}

impl PipelineEngine<NoopNotifier> {
  /// Create an engine with no-op notifications, an in-memory store, and
  /// refinement capabilities that accept every first iteration.
  pub fn new(catalog: Arc<ToolCatalog>, tools: Arc<dyn ToolExecutor>) -> Self {
    Self::with_notifier(catalog, tools, NoopNotifier)
  }
}

impl<N: ExecutionNotifier + 'static> PipelineEngine<N> {
  /// Create an engine with a custom notifier.
  pub fn with_notifier(
    catalog: Arc<ToolCatalog>,
    tools: Arc<dyn ToolExecutor>,
    notifier: N,
  ) -> Self {
    Self {
      catalog,
      tools,
      judge: Arc::new(AcceptingJudge),
      optimizer: Arc::new(PassthroughOptimizer),
      store: Arc::new(MemoryStore::new()),
      config: EngineConfig::default(),
      notifier: Arc::new(notifier),
      runs: RwLock::new(HashMap::new()),
    }
  }

  pub fn with_judge(mut self, judge: Arc<dyn QualityJudge>) -> Self {
    self.judge = judge;
    self
  }

  pub fn with_optimizer(mut self, optimizer: Arc<dyn ParameterOptimizer>) -> Self {
    self.optimizer = optimizer;
    self
  }

  pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
    self.store = store;
    self
  }

  /// Replace the engine config. Rejects configs that fail
  /// [`EngineConfig::validate`].
  pub fn with_config(mut self, config: EngineConfig) -> Result<Self, ConfigError> {
    config.validate()?;
    self.config = config;
    Ok(self)
  }

  pub fn catalog(&self) -> &ToolCatalog {
    &self.catalog
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  /// Validate a pipeline against the engine's catalog.
  pub fn validate(&self, pipeline: &Pipeline) -> ValidationReport {
    validate(pipeline, &self.catalog)
  }

  /// Validate a pipeline and start running it in the background.
  ///
  /// Returns the new run's id. A pipeline that fails validation is rejected
  /// before any run is created.
  pub async fn submit(
    &self,
    pipeline: Pipeline,
    adaptive_mode: bool,
  ) -> Result<String, EngineError> {
    let report = self.validate(&pipeline);
    if !report.is_valid() {
      warn!(
        pipeline_id = %pipeline.pipeline_id,
        errors = report.errors().len(),
        "pipeline_rejected"
      );
      return Err(EngineError::Validation(report.into_errors()));
    }

    let run_id = self.store.create(&pipeline, adaptive_mode).await?;
    let cancel = CancellationToken::new();
    let (done_tx, done_rx) = watch::channel(false);

    info!(
      run_id = %run_id,
      pipeline_id = %pipeline.pipeline_id,
      adaptive_mode,
      "run_submitted"
    );

    let ctx = Arc::new(RunContext::new(
      run_id.clone(),
      Arc::new(pipeline),
      self.catalog.clone(),
      self.tools.clone(),
      self.judge.clone(),
      self.optimizer.clone(),
      self.store.clone(),
      self.notifier.clone(),
      self.config.clone(),
      adaptive_mode,
      cancel.clone(),
    ));

    {
      let mut runs = self.runs.write().await;
      // Finished runs need no handle; their state lives in the store.
      runs.retain(|_, handle| !*handle.done.borrow());
      runs.insert(
        run_id.clone(),
        RunHandle {
          cancel,
          done: done_rx,
        },
      );
    }

    let store = self.store.clone();
    let task_run_id = run_id.clone();
    tokio::spawn(async move {
      if let Err(e) = execute_run(ctx).await {
        error!(run_id = %task_run_id, error = %e, "run_aborted");
        // The run may already be gone.
        let _ = store
          .finalize(&task_run_id, RunState::Failed, Some(e.to_string()))
          .await;
      }
      let _ = done_tx.send(true);
    });

    Ok(run_id)
  }

  /// Fill unresolved inputs, then submit.
  ///
  /// `user_inputs` maps node ids to port values. Every entry must target a
  /// port whose binding is `Unresolved`.
  pub async fn submit_with_inputs(
    &self,
    mut pipeline: Pipeline,
    adaptive_mode: bool,
    user_inputs: HashMap<String, PortValues>,
  ) -> Result<String, EngineError> {
    for (node_id, values) in user_inputs {
      for (port, value) in values {
        let binding = pipeline
          .node_mut(&node_id)
          .and_then(|node| node.inputs.get_mut(&port))
          .filter(|binding| matches!(binding, InputBinding::Unresolved { .. }));

        match binding {
          Some(binding) => *binding = InputBinding::Static { value },
          None => {
            return Err(EngineError::UnexpectedUserInput {
              node_id: node_id.clone(),
              port,
            });
          }
        }
      }
    }

    self.submit(pipeline, adaptive_mode).await
  }

  /// Submit a pipeline and wait for it to finish.
  pub async fn run(
    &self,
    pipeline: Pipeline,
    adaptive_mode: bool,
  ) -> Result<RunStatus, EngineError> {
    let run_id = self.submit(pipeline, adaptive_mode).await?;
    self.wait(&run_id).await
  }

  /// Wait for a run to reach a terminal status.
  pub async fn wait(&self, run_id: &str) -> Result<RunStatus, EngineError> {
    let done = self
      .runs
      .read()
      .await
      .get(run_id)
      .map(|handle| handle.done.clone());

    if let Some(mut done) = done {
      // An error means the run task is gone, which also means it is over.
      let _ = done.wait_for(|finished| *finished).await;
      self.runs.write().await.remove(run_id);
    }

    self.status(run_id).await
  }

  /// Poll a run's status.
  pub async fn status(&self, run_id: &str) -> Result<RunStatus, EngineError> {
    self.store.status(run_id).await.map_err(|e| match e {
      StoreError::RunNotFound(id) => EngineError::RunNotFound(id),
      other => EngineError::Store(other),
    })
  }

  /// Request cancellation of a run. Running tools finish their current
  /// invocation; nothing new is started. Cancelling a finished run is a no-op.
  pub async fn cancel(&self, run_id: &str) -> Result<(), EngineError> {
    // The store decides whether the run still exists; superseded and
    // discarded runs are gone even if a handle lingers.
    self.status(run_id).await?;

    if let Some(handle) = self.runs.read().await.get(run_id) {
      handle.cancel.cancel();
      info!(run_id = %run_id, "run_cancel_requested");
    }
    Ok(())
  }

  /// Cancel a run if it is still going and drop all of its state.
  pub async fn discard(&self, run_id: &str) -> Result<(), EngineError> {
    if let Some(handle) = self.runs.write().await.remove(run_id) {
      handle.cancel.cancel();
    }
    self.store.discard(run_id).await.map_err(|e| match e {
      StoreError::RunNotFound(id) => EngineError::RunNotFound(id),
      other => EngineError::Store(other),
    })?;
    info!(run_id = %run_id, "run_discarded");
    Ok(())
  }

  /// Number of run handles held. Handles of finished runs are dropped by
  /// `wait` and by the next `submit`.
  pub async fn tracked_runs(&self) -> usize {
    self.runs.read().await.len()
  }

  /// Ids of every stored run of a pipeline, oldest first.
  pub async fn runs_for_pipeline(&self, pipeline_id: &str) -> Result<Vec<String>, EngineError> {
    Ok(self.store.runs_for_pipeline(pipeline_id).await?)
  }
}
