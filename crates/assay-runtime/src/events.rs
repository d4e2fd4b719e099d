//! Execution events and notifiers for observability.
//!
//! Events mirror every state transition the executor writes to the store, so
//! consumers can stream progress without polling. Polling the store remains
//! the source of truth.

use assay_catalog::PortValues;
use assay_pipeline::QualityLabel;
use assay_store::Decision;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted during pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// A run has started executing.
  RunStarted { run_id: String, pipeline_id: String },

  /// All of a node's producers have settled.
  NodeReady { run_id: String, node_id: String },

  /// A node has started executing.
  NodeStarted { run_id: String, node_id: String },

  /// A node has completed successfully.
  NodeCompleted {
    run_id: String,
    node_id: String,
    outputs: PortValues,
  },

  /// A node has failed.
  NodeFailed {
    run_id: String,
    node_id: String,
    error: String,
  },

  /// A node was skipped because something upstream failed or was removed.
  NodeBlocked {
    run_id: String,
    node_id: String,
    reason: String,
  },

  /// An optional adaptive node was excised from the run.
  NodeRemoved {
    run_id: String,
    node_id: String,
    reason: String,
  },

  /// The quality judge rated one refinement iteration.
  IterationJudged {
    run_id: String,
    node_id: String,
    iteration: u32,
    quality: QualityLabel,
    decision: Decision,
  },

  /// Every node settled without failure.
  RunCompleted { run_id: String },

  /// The run ended with failed or blocked nodes, or was cancelled.
  RunFailed { run_id: String, error: String },
}

/// Trait for receiving execution events.
///
/// The engine calls `notify` for each event. Implementations decide what to
/// do with them (persist, broadcast, log, ignore).
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls the scheduler. Volume is a
  // handful of events per node.
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
