//! Assay Runtime
//!
//! This crate executes validated pipelines and adaptively refines their
//! adaptive steps.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      PipelineEngine                         │
//! │  - validate / submit / wait / status / cancel / discard     │
//! │  - owns catalog, capabilities, store and notifier           │
//! └─────────────────────────────────────────────────────────────┘
//!                               │ one background task per run
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         executor                            │
//! │  - ready queue driven by producer counts                    │
//! │  - JoinSet bounded by max_concurrency                       │
//! │  - blocks dependents of failed or removed producers         │
//! └─────────────────────────────────────────────────────────────┘
//!                               │ per node
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 refinement  /  tool invocation              │
//! │  - execute → judge → accept | retry | remove                │
//! │  - timeouts and panics become node failures                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use assay_runtime::{PipelineEngine, Toolbox};
//!
//! let mut toolbox = Toolbox::new();
//! toolbox.register_fn("gaussian_blur", |inputs| async move { blur(inputs).await });
//!
//! let engine = PipelineEngine::new(Arc::new(catalog), Arc::new(toolbox))
//!   .with_judge(Arc::new(my_judge))
//!   .with_optimizer(Arc::new(my_optimizer));
//!
//! let status = engine.run(pipeline, true).await?;
//! println!("{:?} {:.0}%", status.status, status.progress * 100.0);
//! ```

mod capability;
mod config;
mod engine;
mod error;
mod events;
mod executor;
mod input;
mod refinement;
mod task;

pub use capability::{
  AcceptingJudge, CapabilityError, NodeContext, ParameterOptimizer, PassthroughOptimizer,
  QualityJudge, Tool, ToolError, ToolExecutor, Toolbox,
};
pub use config::{ConfigError, EngineConfig};
pub use engine::PipelineEngine;
pub use error::{EngineError, ExecutionError};
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use input::{Resolution, resolve_inputs};
pub use refinement::apply_adjustments;
