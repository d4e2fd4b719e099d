use std::path::Path;

use assay_pipeline::QualityLabel;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config: {0}")]
  Io(#[from] std::io::Error),

  #[error("failed to parse config: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("invalid config: {0}")]
  Invalid(String),
}

fn default_max_concurrency() -> usize {
  8
}

fn default_max_iterations() -> u32 {
  3
}

/// Configuration for the pipeline engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
  /// Upper bound on nodes executing at once within a single run.
  #[serde(default = "default_max_concurrency")]
  pub max_concurrency: usize,

  /// Per-invocation tool timeout. A node's own `timeout_ms` takes precedence.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tool_timeout_ms: Option<u64>,

  /// Refinement budget for adaptive nodes that do not set one.
  #[serde(default = "default_max_iterations")]
  pub default_max_iterations: u32,

  /// Quality at which adaptive nodes are accepted regardless of the judge's
  /// decision, for nodes that do not set their own threshold.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default_quality_threshold: Option<QualityLabel>,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      max_concurrency: default_max_concurrency(),
      tool_timeout_ms: None,
      default_max_iterations: default_max_iterations(),
      default_quality_threshold: None,
    }
  }
}

impl EngineConfig {
  pub fn from_json(json: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let content = tokio::fs::read_to_string(path).await?;
    Self::from_json(&content)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.max_concurrency == 0 {
      return Err(ConfigError::Invalid(
        "max_concurrency must be at least 1".to_string(),
      ));
    }
    if self.default_max_iterations == 0 {
      return Err(ConfigError::Invalid(
        "default_max_iterations must be at least 1".to_string(),
      ));
    }
    Ok(())
  }
}
