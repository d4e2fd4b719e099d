use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
  #[error("tool already registered: {0}")]
  DuplicateTool(String),

  #[error("tool not found: {0}")]
  ToolNotFound(String),

  #[error("failed to read tool manifest: {0}")]
  Io(#[from] std::io::Error),

  #[error("failed to parse tool manifest: {0}")]
  Parse(#[from] serde_json::Error),
}
