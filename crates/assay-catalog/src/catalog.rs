use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use tokio::fs;
use tracing::debug;

use crate::error::CatalogError;
use crate::tool::ToolDefinition;

/// Registry of the tools a pipeline may reference.
///
/// Built once by its owner and read-only afterwards. Lookups are by
/// `tool_id`; listings are always ordered by `tool_id` so output is stable.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
  tools: HashMap<String, ToolDefinition>,
}

impl ToolCatalog {
  pub fn new() -> Self {
    Self::default()
  }

  /// Load a catalog from a JSON manifest holding an array of tool definitions.
  pub async fn from_manifest(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).await?;
    let tools: Vec<ToolDefinition> = serde_json::from_str(&content)?;

    let mut catalog = Self::new();
    for tool in tools {
      catalog.register(tool)?;
    }

    debug!(path = %path.display(), tools = catalog.len(), "catalog_loaded");
    Ok(catalog)
  }

  /// Register a tool. Tool ids are unique within a catalog.
  pub fn register(&mut self, tool: ToolDefinition) -> Result<(), CatalogError> {
    if self.tools.contains_key(&tool.tool_id) {
      return Err(CatalogError::DuplicateTool(tool.tool_id));
    }
    self.tools.insert(tool.tool_id.clone(), tool);
    Ok(())
  }

  pub fn get(&self, tool_id: &str) -> Result<&ToolDefinition, CatalogError> {
    self
      .tools
      .get(tool_id)
      .ok_or_else(|| CatalogError::ToolNotFound(tool_id.to_string()))
  }

  pub fn contains(&self, tool_id: &str) -> bool {
    self.tools.contains_key(tool_id)
  }

  /// List tools ordered by id, optionally restricted to one category.
  pub fn list(&self, category: Option<&str>) -> Vec<&ToolDefinition> {
    let mut tools: Vec<&ToolDefinition> = self
      .tools
      .values()
      .filter(|t| category.is_none_or(|c| t.category == c))
      .collect();
    tools.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
    tools
  }

  /// Distinct categories, sorted.
  pub fn categories(&self) -> Vec<&str> {
    self
      .tools
      .values()
      .map(|t| t.category.as_str())
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect()
  }

  /// Case-insensitive search over tool id, name, description and tags.
  pub fn search(&self, query: &str, category: Option<&str>) -> Vec<&ToolDefinition> {
    let query = query.to_lowercase();
    self
      .list(category)
      .into_iter()
      .filter(|t| {
        t.tool_id.to_lowercase().contains(&query)
          || t.name.to_lowercase().contains(&query)
          || t.description.to_lowercase().contains(&query)
          || t.tags.iter().any(|tag| tag.to_lowercase().contains(&query))
      })
      .collect()
  }

  pub fn len(&self) -> usize {
    self.tools.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tools.is_empty()
  }
}
