//! Assay Catalog
//!
//! This crate holds the registry of step kinds ("tools") available to
//! pipelines, along with their typed port signatures and the rules that decide
//! which output ports may feed which input ports.
//!
//! The catalog is built once at startup by its owner, either through explicit
//! [`ToolCatalog::register`] calls or from a JSON manifest, and is read-only
//! afterwards. It is passed by reference (usually behind an `Arc`) to the
//! validator and executor; there is no process-wide registry.

mod catalog;
mod error;
mod tool;
mod types;

pub use catalog::ToolCatalog;
pub use error::CatalogError;
pub use tool::{PortSpec, PortValues, ToolDefinition};
pub use types::{DataType, compatible};
