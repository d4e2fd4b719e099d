//! Assay Pipeline
//!
//! This crate provides the declarative pipeline representation and the checks
//! that decide whether a pipeline may run.
//!
//! A pipeline is a set of nodes, each an invocation of a catalog tool, whose
//! input ports are bound to static values, to another node's output, or left
//! unresolved for the caller to fill. Edges are either declared explicitly or
//! implied by `Connection` bindings; together they form the *effective* edge
//! set that the [`Graph`] and [`validate`] operate on.
//!
//! Validation never mutates the pipeline and reports every problem at once.

mod error;
mod graph;
mod pipeline;
mod quality;
mod validator;

pub use error::{ValidationError, ValidationErrorKind};
pub use graph::Graph;
pub use pipeline::{InputBinding, Pipeline, PipelineEdge, PipelineNode, PortRef, RefinementConfig};
pub use quality::QualityLabel;
pub use validator::{ValidationReport, validate};
