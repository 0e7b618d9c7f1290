//! Dependency graph engine.
//!
//! Tracks connections between blocks, caches each block's latest output,
//! propagates it along outgoing edges, and validates the graph structure.
//!
//! # Example
//!
//! ```ignore
//! use block_engine::graph::DependencyGraph;
//! use block_engine::types::{BlockType, Connection};
//!
//! let graph = DependencyGraph::new();
//! graph.upsert_edges(vec![Connection::new("e1", "a", "b")]);
//! graph.record_output("a", "a lighthouse at night", BlockType::Text, "A01");
//!
//! let upstream = graph.upstream_of("b");
//! assert_eq!(upstream[0].content, "a lighthouse at night");
//! ```

pub mod engine;
pub mod references;
pub mod validation;

pub use engine::{BlockOutput, DependencyGraph, UpstreamData};
pub use references::{extract_references, resolve_references};
pub use validation::{
    topological_order, validate_graph, Endpoint, ValidationError, ValidationReport,
    ValidationWarning,
};
