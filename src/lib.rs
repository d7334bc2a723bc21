//! # Pearl
//!
//! Partial escape analysis with read elimination for CFG-based JIT
//! intermediate representations.
//!
//! For each heap allocation in a method, the pass decides whether it can
//! remain *virtual* - never materialized, its fields tracked as discrete
//! scalars - or must be *materialized* because it escapes the analyzed
//! region. Alongside, it memoizes field and array reads so that a load
//! whose value is already known at a program point is replaced by the
//! cached value instead of touching memory.
//!
//! ## Quick Start
//!
//! ```rust
//! use pearl::{Graph, ObjectLayout, Op, PartialEscapeAnalyzer, ValueKind, WHOLE_ACCESS};
//! use pearl::LocationIdentity;
//! use smallvec::smallvec;
//!
//! let mut graph = Graph::new();
//! let f = graph.fields.add("f", ValueKind::I32);
//! let point = graph.layouts.add(ObjectLayout::Instance { fields: smallvec![f] });
//!
//! let block = graph.add_block();
//! let init = graph.new_node();
//! let alloc = graph.new_node();
//! let read = graph.new_node();
//! graph.push_op(block, Op::Allocate { result: alloc, object: point, values: smallvec![init] });
//! graph.push_op(block, Op::Read {
//!     result: read,
//!     object: alloc,
//!     location: LocationIdentity::Field(f),
//!     index: WHOLE_ACCESS,
//!     kind: ValueKind::I32,
//! });
//!
//! let results = PartialEscapeAnalyzer::new().analyze(&graph).unwrap();
//! assert!(results.is_virtualized(point));
//! assert_eq!(results.substitution(read), Some(init));
//! ```
//!
//! ## Module Overview
//!
//! - [`ids`] - identifier newtypes (nodes, blocks, allocation sites, fields)
//! - [`kind`] - value kinds
//! - [`location`] - location identities and the field table
//! - [`ir`] - the op stream and CFG the analysis consumes
//! - [`ea`] - the analysis itself: substate, read cache, block state, driver
//! - [`error`] - invariant-violation errors that abort a method's analysis

pub mod ea;
pub mod error;
pub mod ids;
pub mod ir;
pub mod kind;
pub mod location;

// Re-export commonly used types
pub use ea::{
    AnalysisResults, AnalysisStats, AnalyzerConfig, BlockState, CacheKey, Classification,
    ObjectState, ObjectStates, PartialEscapeAnalyzer, ReadCache, WHOLE_ACCESS,
};
pub use error::{AnalysisError, AnalysisResult};
pub use ids::{BlockId, FieldId, NodeId, ObjectId};
pub use ir::{BlockData, Graph, ObjectLayout, ObjectLayouts, Op};
pub use kind::ValueKind;
pub use location::{FieldTable, LocationIdentity};
