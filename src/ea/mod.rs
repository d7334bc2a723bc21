//! # Partial Escape Analysis with Read Elimination
//!
//! The per-block abstract-state engine: which allocations can stay
//! virtual, which must become real heap objects, and which memory reads
//! are redundant because the value at that location is already known.
//!
//! ## Module Structure
//!
//! - [`objects`] - escape substate: object states, aliasing, resolution
//! - [`cache`] - the read cache and its invalidation rules
//! - [`state`] - per-block state, merge, and the equivalence test
//! - [`analyzer`] - the fixpoint driver over the CFG
//!
//! ## State Flow
//!
//! ```text
//! entry (empty state)
//!   └── block: process ops, consult/update substate + cache
//!       ├── one successor: clone
//!       └── join: merge (meet - only facts all paths agree on survive)
//! loop headers: revisit until the merged state tests equivalent
//! ```

pub mod analyzer;
pub mod cache;
pub mod objects;
pub mod state;

pub use analyzer::{
    AnalysisResults, AnalysisStats, AnalyzerConfig, Classification, PartialEscapeAnalyzer,
};
pub use cache::{CacheKey, ReadCache, WHOLE_ACCESS};
pub use objects::{ObjectState, ObjectStates};
pub use state::BlockState;
