//! Analysis errors.
//!
//! Every cache and state operation is total: a cache miss is an expected
//! outcome, not a failure. The variants here are internal invariant
//! violations - a malformed op stream, an allocation that disagrees with
//! its registered layout. They abort optimization of the current method;
//! the caller keeps the unoptimized code path and compilation continues.
//!
//! Exhausting the loop-iteration bound is deliberately *not* an error:
//! the driver degrades precision and still produces a sound result.

use thiserror::Error;

use crate::ids::{FieldId, NodeId, ObjectId};

/// Result type alias for analysis operations.
pub type AnalysisResult<T> = Result<T, AnalysisError>;

/// An unrecoverable fault in the op stream or its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    /// An allocation references an object id with no registered layout.
    #[error("allocation {alloc} references unregistered object {object}")]
    UnknownObject { object: ObjectId, alloc: NodeId },

    /// An allocation's initial values disagree with its layout.
    #[error("allocation of {object} carries {got} initial values, layout has {expected} entries")]
    EntryCountMismatch {
        object: ObjectId,
        expected: usize,
        got: usize,
    },

    /// A field access names a field the object's layout does not have.
    #[error("object {object} has no field {field}")]
    UnknownField { object: ObjectId, field: FieldId },

    /// An array access op against an instance layout, or vice versa.
    #[error("access shape does not match the layout of {object}")]
    LayoutShapeMismatch { object: ObjectId },
}
