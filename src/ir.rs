//! The IR substrate the analysis consumes.
//!
//! The engine does not build or rewrite IR; it walks a finished [`Graph`]
//! of basic blocks, each holding a finite sequence of [`Op`]s, and reports
//! substitutions and classifications for a later rewrite phase to apply.
//!
//! ## Graph Structure
//!
//! ```text
//! Graph
//! ├── FieldTable            (interned instance fields)
//! ├── ObjectLayouts         (allocation-site layouts, by ObjectId)
//! └── BlockData*
//!     ├── Vec<Op>           (reads, writes, allocations, calls, ...)
//!     └── successors
//! ```
//!
//! Blocks follow the usual CFG conventions: block 0 is the entry,
//! successor edges are explicit, and [`Graph::reverse_postorder`] yields
//! the deterministic processing order the fixpoint driver relies on.

use smallvec::SmallVec;

use crate::ids::{BlockId, FieldId, NodeId, ObjectId};
use crate::kind::ValueKind;
use crate::location::{FieldTable, LocationIdentity};

// ============================================================================
// Object layouts
// ============================================================================

/// The shape of one allocation site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectLayout {
    /// An instance with a fixed list of fields.
    Instance { fields: SmallVec<[FieldId; 4]> },
    /// An array with a fixed element kind and compile-time-known length.
    Array { kind: ValueKind, length: u32 },
}

impl ObjectLayout {
    /// Number of tracked scalar entries for a virtual object of this shape.
    pub fn entry_count(&self) -> usize {
        match self {
            ObjectLayout::Instance { fields } => fields.len(),
            ObjectLayout::Array { length, .. } => *length as usize,
        }
    }

    /// Check if this is an instance layout.
    pub fn is_instance(&self) -> bool {
        matches!(self, ObjectLayout::Instance { .. })
    }
}

/// Allocation-site layouts, addressed by [`ObjectId`].
///
/// One record per static allocation site, registered up front and stable
/// for the whole analysis. Per-block object *states* index into this table
/// instead of holding references to each other, which keeps cyclic object
/// graphs (a field pointing back at its owner) representable without
/// shared mutation.
#[derive(Debug, Clone, Default)]
pub struct ObjectLayouts {
    layouts: Vec<ObjectLayout>,
}

impl ObjectLayouts {
    /// Create an empty layout table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an allocation site and return its id.
    pub fn add(&mut self, layout: ObjectLayout) -> ObjectId {
        let id = ObjectId::new(self.layouts.len() as u32);
        self.layouts.push(layout);
        id
    }

    /// Look up a layout.
    pub fn get(&self, object: ObjectId) -> Option<&ObjectLayout> {
        self.layouts.get(object.index() as usize)
    }

    /// Number of registered allocation sites.
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    /// Check if no sites are registered.
    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Iterate over all registered sites.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &ObjectLayout)> {
        self.layouts
            .iter()
            .enumerate()
            .map(|(i, l)| (ObjectId::new(i as u32), l))
    }
}

// ============================================================================
// Ops
// ============================================================================

/// One operation in a block's stream.
///
/// This is the slice of the IR the analysis cares about; anything else a
/// real method body contains is invisible here because it neither touches
/// the heap nor lets an object escape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Allocate the object of site `object`, with one initial value per
    /// layout entry. `result` is the node denoting the new object.
    Allocate {
        result: NodeId,
        object: ObjectId,
        values: SmallVec<[NodeId; 4]>,
    },

    /// Read `object.location[index]` into `result`. `index == -1` denotes
    /// a whole-field access; a non-negative index denotes an array slot.
    Read {
        result: NodeId,
        object: NodeId,
        location: LocationIdentity,
        index: i32,
        kind: ValueKind,
    },

    /// Write `value` to `object.location[index]`.
    Write {
        object: NodeId,
        location: LocationIdentity,
        index: i32,
        kind: ValueKind,
        value: NodeId,
    },

    /// An unanalyzed call. Arguments escape; side effects are opaque.
    Call { args: SmallVec<[NodeId; 4]> },

    /// An opaque side effect with no argument list (fence, safepoint,
    /// unanalyzed intrinsic). Invalidates all cached reads.
    Barrier,

    /// `value` observably escapes (stored to a global, thrown, returned).
    Escape { value: NodeId },

    /// A decision point: report the current virtual/materialized
    /// classification of the object `value` denotes.
    Check { value: NodeId },
}

// ============================================================================
// Blocks and graph
// ============================================================================

/// A basic block: an op sequence plus explicit successor edges.
#[derive(Debug, Clone, Default)]
pub struct BlockData {
    /// Ops executed sequentially.
    pub ops: Vec<Op>,
    /// Successor blocks.
    pub successors: SmallVec<[BlockId; 2]>,
}

impl BlockData {
    /// Create a new empty block.
    pub fn new() -> Self {
        Self::default()
    }
}

/// A control-flow graph over [`BlockData`], plus the method metadata the
/// analysis reads: the field table and the allocation-site layouts.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    blocks: Vec<BlockData>,
    /// Interned instance fields.
    pub fields: FieldTable,
    /// Allocation-site layouts.
    pub layouts: ObjectLayouts,
    next_node: u32,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new basic block and return its id.
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId::new(self.blocks.len() as u32);
        self.blocks.push(BlockData::new());
        id
    }

    /// Allocate a fresh value node.
    pub fn new_node(&mut self) -> NodeId {
        let id = NodeId::new(self.next_node);
        self.next_node += 1;
        id
    }

    /// Append an op to a block.
    pub fn push_op(&mut self, block: BlockId, op: Op) {
        self.blocks[block.index()].ops.push(op);
    }

    /// Set a block's successor edges.
    pub fn set_successors(&mut self, block: BlockId, successors: impl IntoIterator<Item = BlockId>) {
        self.blocks[block.index()].successors = successors.into_iter().collect();
    }

    /// Get a block by id.
    pub fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id.index()]
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Iterate over all blocks.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &BlockData)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (BlockId::new(i as u32), b))
    }

    /// Compute predecessors for all blocks, indexed by block.
    pub fn predecessors(&self) -> Vec<SmallVec<[BlockId; 2]>> {
        let mut preds: Vec<SmallVec<[BlockId; 2]>> = vec![SmallVec::new(); self.blocks.len()];
        for (id, block) in self.blocks() {
            for &succ in &block.successors {
                preds[succ.index()].push(id);
            }
        }
        preds
    }

    /// Get blocks in reverse postorder from the entry.
    ///
    /// Unreachable blocks are omitted; the driver never visits them.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut postorder = Vec::with_capacity(self.blocks.len());

        fn visit(graph: &Graph, bb: BlockId, visited: &mut [bool], postorder: &mut Vec<BlockId>) {
            if visited[bb.index()] {
                return;
            }
            visited[bb.index()] = true;
            for &succ in &graph.blocks[bb.index()].successors {
                visit(graph, succ, visited, postorder);
            }
            postorder.push(bb);
        }

        if !self.blocks.is_empty() {
            visit(self, BlockId::ENTRY, &mut visited, &mut postorder);
        }
        postorder.reverse();
        postorder
    }
}
