//! The fixpoint driver.
//!
//! Walks the CFG in reverse postorder, carrying a [`BlockState`] through
//! each block: cloned from a lone predecessor, merged where paths join.
//! Loop headers are revisited - the whole graph is re-walked - until the
//! freshly merged header state and the one the previous round ran with
//! test equivalent, with a bounded-iteration safety valve that degrades
//! precision (never soundness) when a pathological loop refuses to settle.
//!
//! ## Per-op behavior
//!
//! - `Allocate` starts tracking the site as a virtual object.
//! - `Read` of a virtual object is answered from its tracked scalars; a
//!   read of a real object consults the read cache, and on a miss records
//!   its own result so the next read of the same key is eliminated.
//! - `Write` to a virtual object updates the tracked scalar in place; a
//!   real write invalidates everything it could alias, then records the
//!   written value (newest write wins).
//! - `Call` materializes arguments that are still virtual and drops every
//!   cached read (opaque side effects). `Barrier` only drops the cache.
//! - `Escape` materializes its operand's object.
//! - `Check` reports the operand's current classification.
//!
//! The driver never builds or rewrites IR. It returns an
//! [`AnalysisResults`]: a substitution per eliminated read, a
//! classification per allocation site, and summary counters. A consumer
//! that abandons the analysis must treat every site it has no conclusion
//! for as materialized.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::ea::cache::WHOLE_ACCESS;
use crate::ea::state::BlockState;
use crate::error::{AnalysisError, AnalysisResult};
use crate::ids::{BlockId, NodeId, ObjectId};
use crate::ir::{Graph, ObjectLayout, Op};
use crate::kind::ValueKind;
use crate::location::LocationIdentity;

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for one analysis run.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Full-graph rounds before loop states are poisoned and the run
    /// finishes with a degraded (still sound) result.
    pub max_loop_iterations: usize,
    /// When false, only scalar replacement runs; real reads are neither
    /// cached nor eliminated.
    pub read_elimination: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: 10,
            read_elimination: true,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Final fate of one allocation site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The allocation never happens; its entries live as scalars.
    Virtualized,
    /// The allocation is (or becomes) a real heap object.
    Materialized,
}

/// Summary counters for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisStats {
    /// Reads answered from tracked scalars or the read cache.
    pub eliminated_reads: usize,
    /// Sites that stayed virtual everywhere.
    pub virtualized: usize,
    /// Sites that escaped somewhere.
    pub materialized: usize,
    /// Full-graph rounds run.
    pub passes: usize,
    /// True when the iteration bound fired and loop precision was dropped.
    pub degraded: bool,
}

/// What the analysis concluded; consumed by the rewrite phase.
#[derive(Debug, Clone, Default)]
pub struct AnalysisResults {
    substitutions: FxHashMap<NodeId, NodeId>,
    classifications: FxHashMap<ObjectId, Classification>,
    checks: Vec<(NodeId, Classification)>,
    /// Summary counters.
    pub stats: AnalysisStats,
}

impl AnalysisResults {
    /// The value a read's result can be replaced with, if the read was
    /// eliminated. `None` means the memory access stays.
    pub fn substitution(&self, read: NodeId) -> Option<NodeId> {
        self.substitutions.get(&read).copied()
    }

    /// Iterate over all (read result, replacement) pairs.
    pub fn substitutions(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.substitutions.iter().map(|(&r, &v)| (r, v))
    }

    /// The fate of an allocation site. `None` when the site was never
    /// reached; a consumer must then keep the real allocation.
    pub fn classification(&self, object: ObjectId) -> Option<Classification> {
        self.classifications.get(&object).copied()
    }

    /// Check if a site was proven safe to keep virtual.
    pub fn is_virtualized(&self, object: ObjectId) -> bool {
        self.classification(object) == Some(Classification::Virtualized)
    }

    /// Classifications reported at `Check` ops, in op order.
    pub fn checks(&self) -> &[(NodeId, Classification)] {
        &self.checks
    }

    fn note_materialized(&mut self, object: ObjectId) {
        self.classifications
            .insert(object, Classification::Materialized);
    }
}

// ============================================================================
// Analyzer
// ============================================================================

/// How a field/element access maps onto a virtual object's entries.
enum SlotAccess {
    /// Entry `0..entry_count` answers the access.
    Tracked(usize),
    /// The scalars cannot answer (dynamic index, width-mismatched reuse,
    /// unknown offset); the object must materialize.
    Opaque,
}

/// The partial escape analysis with read elimination pass.
///
/// One analyzer is reusable across methods; all per-run state lives on
/// the stack of [`PartialEscapeAnalyzer::analyze`].
#[derive(Debug, Default)]
pub struct PartialEscapeAnalyzer {
    config: AnalyzerConfig,
}

impl PartialEscapeAnalyzer {
    /// Create an analyzer with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an analyzer with the given configuration.
    pub fn with_config(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Analyze one method graph.
    ///
    /// Errors mean the op stream violated an invariant an earlier phase
    /// was supposed to guarantee; the caller must abandon optimization of
    /// this method and keep the unoptimized path.
    pub fn analyze(&self, graph: &Graph) -> AnalysisResult<AnalysisResults> {
        if graph.block_count() == 0 {
            return Ok(AnalysisResults::default());
        }

        let rpo = graph.reverse_postorder();
        let mut rpo_pos = vec![usize::MAX; graph.block_count()];
        for (i, &block) in rpo.iter().enumerate() {
            rpo_pos[block.index()] = i;
        }
        let preds = graph.predecessors();

        // A block is a loop header if some reachable predecessor sits at
        // or after it in the order - a back edge.
        let mut headers: FxHashSet<BlockId> = FxHashSet::default();
        for &block in &rpo {
            let is_header = preds[block.index()].iter().any(|p| {
                rpo_pos[p.index()] != usize::MAX && rpo_pos[p.index()] >= rpo_pos[block.index()]
            });
            if is_header {
                headers.insert(block);
            }
        }

        let mut candidates: FxHashMap<BlockId, BlockState> = FxHashMap::default();
        let mut degraded = false;

        let mut pass: usize = 0;
        loop {
            pass += 1;
            let mut results = AnalysisResults::default();
            let mut outs: Vec<Option<BlockState>> = vec![None; graph.block_count()];

            for &block in &rpo {
                let mut state = entry_state(
                    block,
                    &headers,
                    &rpo_pos,
                    &preds,
                    &outs,
                    &mut candidates,
                );
                for op in &graph.block(block).ops {
                    self.process_op(op, &mut state, graph, &mut results)?;
                }
                outs[block.index()] = Some(state);
            }

            // Re-merge every header from the full predecessor set and
            // test convergence: the state this round ran with must hold
            // no fact the fresh merge lost.
            let mut stable = true;
            for &header in rpo.iter().filter(|b| headers.contains(b)) {
                let merged = merge_preds(header, &preds, &rpo_pos, &outs);
                let converged = candidates
                    .get(&header)
                    .is_some_and(|candidate| candidate.equivalent_to(&merged));
                if !converged {
                    trace!(block = %header, "loop header not yet stable");
                    stable = false;
                }
                candidates.insert(header, merged);
            }

            if stable || degraded {
                results.stats.passes = pass;
                results.stats.degraded = degraded;
                finalize(&mut results, &outs);
                debug!(
                    passes = results.stats.passes,
                    virtualized = results.stats.virtualized,
                    materialized = results.stats.materialized,
                    eliminated_reads = results.stats.eliminated_reads,
                    degraded = results.stats.degraded,
                    "analysis finished"
                );
                return Ok(results);
            }

            if pass >= self.config.max_loop_iterations {
                // Safety valve: drop loop precision and settle in one
                // more round. Poisoned states are bottom-precision and
                // therefore sound whatever the loop does.
                debug!(pass, "iteration bound hit; poisoning loop states");
                degraded = true;
                for candidate in candidates.values_mut() {
                    candidate.poison();
                }
            }
        }
    }

    fn process_op(
        &self,
        op: &Op,
        state: &mut BlockState,
        graph: &Graph,
        results: &mut AnalysisResults,
    ) -> AnalysisResult<()> {
        match op {
            Op::Allocate {
                result,
                object,
                values,
            } => self.process_allocate(state, graph, results, *result, *object, values),
            Op::Read {
                result,
                object,
                location,
                index,
                kind,
            } => self.process_read(state, graph, results, *result, *object, *location, *index, *kind),
            Op::Write {
                object,
                location,
                index,
                kind,
                value,
            } => self.process_write(state, graph, results, *object, *location, *index, *kind, *value),
            Op::Call { args } => {
                for &arg in args {
                    if let Some(object) = state.objects.virtual_object(arg) {
                        trace!(object = %object, "argument escapes into call");
                        for demoted in state.materialize(object, graph) {
                            results.note_materialized(demoted);
                        }
                    }
                }
                state.kill_reads();
                Ok(())
            }
            Op::Barrier => {
                state.kill_reads();
                Ok(())
            }
            Op::Escape { value } => {
                if let Some(object) = state.objects.virtual_object(*value) {
                    trace!(object = %object, "value escapes");
                    for demoted in state.materialize(object, graph) {
                        results.note_materialized(demoted);
                    }
                }
                Ok(())
            }
            Op::Check { value } => {
                let class = if state.objects.virtual_object(*value).is_some() {
                    Classification::Virtualized
                } else {
                    Classification::Materialized
                };
                results.checks.push((*value, class));
                Ok(())
            }
        }
    }

    fn process_allocate(
        &self,
        state: &mut BlockState,
        graph: &Graph,
        results: &mut AnalysisResults,
        result: NodeId,
        object: ObjectId,
        values: &SmallVec<[NodeId; 4]>,
    ) -> AnalysisResult<()> {
        let layout = graph
            .layouts
            .get(object)
            .ok_or(AnalysisError::UnknownObject {
                object,
                alloc: result,
            })?;
        if values.len() != layout.entry_count() {
            return Err(AnalysisError::EntryCountMismatch {
                object,
                expected: layout.entry_count(),
                got: values.len(),
            });
        }

        if state.objects.get(object).is_some() {
            // The site re-entered while its previous incarnation is still
            // tracked (loop-carried object). Per-iteration identities are
            // not representable in a per-site classification, so the site
            // stays real: demote whatever is left and wipe the cache,
            // which may still mention the allocation node.
            trace!(object = %object, "allocation site re-entered; keeping it real");
            state.objects.demote(object);
            state.kill_reads();
            results.note_materialized(object);
            return Ok(());
        }

        let entries: SmallVec<[NodeId; 4]> = values
            .iter()
            .map(|&value| state.objects.resolve(value))
            .collect();
        state.objects.add_object(object, result, entries);
        trace!(object = %object, node = %result, "allocation virtualized");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_read(
        &self,
        state: &mut BlockState,
        graph: &Graph,
        results: &mut AnalysisResults,
        result: NodeId,
        object: NodeId,
        location: LocationIdentity,
        index: i32,
        kind: ValueKind,
    ) -> AnalysisResult<()> {
        let container = state.objects.resolve(object);
        if let Some(object_id) = state.objects.virtual_object(container) {
            match self.virtual_slot(graph, object_id, container, location, index, kind)? {
                SlotAccess::Tracked(slot) => {
                    let Some(value) = state.objects.entry(object_id, slot) else {
                        return Err(AnalysisError::LayoutShapeMismatch { object: object_id });
                    };
                    trace!(read = %result, value = %value, "read answered from virtual entries");
                    results.substitutions.insert(result, value);
                    results.stats.eliminated_reads += 1;
                    state.objects.add_scalar_alias(result, value);
                    return Ok(());
                }
                SlotAccess::Opaque => {
                    for demoted in state.materialize(object_id, graph) {
                        results.note_materialized(demoted);
                    }
                }
            }
        }

        if !self.config.read_elimination || !location.is_single() {
            return Ok(());
        }
        let container = state.objects.resolve(object);
        match state
            .cache
            .query(&state.objects, container, location, index, kind)
        {
            Some(value) => {
                trace!(read = %result, value = %value, "read answered from cache");
                results.substitutions.insert(result, value);
                results.stats.eliminated_reads += 1;
                state.objects.add_scalar_alias(result, value);
            }
            None => {
                state
                    .cache
                    .record(&state.objects, container, location, index, kind, result);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_write(
        &self,
        state: &mut BlockState,
        graph: &Graph,
        results: &mut AnalysisResults,
        object: NodeId,
        location: LocationIdentity,
        index: i32,
        kind: ValueKind,
        value: NodeId,
    ) -> AnalysisResult<()> {
        let container = state.objects.resolve(object);
        if let Some(object_id) = state.objects.virtual_object(container) {
            match self.virtual_slot(graph, object_id, container, location, index, kind)? {
                SlotAccess::Tracked(slot) => {
                    let canonical = state.objects.resolve(value);
                    state.objects.set_entry(object_id, slot, canonical);
                    trace!(object = %object_id, slot, value = %canonical, "virtual entry updated");
                    return Ok(());
                }
                SlotAccess::Opaque => {
                    for demoted in state.materialize(object_id, graph) {
                        results.note_materialized(demoted);
                    }
                }
            }
        }

        if !location.is_single() {
            // No disjointness can be proven against an unknown offset.
            state.kill_reads();
            return Ok(());
        }
        state.kill_reads_at(location, index);
        if self.config.read_elimination {
            let container = state.objects.resolve(object);
            state
                .cache
                .record(&state.objects, container, location, index, kind, value);
        }
        Ok(())
    }

    /// Map an access against a virtual object onto its entries.
    fn virtual_slot(
        &self,
        graph: &Graph,
        object: ObjectId,
        container: NodeId,
        location: LocationIdentity,
        index: i32,
        kind: ValueKind,
    ) -> AnalysisResult<SlotAccess> {
        let layout = graph
            .layouts
            .get(object)
            .ok_or(AnalysisError::UnknownObject {
                object,
                alloc: container,
            })?;
        match (layout, location) {
            (ObjectLayout::Instance { fields }, LocationIdentity::Field(field)) => {
                if index != WHOLE_ACCESS {
                    return Err(AnalysisError::LayoutShapeMismatch { object });
                }
                let Some(slot) = fields.iter().position(|&f| f == field) else {
                    return Err(AnalysisError::UnknownField { object, field });
                };
                if graph.fields.kind(field) == kind {
                    Ok(SlotAccess::Tracked(slot))
                } else {
                    // Width-mismatched reuse of a slot; scalars track one
                    // kind per entry.
                    Ok(SlotAccess::Opaque)
                }
            }
            (ObjectLayout::Array { kind: element, length }, LocationIdentity::ArrayElement(family)) => {
                if family != *element || kind != *element {
                    return Ok(SlotAccess::Opaque);
                }
                if index == WHOLE_ACCESS || index < 0 || index as u32 >= *length {
                    // Dynamic or out-of-range index: the target slot is
                    // unknown at compile time.
                    return Ok(SlotAccess::Opaque);
                }
                Ok(SlotAccess::Tracked(index as usize))
            }
            (_, LocationIdentity::Any) => Ok(SlotAccess::Opaque),
            _ => Err(AnalysisError::LayoutShapeMismatch { object }),
        }
    }
}

/// Compute a block's incoming state for one round.
fn entry_state(
    block: BlockId,
    headers: &FxHashSet<BlockId>,
    rpo_pos: &[usize],
    preds: &[SmallVec<[BlockId; 2]>],
    outs: &[Option<BlockState>],
    candidates: &mut FxHashMap<BlockId, BlockState>,
) -> BlockState {
    if headers.contains(&block) {
        if let Some(candidate) = candidates.get(&block) {
            return candidate.clone();
        }
        // First round: only the forward edges exist yet.
        let forward: Vec<&BlockState> = preds[block.index()]
            .iter()
            .filter(|p| rpo_pos[p.index()] != usize::MAX && rpo_pos[p.index()] < rpo_pos[block.index()])
            .filter_map(|p| outs[p.index()].as_ref())
            .collect();
        let initial = if block == BlockId::ENTRY {
            // The external entry edge carries the empty state, which as
            // the top of the lattice absorbs every forward fact.
            BlockState::new()
        } else {
            BlockState::merge(&forward)
        };
        candidates.insert(block, initial.clone());
        return initial;
    }
    if block == BlockId::ENTRY {
        return BlockState::new();
    }
    let incoming: Vec<&BlockState> = preds[block.index()]
        .iter()
        .filter(|p| rpo_pos[p.index()] != usize::MAX)
        .filter_map(|p| outs[p.index()].as_ref())
        .collect();
    BlockState::merge(&incoming)
}

/// Merge every reachable predecessor of a loop header, plus the external
/// empty edge when the header is the entry block.
fn merge_preds(
    header: BlockId,
    preds: &[SmallVec<[BlockId; 2]>],
    rpo_pos: &[usize],
    outs: &[Option<BlockState>],
) -> BlockState {
    let empty = BlockState::new();
    let mut incoming: Vec<&BlockState> = Vec::new();
    if header == BlockId::ENTRY {
        incoming.push(&empty);
    }
    incoming.extend(
        preds[header.index()]
            .iter()
            .filter(|p| rpo_pos[p.index()] != usize::MAX)
            .filter_map(|p| outs[p.index()].as_ref()),
    );
    BlockState::merge(&incoming)
}

/// Fill classifications and counters from the final round's block states.
fn finalize(results: &mut AnalysisResults, outs: &[Option<BlockState>]) {
    for out in outs.iter().flatten() {
        for (object, state) in out.objects.iter() {
            if state.is_virtual() {
                results
                    .classifications
                    .entry(object)
                    .or_insert(Classification::Virtualized);
            } else {
                results.note_materialized(object);
            }
        }
    }
    results.stats.virtualized = results
        .classifications
        .values()
        .filter(|&&c| c == Classification::Virtualized)
        .count();
    results.stats.materialized = results
        .classifications
        .values()
        .filter(|&&c| c == Classification::Materialized)
        .count();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::FieldId;
    use smallvec::smallvec;

    /// fn-under-test scaffolding: one instance layout with an i32 `f`
    /// and a ref `g`.
    struct Scaffold {
        graph: Graph,
        f: FieldId,
        g: FieldId,
        object: ObjectId,
    }

    fn scaffold() -> Scaffold {
        let mut graph = Graph::new();
        let f = graph.fields.add("f", ValueKind::I32);
        let g = graph.fields.add("g", ValueKind::Ref);
        let object = graph.layouts.add(ObjectLayout::Instance {
            fields: smallvec![f, g],
        });
        Scaffold { graph, f, g, object }
    }

    fn field(id: FieldId) -> LocationIdentity {
        LocationIdentity::Field(id)
    }

    #[test]
    fn test_empty_graph() {
        let graph = Graph::new();
        let results = PartialEscapeAnalyzer::new().analyze(&graph).unwrap();
        assert_eq!(results.stats.eliminated_reads, 0);
        assert_eq!(results.stats.passes, 0);
    }

    #[test]
    fn test_virtual_read_is_scalar_replaced() {
        let mut s = scaffold();
        let b0 = s.graph.add_block();
        let init = s.graph.new_node();
        let alloc = s.graph.new_node();
        let read = s.graph.new_node();

        s.graph.push_op(b0, Op::Allocate {
            result: alloc,
            object: s.object,
            values: smallvec![init, init],
        });
        s.graph.push_op(b0, Op::Read {
            result: read,
            object: alloc,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });

        let results = PartialEscapeAnalyzer::new().analyze(&s.graph).unwrap();
        assert_eq!(results.substitution(read), Some(init));
        assert!(results.is_virtualized(s.object));
        assert_eq!(results.stats.eliminated_reads, 1);
    }

    #[test]
    fn test_virtual_write_then_read() {
        let mut s = scaffold();
        let b0 = s.graph.add_block();
        let init = s.graph.new_node();
        let alloc = s.graph.new_node();
        let stored = s.graph.new_node();
        let read = s.graph.new_node();

        s.graph.push_op(b0, Op::Allocate {
            result: alloc,
            object: s.object,
            values: smallvec![init, init],
        });
        s.graph.push_op(b0, Op::Write {
            object: alloc,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
            value: stored,
        });
        s.graph.push_op(b0, Op::Read {
            result: read,
            object: alloc,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });

        let results = PartialEscapeAnalyzer::new().analyze(&s.graph).unwrap();
        assert_eq!(results.substitution(read), Some(stored));
        assert!(results.is_virtualized(s.object));
    }

    #[test]
    fn test_escape_materializes_and_seeds_cache() {
        let mut s = scaffold();
        let b0 = s.graph.add_block();
        let init = s.graph.new_node();
        let alloc = s.graph.new_node();
        let read = s.graph.new_node();

        s.graph.push_op(b0, Op::Allocate {
            result: alloc,
            object: s.object,
            values: smallvec![init, init],
        });
        s.graph.push_op(b0, Op::Escape { value: alloc });
        s.graph.push_op(b0, Op::Read {
            result: read,
            object: alloc,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });

        let results = PartialEscapeAnalyzer::new().analyze(&s.graph).unwrap();
        // The object escaped, but the seeded cache still answers the read.
        assert_eq!(results.classification(s.object), Some(Classification::Materialized));
        assert_eq!(results.substitution(read), Some(init));
    }

    #[test]
    fn test_call_kills_seeded_entries() {
        let mut s = scaffold();
        let b0 = s.graph.add_block();
        let init = s.graph.new_node();
        let alloc = s.graph.new_node();
        let read = s.graph.new_node();

        s.graph.push_op(b0, Op::Allocate {
            result: alloc,
            object: s.object,
            values: smallvec![init, init],
        });
        // The call both materializes the argument and clobbers memory.
        s.graph.push_op(b0, Op::Call {
            args: smallvec![alloc],
        });
        s.graph.push_op(b0, Op::Read {
            result: read,
            object: alloc,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });

        let results = PartialEscapeAnalyzer::new().analyze(&s.graph).unwrap();
        assert_eq!(results.classification(s.object), Some(Classification::Materialized));
        assert_eq!(results.substitution(read), None);
    }

    #[test]
    fn test_read_after_read_elimination() {
        let mut s = scaffold();
        let b0 = s.graph.add_block();
        let unknown = s.graph.new_node();
        let first = s.graph.new_node();
        let second = s.graph.new_node();

        for result in [first, second] {
            s.graph.push_op(b0, Op::Read {
                result,
                object: unknown,
                location: field(s.f),
                index: WHOLE_ACCESS,
                kind: ValueKind::I32,
            });
        }

        let results = PartialEscapeAnalyzer::new().analyze(&s.graph).unwrap();
        assert_eq!(results.substitution(first), None);
        assert_eq!(results.substitution(second), Some(first));
    }

    #[test]
    fn test_read_elimination_can_be_disabled() {
        let mut s = scaffold();
        let b0 = s.graph.add_block();
        let unknown = s.graph.new_node();
        let first = s.graph.new_node();
        let second = s.graph.new_node();

        for result in [first, second] {
            s.graph.push_op(b0, Op::Read {
                result,
                object: unknown,
                location: field(s.f),
                index: WHOLE_ACCESS,
                kind: ValueKind::I32,
            });
        }

        let analyzer = PartialEscapeAnalyzer::with_config(AnalyzerConfig {
            read_elimination: false,
            ..AnalyzerConfig::default()
        });
        let results = analyzer.analyze(&s.graph).unwrap();
        assert_eq!(results.substitution(second), None);
        assert_eq!(results.stats.eliminated_reads, 0);
    }

    #[test]
    fn test_write_under_any_identity_kills_cache() {
        let mut s = scaffold();
        let b0 = s.graph.add_block();
        let unknown = s.graph.new_node();
        let other = s.graph.new_node();
        let value = s.graph.new_node();
        let first = s.graph.new_node();
        let second = s.graph.new_node();

        s.graph.push_op(b0, Op::Read {
            result: first,
            object: unknown,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });
        s.graph.push_op(b0, Op::Write {
            object: other,
            location: LocationIdentity::Any,
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
            value,
        });
        s.graph.push_op(b0, Op::Read {
            result: second,
            object: unknown,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });

        let results = PartialEscapeAnalyzer::new().analyze(&s.graph).unwrap();
        assert_eq!(results.substitution(second), None);
    }

    #[test]
    fn test_unknown_field_is_an_error() {
        let mut s = scaffold();
        let stray = s.graph.fields.add("stray", ValueKind::I32);
        let b0 = s.graph.add_block();
        let init = s.graph.new_node();
        let alloc = s.graph.new_node();
        let read = s.graph.new_node();

        s.graph.push_op(b0, Op::Allocate {
            result: alloc,
            object: s.object,
            values: smallvec![init, init],
        });
        s.graph.push_op(b0, Op::Read {
            result: read,
            object: alloc,
            location: field(stray),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });

        let err = PartialEscapeAnalyzer::new().analyze(&s.graph).unwrap_err();
        assert_eq!(err, AnalysisError::UnknownField {
            object: s.object,
            field: stray,
        });
    }

    #[test]
    fn test_entry_count_mismatch_is_an_error() {
        let mut s = scaffold();
        let b0 = s.graph.add_block();
        let init = s.graph.new_node();
        let alloc = s.graph.new_node();

        s.graph.push_op(b0, Op::Allocate {
            result: alloc,
            object: s.object,
            values: smallvec![init],
        });

        let err = PartialEscapeAnalyzer::new().analyze(&s.graph).unwrap_err();
        assert!(matches!(err, AnalysisError::EntryCountMismatch { .. }));
    }

    #[test]
    fn test_check_reports_classification_transitions() {
        let mut s = scaffold();
        let b0 = s.graph.add_block();
        let init = s.graph.new_node();
        let alloc = s.graph.new_node();

        s.graph.push_op(b0, Op::Allocate {
            result: alloc,
            object: s.object,
            values: smallvec![init, init],
        });
        s.graph.push_op(b0, Op::Check { value: alloc });
        s.graph.push_op(b0, Op::Escape { value: alloc });
        s.graph.push_op(b0, Op::Check { value: alloc });

        let results = PartialEscapeAnalyzer::new().analyze(&s.graph).unwrap();
        assert_eq!(results.checks(), &[
            (alloc, Classification::Virtualized),
            (alloc, Classification::Materialized),
        ]);
    }

    #[test]
    fn test_merge_keeps_only_common_entries() {
        // b0 -> {b1, b2} -> b3; only b1 caches g, both cache f.
        let mut s = scaffold();
        let b0 = s.graph.add_block();
        let b1 = s.graph.add_block();
        let b2 = s.graph.add_block();
        let b3 = s.graph.add_block();
        s.graph.set_successors(b0, [b1, b2]);
        s.graph.set_successors(b1, [b3]);
        s.graph.set_successors(b2, [b3]);

        let unknown = s.graph.new_node();
        let f0 = s.graph.new_node();
        let f1 = s.graph.new_node();
        let f2 = s.graph.new_node();
        let g1 = s.graph.new_node();
        let f3 = s.graph.new_node();
        let g3 = s.graph.new_node();

        s.graph.push_op(b0, Op::Read {
            result: f0,
            object: unknown,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });
        for (block, result) in [(b1, f1), (b2, f2)] {
            s.graph.push_op(block, Op::Read {
                result,
                object: unknown,
                location: field(s.f),
                index: WHOLE_ACCESS,
                kind: ValueKind::I32,
            });
        }
        s.graph.push_op(b1, Op::Read {
            result: g1,
            object: unknown,
            location: field(s.g),
            index: WHOLE_ACCESS,
            kind: ValueKind::Ref,
        });
        s.graph.push_op(b3, Op::Read {
            result: f3,
            object: unknown,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });
        s.graph.push_op(b3, Op::Read {
            result: g3,
            object: unknown,
            location: field(s.g),
            index: WHOLE_ACCESS,
            kind: ValueKind::Ref,
        });

        let results = PartialEscapeAnalyzer::new().analyze(&s.graph).unwrap();
        // f survived both paths (same origin read in b0); g was only
        // cached on one path and must be re-read at the join.
        assert_eq!(results.substitution(f3), Some(f0));
        assert_eq!(results.substitution(g3), None);
    }

    #[test]
    fn test_loop_invariant_read_stays_eliminated() {
        // b0 -> b1 (header) -> {b1, b2}; the loop body rereads a field it
        // never writes.
        let mut s = scaffold();
        let b0 = s.graph.add_block();
        let b1 = s.graph.add_block();
        let b2 = s.graph.add_block();
        s.graph.set_successors(b0, [b1]);
        s.graph.set_successors(b1, [b1, b2]);

        let unknown = s.graph.new_node();
        let before = s.graph.new_node();
        let inside = s.graph.new_node();

        s.graph.push_op(b0, Op::Read {
            result: before,
            object: unknown,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });
        s.graph.push_op(b1, Op::Read {
            result: inside,
            object: unknown,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });

        let results = PartialEscapeAnalyzer::new().analyze(&s.graph).unwrap();
        assert_eq!(results.substitution(inside), Some(before));
    }

    #[test]
    fn test_loop_varying_read_is_not_eliminated() {
        // Same shape, but the body writes the field after reading it, so
        // the cached value is not loop-invariant.
        let mut s = scaffold();
        let b0 = s.graph.add_block();
        let b1 = s.graph.add_block();
        let b2 = s.graph.add_block();
        s.graph.set_successors(b0, [b1]);
        s.graph.set_successors(b1, [b1, b2]);

        let unknown = s.graph.new_node();
        let fresh = s.graph.new_node();
        let before = s.graph.new_node();
        let inside = s.graph.new_node();

        s.graph.push_op(b0, Op::Read {
            result: before,
            object: unknown,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });
        s.graph.push_op(b1, Op::Read {
            result: inside,
            object: unknown,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });
        s.graph.push_op(b1, Op::Write {
            object: unknown,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
            value: fresh,
        });

        let results = PartialEscapeAnalyzer::new().analyze(&s.graph).unwrap();
        assert_eq!(results.substitution(inside), None);
    }

    #[test]
    fn test_iteration_bound_degrades_but_finishes() {
        // A loop whose body writes the field after reading it needs a
        // second round to settle; a bound of one forces the safety valve.
        let mut s = scaffold();
        let b0 = s.graph.add_block();
        let b1 = s.graph.add_block();
        let b2 = s.graph.add_block();
        s.graph.set_successors(b0, [b1]);
        s.graph.set_successors(b1, [b1, b2]);

        let unknown = s.graph.new_node();
        let fresh = s.graph.new_node();
        let before = s.graph.new_node();
        let inside = s.graph.new_node();

        s.graph.push_op(b0, Op::Read {
            result: before,
            object: unknown,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });
        s.graph.push_op(b1, Op::Read {
            result: inside,
            object: unknown,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });
        s.graph.push_op(b1, Op::Write {
            object: unknown,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
            value: fresh,
        });

        let analyzer = PartialEscapeAnalyzer::with_config(AnalyzerConfig {
            max_loop_iterations: 1,
            ..AnalyzerConfig::default()
        });
        let results = analyzer.analyze(&s.graph).unwrap();
        assert!(results.stats.degraded);
        assert_eq!(results.substitution(inside), None);
    }

    #[test]
    fn test_allocation_inside_loop_stays_virtual_per_iteration() {
        let mut s = scaffold();
        let b0 = s.graph.add_block();
        let b1 = s.graph.add_block();
        let b2 = s.graph.add_block();
        s.graph.set_successors(b0, [b1]);
        s.graph.set_successors(b1, [b1, b2]);

        let init = s.graph.new_node();
        let alloc = s.graph.new_node();
        let read = s.graph.new_node();

        s.graph.push_op(b1, Op::Allocate {
            result: alloc,
            object: s.object,
            values: smallvec![init, init],
        });
        s.graph.push_op(b1, Op::Read {
            result: read,
            object: alloc,
            location: field(s.f),
            index: WHOLE_ACCESS,
            kind: ValueKind::I32,
        });

        let results = PartialEscapeAnalyzer::new().analyze(&s.graph).unwrap();
        assert_eq!(results.substitution(read), Some(init));
        assert!(results.is_virtualized(s.object));
    }
}
