//! Per-block analysis state.
//!
//! A [`BlockState`] is the abstract state the driver carries through one
//! basic block: the escape substate (which allocations are still virtual,
//! what their entries hold, how values alias) plus the read cache. States
//! are created empty at the CFG entry, cloned into a lone successor,
//! merged where paths join, and dropped once no successor can still ask
//! for them.
//!
//! The merge is a meet in the lattice ordered by "more cache entries,
//! hence more precise": only facts every predecessor agrees on survive,
//! so iteration at loop headers can only ever shrink a state, which is
//! what bounds the fixpoint (see the driver).

use tracing::trace;

use crate::ea::cache::{ReadCache, WHOLE_ACCESS};
use crate::ea::objects::ObjectStates;
use crate::ids::ObjectId;
use crate::ir::{Graph, ObjectLayout};
use crate::location::LocationIdentity;

/// The abstract state at one point of one basic block.
#[derive(Debug, Clone, Default)]
pub struct BlockState {
    /// Escape substate and alias resolver.
    pub objects: ObjectStates,
    /// Memoized reads.
    pub cache: ReadCache,
}

impl BlockState {
    /// The empty state: nothing tracked, nothing cached. This is the top
    /// of the lattice - always sound, never precise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every cached read. The response to opaque side effects.
    pub fn kill_reads(&mut self) {
        self.cache.invalidate_all();
    }

    /// Drop cached reads a write under `location`/`index` could alias.
    pub fn kill_reads_at(&mut self, location: LocationIdentity, index: i32) {
        self.cache.invalidate(location, index);
    }

    /// Materialize an object, and transitively every still-virtual object
    /// its entries reference. Returns the ids demoted, in demotion order;
    /// empty if the value was already real.
    ///
    /// For each demoted instance object the read cache is seeded with one
    /// entry per field against the materialized node, so later reads of
    /// those fields hit the cache instead of re-reading memory the pass
    /// knows the contents of. Array objects seed nothing.
    pub fn materialize(&mut self, object: ObjectId, graph: &Graph) -> Vec<ObjectId> {
        let mut demoted = Vec::new();
        let mut worklist = vec![object];
        while let Some(object) = worklist.pop() {
            let Some((node, entries)) = self.objects.demote(object) else {
                continue;
            };
            demoted.push(object);
            for &entry in &entries {
                if let Some(nested) = self.objects.virtual_object(entry) {
                    worklist.push(nested);
                }
            }
            if let Some(ObjectLayout::Instance { fields }) = graph.layouts.get(object) {
                for (slot, &field) in fields.iter().enumerate() {
                    self.cache.record(
                        &self.objects,
                        node,
                        LocationIdentity::Field(field),
                        WHOLE_ACCESS,
                        graph.fields.kind(field),
                        entries[slot],
                    );
                }
            }
        }
        demoted
    }

    /// Degrade to the sound bottom-precision form: every cached read is
    /// dropped and every tracked object demoted, with no cache seeding.
    /// Used by the driver when the loop-iteration bound runs out.
    pub fn poison(&mut self) {
        self.cache.invalidate_all();
        for object in self.objects.virtual_ids() {
            self.objects.demote(object);
        }
    }

    /// Sound one-directional convergence test: true when this state holds
    /// no fact absent from `other`.
    ///
    /// The cache side is submap containment; the escape substate compares
    /// structurally. Deliberately asymmetric - under the driver's
    /// traversal order successive states at a header only ever shrink, so
    /// "the previous state is no more precise than the fresh one" is
    /// exactly convergence.
    pub fn equivalent_to(&self, other: &BlockState) -> bool {
        self.cache.is_submap_of(&other.cache) && self.objects.equivalent(&other.objects)
    }

    /// Meet of the states of all predecessors of a join block.
    ///
    /// The merged cache holds exactly the keys present in every input with
    /// an equal post-resolution value; everything else is dropped. The
    /// result never aliases any input's storage.
    pub fn merge(states: &[&BlockState]) -> BlockState {
        let (first, rest) = match states.split_first() {
            Some(split) => split,
            None => return BlockState::new(),
        };
        if rest.is_empty() {
            return (*first).clone();
        }

        let objects = ObjectStates::merge(
            &states.iter().map(|s| &s.objects).collect::<Vec<_>>(),
        );

        let mut cache = ReadCache::new();
        for (key, value) in first.cache.iter() {
            let canonical = first.objects.resolve(value);
            let agreed = rest.iter().all(|state| {
                state
                    .cache
                    .get(key)
                    .map(|v| state.objects.resolve(v))
                    == Some(canonical)
            });
            if agreed {
                cache.insert_raw(*key, canonical);
            } else {
                trace!(key = %key, "cache entry dropped at merge");
            }
        }

        BlockState { objects, cache }
    }
}
