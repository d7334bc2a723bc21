//! Per-block escape substate: object states and alias resolution.
//!
//! For every allocation site still of interest, a block state records an
//! [`ObjectState`]: either *virtual* (the allocation has not happened; its
//! entries are tracked as scalars) or *materialized* (the object is real,
//! denoted by its allocation node). Object records are addressed by
//! [`ObjectId`] through plain maps, so object graphs with cycles (a field
//! holding a reference back to its owner) need no shared mutation.
//!
//! The substate doubles as the alias resolver: every operand entering the
//! read cache, and every value leaving it, is canonicalized through
//! [`ObjectStates::resolve`] first. Skipping that step is the classic
//! unsoundness: a virtual reference cached verbatim diverges from the
//! materialized object the moment it escapes.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

use crate::ids::{NodeId, ObjectId};

/// The state of one allocation site on one control-flow path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectState {
    /// Not allocated; entries hold the scalar value of each layout slot.
    Virtual {
        /// The allocation node. Becomes the materialized representation
        /// if the object ever escapes.
        alloc: NodeId,
        /// One tracked scalar per layout entry.
        entries: SmallVec<[NodeId; 4]>,
    },
    /// Committed to a real allocation, denoted by `node`.
    Materialized { node: NodeId },
}

impl ObjectState {
    /// Check if the object is still virtual.
    pub fn is_virtual(&self) -> bool {
        matches!(self, ObjectState::Virtual { .. })
    }

    /// The node denoting the object once real: the allocation node.
    pub fn alloc_node(&self) -> NodeId {
        match self {
            ObjectState::Virtual { alloc, .. } => *alloc,
            ObjectState::Materialized { node } => *node,
        }
    }

    /// The materialized representation, if the object escaped.
    pub fn materialized_node(&self) -> Option<NodeId> {
        match self {
            ObjectState::Virtual { .. } => None,
            ObjectState::Materialized { node } => Some(*node),
        }
    }
}

/// The escape substate of one block state.
///
/// Holds the object records plus two alias maps: `aliases` connects value
/// nodes to the object they denote, `scalar_aliases` connects eliminated
/// read results to the canonical value they were replaced by.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStates {
    objects: FxHashMap<ObjectId, ObjectState>,
    aliases: FxHashMap<NodeId, ObjectId>,
    scalar_aliases: FxHashMap<NodeId, NodeId>,
}

impl ObjectStates {
    /// Create an empty substate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly allocated object as virtual.
    ///
    /// `alloc` is the allocation's result node; it becomes an alias of the
    /// object. Returns false if the site was already tracked on this path.
    pub fn add_object(
        &mut self,
        object: ObjectId,
        alloc: NodeId,
        entries: SmallVec<[NodeId; 4]>,
    ) -> bool {
        if self.objects.contains_key(&object) {
            return false;
        }
        self.objects.insert(object, ObjectState::Virtual { alloc, entries });
        self.aliases.insert(alloc, object);
        true
    }

    /// Look up the state of a tracked object.
    pub fn get(&self, object: ObjectId) -> Option<&ObjectState> {
        self.objects.get(&object)
    }

    /// The object a value denotes, if any, after scalar resolution.
    pub fn object_of(&self, value: NodeId) -> Option<ObjectId> {
        let value = self
            .scalar_aliases
            .get(&value)
            .copied()
            .unwrap_or(value);
        self.aliases.get(&value).copied()
    }

    /// The object a value denotes, if that object is still virtual.
    pub fn virtual_object(&self, value: NodeId) -> Option<ObjectId> {
        let object = self.object_of(value)?;
        self.objects.get(&object)?.is_virtual().then_some(object)
    }

    /// Canonicalize a value.
    ///
    /// Follows the scalar-alias link, then replaces a reference to a
    /// materialized object by its materialized representation. Idempotent:
    /// `resolve(resolve(x)) == resolve(x)`.
    pub fn resolve(&self, value: NodeId) -> NodeId {
        let value = self
            .scalar_aliases
            .get(&value)
            .copied()
            .unwrap_or(value);
        if let Some(object) = self.aliases.get(&value) {
            if let Some(ObjectState::Materialized { node }) = self.objects.get(object) {
                return *node;
            }
        }
        value
    }

    /// Record that `node` is a scalar alias of `canonical`.
    ///
    /// The canonical side is resolved before it is stored, keeping alias
    /// chains one link deep.
    pub fn add_scalar_alias(&mut self, node: NodeId, canonical: NodeId) {
        let canonical = self.resolve(canonical);
        if node != canonical {
            self.scalar_aliases.insert(node, canonical);
        }
    }

    /// The tracked scalar of one entry of a virtual object.
    pub fn entry(&self, object: ObjectId, index: usize) -> Option<NodeId> {
        match self.objects.get(&object)? {
            ObjectState::Virtual { entries, .. } => entries.get(index).copied(),
            ObjectState::Materialized { .. } => None,
        }
    }

    /// Overwrite one entry of a virtual object.
    ///
    /// Returns false if the object is not tracked virtual or the index is
    /// out of range.
    pub fn set_entry(&mut self, object: ObjectId, index: usize, value: NodeId) -> bool {
        match self.objects.get_mut(&object) {
            Some(ObjectState::Virtual { entries, .. }) => match entries.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    /// Demote a virtual object to materialized, returning its allocation
    /// node and the entries it tracked at that point.
    ///
    /// The caller is responsible for materializing entry values that are
    /// themselves virtual and for seeding the read cache; see
    /// `BlockState::materialize`.
    pub fn demote(&mut self, object: ObjectId) -> Option<(NodeId, SmallVec<[NodeId; 4]>)> {
        let (alloc, entries) = match self.objects.get_mut(&object) {
            Some(ObjectState::Virtual { alloc, entries }) => (*alloc, std::mem::take(entries)),
            _ => return None,
        };
        self.objects
            .insert(object, ObjectState::Materialized { node: alloc });
        trace!(object = %object, node = %alloc, "object materialized");
        Some((alloc, entries))
    }

    /// Iterate over tracked objects.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &ObjectState)> {
        self.objects.iter().map(|(&id, state)| (id, state))
    }

    /// Ids of all objects currently tracked virtual.
    pub fn virtual_ids(&self) -> Vec<ObjectId> {
        self.objects
            .iter()
            .filter(|(_, s)| s.is_virtual())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Structural equivalence of two substates.
    pub fn equivalent(&self, other: &ObjectStates) -> bool {
        self.objects == other.objects
            && self.aliases == other.aliases
            && self.scalar_aliases == other.scalar_aliases
    }

    /// Meet of the substates of several predecessors.
    ///
    /// An object survives only if every predecessor tracks it; if any two
    /// disagree (different entries, or virtual on one path and
    /// materialized on another) it is demoted to materialized at its
    /// allocation node - the representation-free stand-in for the phi
    /// nodes a rewriting pass would build. Alias links survive only where
    /// every predecessor agrees.
    pub fn merge(states: &[&ObjectStates]) -> ObjectStates {
        let (first, rest) = match states.split_first() {
            Some(split) => split,
            None => return ObjectStates::new(),
        };
        if rest.is_empty() {
            return (*first).clone();
        }

        let mut merged = ObjectStates::new();

        for (&object, state) in &first.objects {
            let mut agreed = Some(state);
            let mut present_everywhere = true;
            for other in rest {
                match other.objects.get(&object) {
                    Some(other_state) => {
                        if agreed.is_some_and(|s| s != other_state) {
                            agreed = None;
                        }
                    }
                    None => {
                        present_everywhere = false;
                        break;
                    }
                }
            }
            if !present_everywhere {
                continue;
            }
            match agreed {
                Some(state) => {
                    merged.objects.insert(object, state.clone());
                }
                None => {
                    trace!(object = %object, "object states diverge at merge; demoting");
                    merged
                        .objects
                        .insert(object, ObjectState::Materialized { node: state.alloc_node() });
                }
            }
        }

        for (&node, &object) in &first.aliases {
            if merged.objects.contains_key(&object)
                && rest.iter().all(|s| s.aliases.get(&node) == Some(&object))
            {
                merged.aliases.insert(node, object);
            }
        }

        for (&node, &canonical) in &first.scalar_aliases {
            if rest
                .iter()
                .all(|s| s.scalar_aliases.get(&node) == Some(&canonical))
            {
                merged.scalar_aliases.insert(node, canonical);
            }
        }

        merged
    }
}
