//! The per-block read cache.
//!
//! Maps "the value last read from this location" to the node holding that
//! value. A hit lets the rewrite phase drop the memory access entirely; a
//! miss is an ordinary outcome and the read stays.
//!
//! ## Keys
//!
//! A [`CacheKey`] is (location identity, container node, element index,
//! value kind). The container is compared by node identity - a virtual
//! object and its materialized form meet through [`ObjectStates::resolve`]
//! before the key is built, never through structural equality. Index `-1`
//! ([`WHOLE_ACCESS`]) denotes a whole-field access and wildcard-matches
//! any concrete index during invalidation. The kind keeps reads of
//! different widths at one nominal slot apart.
//!
//! ## Canonical values
//!
//! Both sides of every entry pass through the resolver when stored, and
//! the value is resolved *again* when queried: a value cached while its
//! referent was still virtual must come back as the materialized node once
//! that referent escapes. Storing or returning an unresolved node is the
//! single largest source of unsoundness in this pass.

use std::fmt;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::ea::objects::ObjectStates;
use crate::ids::NodeId;
use crate::kind::ValueKind;
use crate::location::LocationIdentity;

/// Element index denoting a whole-field (non-array) access.
///
/// During invalidation this value wildcard-matches any concrete index, on
/// either side: an unknown index may alias any element.
pub const WHOLE_ACCESS: i32 = -1;

/// Identifies the value last read from one location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// The aliasing family of the access.
    pub location: LocationIdentity,
    /// The container, canonical at construction time.
    pub object: NodeId,
    /// Element index, or [`WHOLE_ACCESS`].
    pub index: i32,
    /// Width/kind of the accessed value.
    pub kind: ValueKind,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index == WHOLE_ACCESS {
            write!(f, "{}:{}<{}>", self.object, self.kind, self.location)
        } else {
            write!(
                f,
                "{}[{}]:{}<{}>",
                self.object, self.index, self.kind, self.location
            )
        }
    }
}

/// The read cache of one block state.
///
/// Exclusively owned by its block state; flows to other blocks only by
/// copy, never by aliasing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadCache {
    entries: FxHashMap<CacheKey, NodeId>,
}

impl ReadCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the value last read from or written to a location.
    ///
    /// Container and value are canonicalized through `resolver` before the
    /// entry is built. Overwriting is valid - the newest access wins.
    ///
    /// Callers never record under a non-single identity: nothing cached
    /// under it could survive any later write.
    pub fn record(
        &mut self,
        resolver: &ObjectStates,
        object: NodeId,
        location: LocationIdentity,
        index: i32,
        kind: ValueKind,
        value: NodeId,
    ) {
        debug_assert!(location.is_single(), "recording under a non-single identity");
        let object = resolver.resolve(object);
        debug_assert!(
            resolver.virtual_object(object).is_none(),
            "read cache container must not be virtual"
        );
        let value = resolver.resolve(value);
        let key = CacheKey {
            location,
            object,
            index,
            kind,
        };
        trace!(key = %key, value = %value, "cache record");
        self.entries.insert(key, value);
    }

    /// Look up the cached value for a location, if any.
    ///
    /// The container is canonicalized before lookup and the stored value
    /// is canonicalized again before it is returned. `None` is a miss, not
    /// an error; the caller keeps the real memory read.
    pub fn query(
        &self,
        resolver: &ObjectStates,
        object: NodeId,
        location: LocationIdentity,
        index: i32,
        kind: ValueKind,
    ) -> Option<NodeId> {
        let object = resolver.resolve(object);
        let key = CacheKey {
            location,
            object,
            index,
            kind,
        };
        let value = *self.entries.get(&key)?;
        Some(resolver.resolve(value))
    }

    /// Drop every entry. The response to opaque side effects.
    pub fn invalidate_all(&mut self) {
        if !self.entries.is_empty() {
            trace!(dropped = self.entries.len(), "cache invalidate all");
            self.entries.clear();
        }
    }

    /// Drop every entry a write under `location`/`index` could alias.
    ///
    /// An entry survives only if its identity differs, or both indices are
    /// concrete and differ. A non-single identity can alias anything and
    /// forces a full invalidation.
    pub fn invalidate(&mut self, location: LocationIdentity, index: i32) {
        if !location.is_single() {
            self.invalidate_all();
            return;
        }
        self.entries.retain(|key, _| {
            key.location != location
                || (index != WHOLE_ACCESS && key.index != WHOLE_ACCESS && key.index != index)
        });
    }

    /// Check that every entry here is present in `other` with the same
    /// value. The read-cache half of block-state equivalence.
    pub fn is_submap_of(&self, other: &ReadCache) -> bool {
        self.entries
            .iter()
            .all(|(key, value)| other.entries.get(key) == Some(value))
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, NodeId)> {
        self.entries.iter().map(|(k, &v)| (k, v))
    }

    /// Raw lookup by key, without resolution. Used by the merge.
    pub fn get(&self, key: &CacheKey) -> Option<NodeId> {
        self.entries.get(key).copied()
    }

    /// Insert a pre-resolved entry. Used by the merge.
    pub(crate) fn insert_raw(&mut self, key: CacheKey, value: NodeId) {
        self.entries.insert(key, value);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
