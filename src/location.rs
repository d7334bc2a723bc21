//! Location identities.
//!
//! A [`LocationIdentity`] partitions memory accesses into non-aliasing
//! families: two accesses may alias only if their identities are equal, so
//! a write under one identity can never invalidate a value cached under a
//! provably distinct one.
//!
//! Three families exist:
//! - [`LocationIdentity::Field`] - one named instance field, any receiver
//! - [`LocationIdentity::ArrayElement`] - array slots of one element kind
//! - [`LocationIdentity::Any`] - no offset recorded; overlaps everything
//!
//! `Any` is the conservative identity for accesses whose offset the
//! front end could not recover. It is never eligible for fine-grained
//! invalidation: a write under `Any` wipes the whole read cache.

use std::fmt;

use string_interner::{DefaultStringInterner, DefaultSymbol};

use crate::ids::FieldId;
use crate::kind::ValueKind;

/// A token naming a family of memory locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocationIdentity {
    /// A named instance field, on any receiver object.
    Field(FieldId),
    /// Any array element of the given kind.
    ArrayElement(ValueKind),
    /// Unknown offset; may overlap any location.
    Any,
}

impl LocationIdentity {
    /// Check whether this identity names a single location family.
    ///
    /// Only single identities participate in fine-grained invalidation;
    /// a write under a non-single identity kills every cached entry.
    pub fn is_single(self) -> bool {
        !matches!(self, LocationIdentity::Any)
    }
}

impl fmt::Display for LocationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationIdentity::Field(field) => write!(f, "{field}"),
            LocationIdentity::ArrayElement(kind) => write!(f, "array[{kind}]"),
            LocationIdentity::Any => write!(f, "any"),
        }
    }
}

/// Per-field metadata: interned name and value kind.
#[derive(Debug, Clone, Copy)]
struct FieldInfo {
    name: DefaultSymbol,
    kind: ValueKind,
}

/// The method's field table.
///
/// Fields are registered once while the op stream is built; the analysis
/// only ever reads the table. Names are interned so repeated registration
/// of the same spelling stays cheap, but two distinct registrations are
/// two distinct fields even when their names collide (fields on different
/// types may share a name without aliasing).
#[derive(Debug, Clone, Default)]
pub struct FieldTable {
    interner: DefaultStringInterner,
    fields: Vec<FieldInfo>,
}

impl FieldTable {
    /// Create an empty field table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a field and return its id.
    pub fn add(&mut self, name: &str, kind: ValueKind) -> FieldId {
        let id = FieldId::new(self.fields.len() as u32);
        let name = self.interner.get_or_intern(name);
        self.fields.push(FieldInfo { name, kind });
        id
    }

    /// The declared kind of a field.
    pub fn kind(&self, field: FieldId) -> ValueKind {
        self.fields[field.index() as usize].kind
    }

    /// The name of a field.
    pub fn name(&self, field: FieldId) -> &str {
        self.interner
            .resolve(self.fields[field.index() as usize].name)
            .expect("field name was interned at registration")
    }

    /// Number of registered fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if no fields are registered.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_equality_partitions() {
        let mut table = FieldTable::new();
        let f = table.add("f", ValueKind::I32);
        let g = table.add("g", ValueKind::I32);

        assert_eq!(LocationIdentity::Field(f), LocationIdentity::Field(f));
        assert_ne!(LocationIdentity::Field(f), LocationIdentity::Field(g));
        assert_ne!(
            LocationIdentity::ArrayElement(ValueKind::I32),
            LocationIdentity::ArrayElement(ValueKind::I64)
        );
        assert_ne!(
            LocationIdentity::Field(f),
            LocationIdentity::ArrayElement(ValueKind::I32)
        );
    }

    #[test]
    fn test_any_is_not_single() {
        assert!(!LocationIdentity::Any.is_single());
        assert!(LocationIdentity::Field(FieldId::new(0)).is_single());
        assert!(LocationIdentity::ArrayElement(ValueKind::F64).is_single());
    }

    #[test]
    fn test_same_name_distinct_fields() {
        let mut table = FieldTable::new();
        let a = table.add("value", ValueKind::I32);
        let b = table.add("value", ValueKind::I32);

        assert_ne!(a, b);
        assert_eq!(table.name(a), table.name(b));
    }

    #[test]
    fn test_field_kind_lookup() {
        let mut table = FieldTable::new();
        let f = table.add("next", ValueKind::Ref);
        assert_eq!(table.kind(f), ValueKind::Ref);
        assert_eq!(table.name(f), "next");
        assert_eq!(table.len(), 1);
    }
}
