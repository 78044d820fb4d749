// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identity table: snapshot identities ↔ live references.
//!
//! One table serves both snapshot streams for the whole of a restore.
//! It only grows; an identity is bound at most once, and a live entity is
//! named by at most one identity.
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::FormatError;
use crate::ident::ObjectId;
use crate::runtime::{ObjRef, TypeRef};

/// What an identity is bound to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LiveRef {
    /// A type; references to the identity resolve to the type's mirror.
    Type(TypeRef),
    /// A heap object.
    Object(ObjRef),
}

/// Bidirectional identity map plus per-identity restore bookkeeping.
#[derive(Debug, Default)]
pub struct IdentityTable {
    forward: FxHashMap<ObjectId, LiveRef>,
    types: FxHashMap<TypeRef, ObjectId>,
    objects: FxHashMap<ObjRef, ObjectId>,
    preexisting: FxHashSet<ObjectId>,
    pending_fill: FxHashSet<ObjectId>,
}

impl IdentityTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `id` to `live`.
    ///
    /// Re-binding the same pair is a no-op. Binding either side to a
    /// different partner is [`FormatError::DuplicateIdentity`].
    pub fn insert(&mut self, id: ObjectId, live: LiveRef) -> Result<(), FormatError> {
        if id.is_null() {
            return Err(FormatError::CorruptRecord("null identity bound".into()));
        }
        if let Some(existing) = self.forward.get(&id) {
            return if *existing == live {
                Ok(())
            } else {
                Err(FormatError::DuplicateIdentity(id))
            };
        }
        let reverse = match live {
            LiveRef::Type(t) => self.types.get(&t),
            LiveRef::Object(o) => self.objects.get(&o),
        };
        if reverse.is_some_and(|other| *other != id) {
            return Err(FormatError::DuplicateIdentity(id));
        }
        self.forward.insert(id, live);
        match live {
            LiveRef::Type(t) => self.types.insert(t, id),
            LiveRef::Object(o) => self.objects.insert(o, id),
        };
        Ok(())
    }

    /// Binds `id` to an object the restoring runtime already had.
    pub fn insert_preexisting(&mut self, id: ObjectId, live: LiveRef) -> Result<(), FormatError> {
        self.insert(id, live)?;
        self.preexisting.insert(id);
        Ok(())
    }

    /// Binding of `id`.
    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<LiveRef> {
        self.forward.get(&id).copied()
    }

    /// Returns `true` if `id` is bound.
    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.forward.contains_key(&id)
    }

    /// The type `id` names.
    pub fn type_of(&self, id: ObjectId) -> Result<TypeRef, FormatError> {
        match self.get(id) {
            Some(LiveRef::Type(t)) => Ok(t),
            Some(LiveRef::Object(_)) => Err(FormatError::IdentityKindMismatch {
                id,
                expected: "a type",
            }),
            None => Err(FormatError::MissingIdentity(id)),
        }
    }

    /// Identity bound to type `t`.
    #[must_use]
    pub fn id_of_type(&self, t: TypeRef) -> Option<ObjectId> {
        self.types.get(&t).copied()
    }

    /// Identity bound to object `o`.
    #[must_use]
    pub fn id_of_object(&self, o: ObjRef) -> Option<ObjectId> {
        self.objects.get(&o).copied()
    }

    /// Every bound type with its identity, in identity order.
    #[must_use]
    pub fn types(&self) -> Vec<(ObjectId, TypeRef)> {
        let mut out: Vec<_> = self.types.iter().map(|(t, id)| (*id, *t)).collect();
        out.sort_unstable();
        out
    }

    /// Returns `true` if `id` was bound to something the runtime pre-created.
    #[must_use]
    pub fn is_preexisting(&self, id: ObjectId) -> bool {
        self.preexisting.contains(&id)
    }

    /// Records that `id` is bound but its contents still need restoring.
    pub fn defer_fill(&mut self, id: ObjectId) {
        self.pending_fill.insert(id);
    }

    /// Claims a deferred fill; returns `true` exactly once per deferral.
    pub fn claim_fill(&mut self, id: ObjectId) -> bool {
        self.pending_fill.remove(&id)
    }

    /// Claims every outstanding deferred fill, in identity order.
    pub fn drain_pending_fills(&mut self) -> Vec<ObjectId> {
        let mut out: Vec<_> = self.pending_fill.drain().collect();
        out.sort_unstable();
        out
    }

    /// Number of bound identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Returns `true` if nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rebinding_same_pair_is_idempotent() {
        let mut ids = IdentityTable::new();
        ids.insert(ObjectId(5), LiveRef::Object(ObjRef(1))).unwrap();
        ids.insert(ObjectId(5), LiveRef::Object(ObjRef(1))).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids.id_of_object(ObjRef(1)), Some(ObjectId(5)));
    }

    #[test]
    fn conflicting_bindings_are_rejected_both_ways() {
        let mut ids = IdentityTable::new();
        ids.insert(ObjectId(5), LiveRef::Object(ObjRef(1))).unwrap();
        assert_eq!(
            ids.insert(ObjectId(5), LiveRef::Object(ObjRef(2))),
            Err(FormatError::DuplicateIdentity(ObjectId(5)))
        );
        assert_eq!(
            ids.insert(ObjectId(6), LiveRef::Object(ObjRef(1))),
            Err(FormatError::DuplicateIdentity(ObjectId(6)))
        );
        assert!(ids.insert(ObjectId::NULL, LiveRef::Type(TypeRef(0))).is_err());
    }

    #[test]
    fn type_of_distinguishes_missing_from_wrong_kind() {
        let mut ids = IdentityTable::new();
        ids.insert(ObjectId(1), LiveRef::Type(TypeRef(3))).unwrap();
        ids.insert(ObjectId(2), LiveRef::Object(ObjRef(3))).unwrap();
        assert_eq!(ids.type_of(ObjectId(1)), Ok(TypeRef(3)));
        assert!(matches!(
            ids.type_of(ObjectId(2)),
            Err(FormatError::IdentityKindMismatch { .. })
        ));
        assert_eq!(
            ids.type_of(ObjectId(9)),
            Err(FormatError::MissingIdentity(ObjectId(9)))
        );
    }

    #[test]
    fn deferred_fill_is_claimed_once() {
        let mut ids = IdentityTable::new();
        ids.defer_fill(ObjectId(3));
        ids.defer_fill(ObjectId(1));
        assert!(ids.claim_fill(ObjectId(3)));
        assert!(!ids.claim_fill(ObjectId(3)));
        assert_eq!(ids.drain_pending_fills(), vec![ObjectId(1)]);
    }
}
