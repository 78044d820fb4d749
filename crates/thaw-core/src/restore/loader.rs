// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Loader preparation.
//!
//! A class record names its defining loader by identity, and that loader
//! must exist (parent and name set) before the class can be defined. The
//! rest of the loader's fields are filled later with the heap.
use tracing::debug;

use super::strings::restore_string;
use crate::config::RestoreConfig;
use crate::error::{FormatError, Relation, RestoreError};
use crate::heap::{field_value, HeapSource, RecordBody};
use crate::ident::ObjectId;
use crate::identity::{IdentityTable, LiveRef};
use crate::runtime::{fields, names, ObjRef, Runtime, Value};

/// What a [`LoaderProvider`] may touch while preparing a loader.
pub struct LoaderContext<'c> {
    /// Runtime being restored into.
    pub runtime: &'c mut Runtime,
    /// Identity table of the restore.
    pub identities: &'c mut IdentityTable,
    /// Heap records.
    pub heap: &'c dyn HeapSource,
    /// Restore policy.
    pub config: &'c RestoreConfig,
    /// Class whose definition needs the loader; empty during heap restore.
    pub requester: &'c str,
}

/// Supplies partially prepared loader objects by identity.
pub trait LoaderProvider {
    /// Returns the loader for `id`, allocating and preparing it if needed.
    ///
    /// The returned loader must have its parent and name set. A provider
    /// that binds `id` itself should also defer the fill of the remaining
    /// fields; otherwise the caller binds it as a pre-existing object.
    fn prepare_loader(
        &mut self,
        id: ObjectId,
        cx: &mut LoaderContext<'_>,
    ) -> Result<ObjRef, RestoreError>;
}

/// Prepares loaders from their heap records.
#[derive(Debug, Default)]
pub struct SnapshotLoaderProvider;

impl SnapshotLoaderProvider {
    fn prepare(
        id: ObjectId,
        cx: &mut LoaderContext<'_>,
        relation: Relation,
    ) -> Result<ObjRef, RestoreError> {
        match cx.identities.get(id) {
            Some(LiveRef::Object(o)) => return Ok(o),
            Some(LiveRef::Type(_)) => {
                return Err(FormatError::IdentityKindMismatch {
                    id,
                    expected: "a loader",
                }
                .into())
            }
            None => {}
        }
        let record = cx.heap.record(id).ok_or(FormatError::MissingIdentity(id))?;
        let RecordBody::Instance { class, fields: blob } = &record.body else {
            return Err(FormatError::IdentityKindMismatch {
                id,
                expected: "a loader",
            }
            .into());
        };
        let t = match cx.identities.type_of(*class) {
            Ok(t) => t,
            Err(FormatError::MissingIdentity(missing)) => {
                return Err(FormatError::OrderingViolation {
                    relation,
                    id: missing,
                    class: cx.requester.to_owned(),
                }
                .into())
            }
            Err(e) => return Err(e.into()),
        };
        if !cx.runtime.has_supertype_named(t, names::CLASS_LOADER) {
            return Err(FormatError::IdentityKindMismatch {
                id,
                expected: "a loader",
            }
            .into());
        }
        let width = cx.heap.id_width();
        let (parent_id, name_id) = {
            let slots = cx.runtime.instance_slots(t)?;
            (
                field_value(slots, blob, width, fields::LOADER_PARENT)?.reference()?,
                field_value(slots, blob, width, fields::LOADER_NAME)?.reference()?,
            )
        };
        let parent = if parent_id.is_null() {
            None
        } else {
            Some(Self::prepare(parent_id, cx, Relation::LoaderParent)?)
        };

        let loader = cx.runtime.new_instance(t)?;
        cx.identities.insert(id, LiveRef::Object(loader))?;
        cx.identities.defer_fill(id);
        cx.runtime
            .set_field(loader, fields::LOADER_PARENT, Value::Ref(parent))?;
        if !name_id.is_null() {
            let name = restore_string(cx.runtime, cx.identities, cx.heap, cx.config, name_id)?;
            cx.runtime
                .set_field(loader, fields::LOADER_NAME, Value::Ref(Some(name)))?;
        }
        debug!(%id, ?parent, "loader prepared");
        Ok(loader)
    }
}

impl LoaderProvider for SnapshotLoaderProvider {
    fn prepare_loader(
        &mut self,
        id: ObjectId,
        cx: &mut LoaderContext<'_>,
    ) -> Result<ObjRef, RestoreError> {
        Self::prepare(id, cx, Relation::DefiningLoader)
    }
}

/// Loader bound to `id`, asking `provider` for it on first use.
pub(crate) fn obtain_loader(
    provider: &mut dyn LoaderProvider,
    cx: &mut LoaderContext<'_>,
    id: ObjectId,
) -> Result<ObjRef, RestoreError> {
    match cx.identities.get(id) {
        Some(LiveRef::Object(o)) => return Ok(o),
        Some(LiveRef::Type(_)) => {
            return Err(FormatError::IdentityKindMismatch {
                id,
                expected: "a loader",
            }
            .into())
        }
        None => {}
    }
    let loader = provider.prepare_loader(id, cx)?;
    if !cx.runtime.is_loader(loader) {
        return Err(FormatError::IdentityKindMismatch {
            id,
            expected: "a loader",
        }
        .into());
    }
    if !cx.identities.contains(id) {
        cx.identities
            .insert_preexisting(id, LiveRef::Object(loader))?;
        cx.identities.defer_fill(id);
    }
    Ok(loader)
}
