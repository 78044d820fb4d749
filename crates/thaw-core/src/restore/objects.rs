// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Object graph restorer.
//!
//! Restoring an identity happens in two steps. The *shell* step binds the
//! identity to a live object (allocating one, or finding the one the
//! runtime already has) before any contents are read; the *fill* step then
//! populates its fields. Fills are queued on an explicit stack, so a cycle
//! finds its members already bound and deep graphs never recurse.
//!
//! A handful of runtime-critical kinds do not go through the generic fill:
//! strings (interning), type descriptors and loaders (fields set when they
//! were created or prepared), resolved-member handles (field offsets are
//! recomputed) and call sites (their dependency context is allocated
//! fresh).
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use super::loader::{obtain_loader, LoaderContext, LoaderProvider};
use super::strings::restore_string;
use crate::config::RestoreConfig;
use crate::error::{FormatError, RestoreError};
use crate::heap::{BlobReader, BlobValue, HeapSource, RecordBody};
use crate::ident::ObjectId;
use crate::identity::{IdentityTable, LiveRef};
use crate::runtime::{
    fields, member_name_flags, names, ClassKind, HashInstall, InstanceSlot, Mirrored, ObjRef,
    PrimKind, Runtime, TypeRef, Value, LOADER_PREPARED_FIELDS, MIRROR_CREATION_FIELDS,
};

/// An object bound to its identity whose contents are still to be read.
#[derive(Clone, Copy, Debug)]
struct Fill {
    id: ObjectId,
    obj: ObjRef,
}

/// Depth-first, memoized heap walk over one restore's identity table.
pub(crate) struct ObjectRestorer<'r> {
    pub(crate) rt: &'r mut Runtime,
    pub(crate) ids: &'r mut IdentityTable,
    heap: &'r dyn HeapSource,
    loaders: &'r mut dyn LoaderProvider,
    config: &'r RestoreConfig,
    statics_for: &'r FxHashSet<TypeRef>,
    stack: Vec<Fill>,
}

impl<'r> ObjectRestorer<'r> {
    pub(crate) fn new(
        rt: &'r mut Runtime,
        ids: &'r mut IdentityTable,
        heap: &'r dyn HeapSource,
        loaders: &'r mut dyn LoaderProvider,
        config: &'r RestoreConfig,
        statics_for: &'r FxHashSet<TypeRef>,
    ) -> Self {
        Self {
            rt,
            ids,
            heap,
            loaders,
            config,
            statics_for,
            stack: Vec::new(),
        }
    }

    /// Live object for `id`, restoring it and everything it reaches.
    pub(crate) fn restore(&mut self, id: ObjectId) -> Result<Option<ObjRef>, RestoreError> {
        let obj = self.shell(id)?;
        self.drain()?;
        Ok(obj)
    }

    /// Fills an identity whose deferred fill was already claimed.
    pub(crate) fn resume(&mut self, id: ObjectId) -> Result<(), RestoreError> {
        let live = self.ids.get(id).ok_or(FormatError::MissingIdentity(id))?;
        let obj = self.live_object(id, live)?;
        self.stack.push(Fill { id, obj });
        self.drain()
    }

    fn drain(&mut self) -> Result<(), RestoreError> {
        while let Some(fill) = self.stack.pop() {
            self.fill(fill)?;
        }
        Ok(())
    }

    fn live_object(&self, id: ObjectId, live: LiveRef) -> Result<ObjRef, RestoreError> {
        match live {
            LiveRef::Object(o) => Ok(o),
            LiveRef::Type(t) => self.rt.mirror(t).ok_or_else(|| {
                FormatError::CorruptRecord(format!("type {id} has no type descriptor")).into()
            }),
        }
    }

    fn bind(&mut self, id: ObjectId, obj: ObjRef) -> Result<(), RestoreError> {
        self.ids.insert(id, LiveRef::Object(obj))?;
        Ok(())
    }

    /// Binds `id` and queues its fill; never reads contents.
    fn shell(&mut self, id: ObjectId) -> Result<Option<ObjRef>, RestoreError> {
        if id.is_null() {
            return Ok(None);
        }
        if let Some(live) = self.ids.get(id) {
            let obj = self.live_object(id, live)?;
            if self.ids.claim_fill(id) {
                self.stack.push(Fill { id, obj });
            }
            return Ok(Some(obj));
        }
        let heap = self.heap;
        let record = heap.record(id).ok_or(FormatError::MissingIdentity(id))?;
        let obj = match &record.body {
            RecordBody::Instance { class, .. } => {
                let t = self.ids.type_of(*class)?;
                self.instance_shell(id, t)?
            }
            RecordBody::ObjArray {
                element_type,
                elements,
            } => {
                let component = self.ids.type_of(*element_type)?;
                let a = self.rt.new_object_array(component, elements.len())?;
                self.bind(id, a)?;
                self.stack.push(Fill { id, obj: a });
                a
            }
            RecordBody::PrimArray { kind, bytes } => {
                let a = self.rt.new_prim_array(*kind, bytes.to_vec());
                self.bind(id, a)?;
                install_identity_hash(self.rt, self.ids, heap, self.config, id, a)?;
                a
            }
        };
        Ok(Some(obj))
    }

    fn instance_shell(&mut self, id: ObjectId, t: TypeRef) -> Result<ObjRef, RestoreError> {
        let wk = *self.rt.well_known();
        if t == wk.string {
            return restore_string(self.rt, self.ids, self.heap, self.config, id);
        }
        if t == wk.class {
            // Every live type descriptor is bound through its type.
            return Err(FormatError::CorruptRecord(format!(
                "type descriptor {id} describes no restored type"
            ))
            .into());
        }
        if t == wk.call_site_context {
            let cx = self.rt.new_call_site_context()?;
            self.bind(id, cx)?;
            debug!(%id, "call-site context allocated");
            return Ok(cx);
        }
        if self.rt.has_supertype_named(t, names::CLASS_LOADER) {
            let mut cx = LoaderContext {
                runtime: &mut *self.rt,
                identities: &mut *self.ids,
                heap: self.heap,
                config: self.config,
                requester: "",
            };
            let loader = obtain_loader(&mut *self.loaders, &mut cx, id)?;
            if self.ids.claim_fill(id) {
                self.stack.push(Fill { id, obj: loader });
            }
            return Ok(loader);
        }
        let obj = self.rt.new_instance(t)?;
        self.bind(id, obj)?;
        self.stack.push(Fill { id, obj });
        Ok(obj)
    }

    fn fill(&mut self, f: Fill) -> Result<(), RestoreError> {
        let heap = self.heap;
        let record = heap.record(f.id).ok_or(FormatError::MissingIdentity(f.id))?;
        match &record.body {
            RecordBody::Instance { fields: blob, .. } => self.fill_instance(f, blob)?,
            RecordBody::ObjArray { elements, .. } => self.fill_array(f, elements)?,
            RecordBody::PrimArray { .. } => {}
        }
        install_identity_hash(self.rt, self.ids, heap, self.config, f.id, f.obj)
    }

    fn fill_instance(&mut self, f: Fill, blob: &[u8]) -> Result<(), RestoreError> {
        let wk = *self.rt.well_known();
        let class = self.rt.class_of(f.obj)?;
        let holder = self.rt.class(class)?.name.clone();
        let slots: Vec<InstanceSlot> = self.rt.instance_slots(class)?.to_vec();
        let mirrored = self.rt.mirrored(f.obj);
        let preset: &[&str] = if mirrored.is_some() {
            &MIRROR_CREATION_FIELDS
        } else if self.rt.is_loader(f.obj) {
            &LOADER_PREPARED_FIELDS
        } else {
            &[]
        };
        let preset_holder = if mirrored.is_some() {
            wk.class
        } else {
            wk.class_loader
        };

        let mut reader = BlobReader::new(blob, self.heap.id_width());
        for (i, slot) in slots.iter().enumerate() {
            let v = reader.next_value(&slot.descriptor)?;
            if slot.field.holder == preset_holder && preset.contains(&slot.name.as_str()) {
                continue;
            }
            if slot.field.holder == wk.call_site && slot.name == fields::CALL_SITE_CONTEXT {
                if let Some(cx) = self.shell(v.reference()?)? {
                    self.rt.register_call_site_context(f.obj, cx)?;
                }
                continue;
            }
            let value = self.value(v, &slot.descriptor, &holder, &slot.name)?;
            self.rt.set_slot(f.obj, i, value)?;
        }

        if let Some(Mirrored::Type(t)) = mirrored {
            if self.statics_for.contains(&t) {
                self.fill_statics(t, &mut reader)?;
            } else if reader.remaining() > 0 {
                // Statics of a type that keeps its own values.
                if let Ok(descriptors) = self.rt.static_descriptors(t) {
                    for descriptor in &descriptors {
                        reader.next_value(descriptor)?;
                    }
                }
            }
        }
        reader.finish(f.id)?;
        if self.rt.has_supertype_named(class, names::MEMBER_NAME) {
            self.relocate_field_member(f)?;
        }
        Ok(())
    }

    /// Statics trail the mirror's own fields, in static ordinal order.
    fn fill_statics(&mut self, t: TypeRef, reader: &mut BlobReader<'_>) -> Result<(), RestoreError> {
        let holder = self.rt.class(t)?.name.clone();
        let descriptors = self.rt.static_descriptors(t)?;
        for (ordinal, descriptor) in descriptors.iter().enumerate() {
            let v = reader.next_value(descriptor)?;
            let value = self.value(v, descriptor, &holder, &format!("static #{ordinal}"))?;
            self.rt.set_static_at(t, ordinal, value)?;
        }
        debug!(class = %holder, count = descriptors.len(), "statics restored");
        Ok(())
    }

    /// A field handle's index is a byte offset, which only the restoring
    /// runtime's layout can give.
    fn relocate_field_member(&mut self, f: Fill) -> Result<(), RestoreError> {
        let flags = self
            .rt
            .get_field(f.obj, fields::MEMBER_FLAGS)?
            .as_int()
            .unwrap_or(0);
        if flags & member_name_flags::IS_FIELD == 0 {
            return Ok(());
        }
        let text = |name: &str| -> Result<String, RestoreError> {
            self.rt
                .get_field(f.obj, name)?
                .as_reference()
                .flatten()
                .and_then(|s| self.rt.string_value(s))
                .ok_or_else(|| {
                    FormatError::CorruptRecord(format!("field handle {} lacks {name}", f.id)).into()
                })
        };
        let name = text(fields::MEMBER_NAME)?;
        let signature = text(fields::MEMBER_TYPE)?;
        let holder = self
            .rt
            .get_field(f.obj, fields::MEMBER_CLAZZ)?
            .as_reference()
            .flatten()
            .and_then(|m| self.rt.type_of_mirror(m))
            .ok_or_else(|| FormatError::CorruptRecord(format!("field handle {} has no holder", f.id)))?;
        let offset = self
            .rt
            .field_offset(holder, &name, &signature)
            .ok_or_else(|| FormatError::MemberNotFound {
                holder: self.rt.class(holder).map(|c| c.name.clone()).unwrap_or_default(),
                name: name.clone(),
                signature: signature.clone(),
            })?;
        self.rt
            .set_field(f.obj, fields::MEMBER_VMINDEX, Value::Long(i64::from(offset)))?;
        debug!(id = %f.id, %name, offset, "field handle relocated");
        Ok(())
    }

    fn fill_array(&mut self, f: Fill, elements: &[ObjectId]) -> Result<(), RestoreError> {
        let class = self.rt.class_of(f.obj)?;
        let (name, component) = {
            let c = self.rt.class(class)?;
            let ClassKind::ObjArray { component, .. } = c.kind else {
                return Err(FormatError::IdentityKindMismatch {
                    id: f.id,
                    expected: "a reference array",
                }
                .into());
            };
            (c.name.clone(), self.rt.class(component)?.descriptor())
        };
        for (i, e) in elements.iter().enumerate() {
            let r = self.shell(*e)?;
            if let Some(r) = r {
                self.check_assignable(r, &component, &name, "[]")?;
            }
            self.rt.set_element(f.obj, i, r)?;
        }
        Ok(())
    }

    fn value(
        &mut self,
        v: BlobValue,
        descriptor: &str,
        holder: &str,
        field: &str,
    ) -> Result<Value, RestoreError> {
        match v {
            BlobValue::Prim(bits) => PrimKind::from_descriptor(descriptor)
                .map(|k| Value::from_bits(k, bits))
                .ok_or_else(|| {
                    FormatError::CorruptRecord(format!("{holder}.{field} is not primitive")).into()
                }),
            BlobValue::Ref(id) => {
                let r = self.shell(id)?;
                if let Some(r) = r {
                    self.check_assignable(r, descriptor, holder, field)?;
                }
                Ok(Value::Ref(r))
            }
        }
    }

    fn check_assignable(
        &self,
        r: ObjRef,
        descriptor: &str,
        holder: &str,
        field: &str,
    ) -> Result<(), RestoreError> {
        let actual = self.rt.class_of(r)?;
        if self.rt.is_assignable_to(actual, descriptor) {
            return Ok(());
        }
        Err(FormatError::FieldTypeMismatch {
            holder: holder.to_owned(),
            field: field.to_owned(),
            descriptor: descriptor.to_owned(),
            actual: self.rt.class(actual)?.name.clone(),
        }
        .into())
    }
}

/// Reproduces the identity hash recorded for `id` on `obj`.
///
/// A conflict on an object the runtime created itself only warns; on an
/// object restored from the snapshot it is fatal unless verification is
/// off.
pub(crate) fn install_identity_hash(
    rt: &mut Runtime,
    ids: &IdentityTable,
    heap: &dyn HeapSource,
    config: &RestoreConfig,
    id: ObjectId,
    obj: ObjRef,
) -> Result<(), RestoreError> {
    let Some(recorded) = heap.record(id).and_then(|r| r.identity_hash) else {
        return Ok(());
    };
    match rt.heap_mut().install_identity_hash(obj, recorded) {
        Some(HashInstall::Installed | HashInstall::AlreadyEqual) => Ok(()),
        Some(HashInstall::Conflict { existing }) => {
            if ids.is_preexisting(id) || !config.verify_identity_hashes {
                warn!(%id, existing, recorded, "identity hash could not be reproduced");
                Ok(())
            } else {
                Err(FormatError::IdentityHashConflict {
                    id,
                    existing,
                    recorded,
                }
                .into())
            }
        }
        None => Err(FormatError::CorruptRecord(format!("{id} is bound to a dead object")).into()),
    }
}
