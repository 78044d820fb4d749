// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! String restoration.
//!
//! Interned strings go through the intern table so the restored runtime
//! keeps one canonical copy per contents, including copies it created on
//! its own before the restore.
use tracing::debug;

use super::objects::install_identity_hash;
use crate::config::RestoreConfig;
use crate::error::{FormatError, RestoreError};
use crate::heap::{BlobReader, BlobValue, HeapSource, RecordBody};
use crate::ident::ObjectId;
use crate::identity::{IdentityTable, LiveRef};
use crate::runtime::{decode_string, fields, ObjRef, PrimKind, Runtime, Value};

/// Restores the string recorded under `id`; memoized through `ids`.
pub(crate) fn restore_string(
    rt: &mut Runtime,
    ids: &mut IdentityTable,
    heap: &dyn HeapSource,
    config: &RestoreConfig,
    id: ObjectId,
) -> Result<ObjRef, RestoreError> {
    let not_a_string = || FormatError::IdentityKindMismatch {
        id,
        expected: "a string",
    };
    match ids.get(id) {
        Some(LiveRef::Object(o)) => return Ok(o),
        Some(LiveRef::Type(_)) => return Err(not_a_string().into()),
        None => {}
    }
    let record = heap.record(id).ok_or(FormatError::MissingIdentity(id))?;
    let RecordBody::Instance { class, fields: blob } = &record.body else {
        return Err(not_a_string().into());
    };
    let string = rt.well_known().string;
    if ids.type_of(*class)? != string {
        return Err(not_a_string().into());
    }

    let slots = rt.instance_slots(string)?.to_vec();
    let mut values = Vec::with_capacity(slots.len());
    let mut reader = BlobReader::new(blob, heap.id_width());
    for slot in &slots {
        values.push(reader.next_value(&slot.descriptor)?);
    }
    reader.finish(id)?;
    let value_slot = slots
        .iter()
        .rposition(|s| s.name == fields::STRING_VALUE)
        .ok_or_else(|| FormatError::CorruptRecord("string type has no value field".into()))?;
    let value_id = values[value_slot].reference()?;
    let utf16 = slots
        .iter()
        .zip(&values)
        .rfind(|(s, _)| s.name == fields::STRING_CODER)
        .is_some_and(|(_, v)| *v == BlobValue::Prim(1));
    let contents = match heap.record(value_id).map(|r| &r.body) {
        Some(RecordBody::PrimArray {
            kind: PrimKind::Byte,
            bytes,
        }) => bytes,
        Some(_) => {
            return Err(FormatError::IdentityKindMismatch {
                id: value_id,
                expected: "a byte array",
            }
            .into())
        }
        None if value_id.is_null() => {
            return Err(FormatError::CorruptRecord(format!("string {id} has no contents")).into())
        }
        None => return Err(FormatError::MissingIdentity(value_id).into()),
    };

    let obj = if heap.is_interned(id) {
        let text = decode_string(contents, utf16);
        let preexisting = rt.interned(&text).is_some();
        let obj = rt.intern(&text)?;
        if preexisting {
            ids.insert_preexisting(id, LiveRef::Object(obj))?;
        } else {
            ids.insert(id, LiveRef::Object(obj))?;
        }
        let array = rt.get_field(obj, fields::STRING_VALUE)?.as_reference().flatten();
        if let Some(array) = array {
            if !ids.contains(value_id) && ids.id_of_object(array).is_none() {
                ids.insert(value_id, LiveRef::Object(array))?;
                install_identity_hash(rt, ids, heap, config, value_id, array)?;
            }
        }
        debug!(%id, interned = %text, preexisting, "interned string restored");
        obj
    } else {
        let array = match ids.get(value_id) {
            Some(LiveRef::Object(a)) => a,
            Some(LiveRef::Type(_)) => {
                return Err(FormatError::IdentityKindMismatch {
                    id: value_id,
                    expected: "a byte array",
                }
                .into())
            }
            None => {
                let a = rt.new_prim_array(PrimKind::Byte, contents.to_vec());
                ids.insert(value_id, LiveRef::Object(a))?;
                install_identity_hash(rt, ids, heap, config, value_id, a)?;
                a
            }
        };
        let obj = rt.new_instance(string)?;
        ids.insert(id, LiveRef::Object(obj))?;
        for (i, (slot, v)) in slots.iter().zip(values).enumerate() {
            let value = match v {
                BlobValue::Prim(bits) => PrimKind::from_descriptor(&slot.descriptor)
                    .map(|k| Value::from_bits(k, bits))
                    .ok_or_else(|| FormatError::CorruptRecord(format!("string field {}", slot.name)))?,
                BlobValue::Ref(_) if i == value_slot => Value::Ref(Some(array)),
                BlobValue::Ref(_) => continue,
            };
            rt.set_slot(obj, i, value)?;
        }
        obj
    };
    install_identity_hash(rt, ids, heap, config, id, obj)?;
    Ok(obj)
}
