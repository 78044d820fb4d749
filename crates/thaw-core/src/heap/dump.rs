// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Heap dumper: transcribes every live object of a runtime.
//!
//! Identities follow the class dump: heap slot plus one, and a type is
//! named by its mirror. A mirror's blob carries the mirrored class's
//! static fields after its own instance fields once the class is linked.
use bytes::Bytes;
use tracing::{info, instrument};

use super::blob::BlobWriter;
use super::frames::{CapturedFrame, CapturedThread, FrameValue, RestoredFrame, RestoredThread, StackSlot};
use super::{HeapRecord, HeapSnapshot, RecordBody};
use crate::codec::{object_id, MemberDesc};
use crate::error::DumpError;
use crate::ident::{IdWidth, ObjectId};
use crate::runtime::{ClassKind, Mirrored, ObjRef, Object, ObjectBody, PrimKind, Runtime, TypeRef, Value};

/// Produces a [`HeapSnapshot`] from a live runtime.
#[derive(Debug)]
pub struct HeapDumper<'a> {
    rt: &'a Runtime,
    width: IdWidth,
}

impl<'a> HeapDumper<'a> {
    /// Dumper for `rt`, sized for its current heap.
    pub fn new(rt: &'a Runtime) -> Result<Self, DumpError> {
        let width = IdWidth::fitting(rt.heap().len() as u64).ok_or(DumpError::IdSpaceExhausted)?;
        Ok(Self { rt, width })
    }

    /// Captures every object, the intern set and `threads`.
    #[instrument(skip_all)]
    pub fn snapshot(&self, threads: &[RestoredThread]) -> Result<HeapSnapshot, DumpError> {
        let mut snap = HeapSnapshot::new(self.width);
        for (r, obj) in self.rt.heap().iter() {
            let id = object_id(r);
            snap.insert(id, self.record(r, obj)?);
            if self.rt.is_interned(r) {
                snap.mark_interned(id);
            }
        }
        for t in threads {
            snap.push_thread(self.capture(t)?);
        }
        info!(
            objects = snap.len(),
            threads = threads.len(),
            "heap snapshot taken"
        );
        Ok(snap)
    }

    fn type_id(&self, t: TypeRef) -> Result<ObjectId, DumpError> {
        self.rt.mirror(t).map(object_id).ok_or_else(|| {
            DumpError::Inconsistent(format!("type {t:?} has no type descriptor"))
        })
    }

    fn record(&self, r: ObjRef, obj: &Object) -> Result<HeapRecord, DumpError> {
        let body = match &obj.body {
            ObjectBody::Instance(values) => {
                let mut blob = BlobWriter::new(self.width);
                let slots = self.rt.instance_slots(obj.class)?;
                for (slot, v) in slots.iter().zip(values) {
                    put(&mut blob, &slot.descriptor, *v)?;
                }
                if let Some(Mirrored::Type(t)) = self.rt.mirrored(r) {
                    self.put_statics(&mut blob, t)?;
                }
                RecordBody::Instance {
                    class: self.type_id(obj.class)?,
                    fields: blob.finish(),
                }
            }
            ObjectBody::ObjArray(elements) => {
                let ClassKind::ObjArray { component, .. } = self.rt.class(obj.class)?.kind else {
                    return Err(DumpError::Inconsistent(format!("{r:?} is not a reference array")));
                };
                RecordBody::ObjArray {
                    element_type: self.type_id(component)?,
                    elements: elements
                        .iter()
                        .map(|e| e.map_or(ObjectId::NULL, object_id))
                        .collect(),
                }
            }
            ObjectBody::PrimArray(bytes) => {
                let ClassKind::PrimArray(kind) = self.rt.class(obj.class)?.kind else {
                    return Err(DumpError::Inconsistent(format!("{r:?} is not a primitive array")));
                };
                RecordBody::PrimArray {
                    kind,
                    bytes: Bytes::copy_from_slice(bytes),
                }
            }
        };
        Ok(HeapRecord {
            identity_hash: obj.identity_hash,
            body,
        })
    }

    fn put_statics(&self, blob: &mut BlobWriter, t: TypeRef) -> Result<(), DumpError> {
        let Ok(ic) = self.rt.instance(t) else {
            return Ok(());
        };
        if ic.layout.is_none() {
            return Ok(());
        }
        for (descriptor, v) in self.rt.static_descriptors(t)?.iter().zip(&ic.statics) {
            put(blob, descriptor, *v)?;
        }
        Ok(())
    }

    fn capture(&self, thread: &RestoredThread) -> Result<CapturedThread, DumpError> {
        let frames = thread
            .frames
            .iter()
            .map(|f| self.capture_frame(f))
            .collect::<Result<_, _>>()?;
        Ok(CapturedThread {
            thread: object_id(thread.thread),
            frames,
        })
    }

    fn capture_frame(&self, f: &RestoredFrame) -> Result<CapturedFrame, DumpError> {
        let method = MemberDesc::of_method(self.rt, f.method, |t| self.rt.mirror(t).map(object_id))
            .ok_or_else(|| DumpError::Inconsistent(format!("frame method {:?} is dangling", f.method)))?;
        Ok(CapturedFrame {
            method,
            bci: f.bci,
            locals: f.locals.iter().map(|v| slot(*v)).collect(),
            operands: f.operands.iter().map(|v| slot(*v)).collect(),
            monitors: f.monitors.iter().map(|m| object_id(*m)).collect(),
        })
    }
}

fn slot(v: FrameValue) -> StackSlot {
    match v {
        FrameValue::Prim(bits) => StackSlot::Prim(bits),
        FrameValue::Ref(r) => StackSlot::Ref(r.map_or(ObjectId::NULL, object_id)),
    }
}

fn put(blob: &mut BlobWriter, descriptor: &str, v: Value) -> Result<(), DumpError> {
    match (PrimKind::from_descriptor(descriptor), v) {
        (None, Value::Ref(r)) => blob.reference(r.map_or(ObjectId::NULL, object_id)),
        (Some(kind), v) => {
            let bits = v.to_bits().ok_or_else(|| {
                DumpError::Inconsistent(format!("reference stored in a {descriptor} field"))
            })?;
            blob.prim(kind, bits);
        }
        (None, v) => {
            return Err(DumpError::Inconsistent(format!(
                "{v:?} stored in a {descriptor} field"
            )))
        }
    }
    Ok(())
}
