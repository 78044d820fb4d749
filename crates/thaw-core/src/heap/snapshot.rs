// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory heap snapshot and its stream encoding.
#![allow(clippy::cast_possible_truncation)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use super::frames::CapturedThread;
use super::{record_kind, HeapRecord, HeapSource, RecordBody};
use crate::codec::stream::{SnapshotReader, SnapshotWriter};
use crate::codec::{create_dump_file, read_preamble, FORMAT_VERSION, HEAP_MAGIC};
use crate::error::{DumpError, FormatError, RestoreError};
use crate::ident::{IdWidth, ObjectId};
use crate::runtime::PrimKind;

/// Every heap record, the interned-string set and captured stacks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapSnapshot {
    width: IdWidth,
    records: BTreeMap<ObjectId, HeapRecord>,
    interned: BTreeSet<ObjectId>,
    threads: Vec<CapturedThread>,
}

impl HeapSnapshot {
    /// Empty snapshot whose blobs encode references at `width`.
    #[must_use]
    pub const fn new(width: IdWidth) -> Self {
        Self {
            width,
            records: BTreeMap::new(),
            interned: BTreeSet::new(),
            threads: Vec::new(),
        }
    }

    /// Adds or replaces the record of `id`.
    pub fn insert(&mut self, id: ObjectId, record: HeapRecord) -> Option<HeapRecord> {
        self.records.insert(id, record)
    }

    /// Mutable record of `id`.
    pub fn record_mut(&mut self, id: ObjectId) -> Option<&mut HeapRecord> {
        self.records.get_mut(&id)
    }

    /// Marks `id` as an interned string.
    pub fn mark_interned(&mut self, id: ObjectId) {
        self.interned.insert(id);
    }

    /// Appends a captured stack.
    pub fn push_thread(&mut self, thread: CapturedThread) {
        self.threads.push(thread);
    }

    /// Captured stacks in dump order.
    #[must_use]
    pub fn threads(&self) -> &[CapturedThread] {
        &self.threads
    }

    /// Records in identity order.
    pub fn records(&self) -> impl Iterator<Item = (ObjectId, &HeapRecord)> {
        self.records.iter().map(|(id, r)| (*id, r))
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encodes the snapshot.
    pub fn write_to<W: Write>(&self, out: W) -> io::Result<()> {
        let mut w = SnapshotWriter::new(out, self.width);
        w.raw(&HEAP_MAGIC)?;
        w.u16(FORMAT_VERSION)?;
        w.u8(self.width.bytes() as u8)?;
        for (id, record) in &self.records {
            w.id(*id)?;
            write_record(&mut w, record)?;
        }
        w.end()?;
        for id in &self.interned {
            w.id(*id)?;
        }
        w.end()?;
        for t in &self.threads {
            t.write_to(&mut w)?;
        }
        w.end()
    }

    /// Decodes a snapshot.
    pub fn read_from<R: Read>(input: R) -> Result<Self, RestoreError> {
        let mut r = SnapshotReader::new(input, IdWidth::W8);
        let width = read_preamble(&mut r, &HEAP_MAGIC)?;
        let mut snapshot = Self::new(width);
        while let Some(id) = r.id_or_end()? {
            if id.is_null() {
                return Err(FormatError::CorruptRecord("heap record for null".into()).into());
            }
            let record = read_record(&mut r)?;
            if snapshot.records.insert(id, record).is_some() {
                return Err(FormatError::DuplicateIdentity(id).into());
            }
        }
        snapshot.interned = r.ids_until_end()?.into_iter().collect();
        while let Some(thread) = r.id_or_end()? {
            snapshot.threads.push(CapturedThread::read_from(&mut r, thread)?);
        }
        Ok(snapshot)
    }

    /// Reads a snapshot file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RestoreError> {
        Self::read_from(BufReader::new(File::open(path)?))
    }

    /// Writes a snapshot file; see [`dump`](crate::codec::dump) for
    /// `overwrite`.
    pub fn save(&self, path: impl AsRef<Path>, overwrite: bool) -> Result<(), DumpError> {
        let mut out = BufWriter::new(create_dump_file(path.as_ref(), overwrite)?);
        self.write_to(&mut out)?;
        out.flush()?;
        Ok(())
    }
}

impl HeapSource for HeapSnapshot {
    fn id_width(&self) -> IdWidth {
        self.width
    }

    fn record(&self, id: ObjectId) -> Option<&HeapRecord> {
        self.records.get(&id)
    }

    fn is_interned(&self, id: ObjectId) -> bool {
        self.interned.contains(&id)
    }
}

fn write_record<W: Write>(w: &mut SnapshotWriter<W>, record: &HeapRecord) -> io::Result<()> {
    w.u8(record.kind())?;
    w.bool(record.identity_hash.is_some())?;
    if let Some(h) = record.identity_hash {
        w.u32(h)?;
    }
    match &record.body {
        RecordBody::Instance { class, fields } => {
            w.id(*class)?;
            w.bytes(Some(&fields[..]))
        }
        RecordBody::ObjArray {
            element_type,
            elements,
        } => {
            w.id(*element_type)?;
            w.array(Some(elements.as_slice()), |w, e| w.id(*e))
        }
        RecordBody::PrimArray { kind, bytes } => {
            w.u8(kind.code())?;
            w.bytes(Some(&bytes[..]))
        }
    }
}

fn read_record<R: Read>(r: &mut SnapshotReader<R>) -> Result<HeapRecord, RestoreError> {
    let kind = r.u8()?;
    let identity_hash = if r.bool()? { Some(r.u32()?) } else { None };
    let body = match kind {
        record_kind::INSTANCE => RecordBody::Instance {
            class: r.id()?,
            fields: r.required_bytes("field blob")?,
        },
        record_kind::OBJ_ARRAY => RecordBody::ObjArray {
            element_type: r.id()?,
            elements: r.required_array("array elements", SnapshotReader::id)?,
        },
        record_kind::PRIM_ARRAY => {
            let code = r.u8()?;
            let kind = PrimKind::from_code(code).ok_or(FormatError::IllegalTag {
                what: "primitive kind",
                tag: code,
            })?;
            let bytes = r.required_bytes("array contents")?;
            if bytes.len() % kind.size() != 0 {
                return Err(FormatError::CorruptRecord(format!(
                    "{} bytes do not divide into {} elements",
                    bytes.len(),
                    kind.keyword()
                ))
                .into());
            }
            RecordBody::PrimArray { kind, bytes }
        }
        tag => {
            return Err(FormatError::IllegalTag {
                what: "heap record kind",
                tag,
            }
            .into())
        }
    };
    Ok(HeapRecord {
        identity_hash,
        body,
    })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn unknown_record_kind_is_an_illegal_tag() {
        let mut snap = HeapSnapshot::new(IdWidth::W1);
        snap.insert(
            ObjectId(3),
            HeapRecord {
                identity_hash: Some(42),
                body: RecordBody::PrimArray {
                    kind: PrimKind::Int,
                    bytes: Bytes::from_static(&[1, 0, 0, 0]),
                },
            },
        );
        let mut buf = Vec::new();
        snap.write_to(&mut buf).unwrap();
        assert_eq!(HeapSnapshot::read_from(buf.as_slice()).unwrap(), snap);

        // magic + version + width + id
        buf[16 + 2 + 1 + 1] = 9;
        let err = HeapSnapshot::read_from(buf.as_slice()).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::Format(FormatError::IllegalTag { tag: 9, .. })
        ));
    }

    #[test]
    fn ragged_primitive_array_is_corrupt() {
        let mut snap = HeapSnapshot::new(IdWidth::W1);
        snap.insert(
            ObjectId(1),
            HeapRecord {
                identity_hash: None,
                body: RecordBody::PrimArray {
                    kind: PrimKind::Char,
                    bytes: Bytes::from_static(&[1, 2, 3]),
                },
            },
        );
        let mut buf = Vec::new();
        snap.write_to(&mut buf).unwrap();
        assert!(matches!(
            HeapSnapshot::read_from(buf.as_slice()).unwrap_err(),
            RestoreError::Format(FormatError::CorruptRecord(_))
        ));
    }
}
