// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Flat field blobs of instance records.
//!
//! Fields are laid end to end in the live layout order with no padding: a
//! primitive takes its natural width, a reference takes the identity
//! width of the stream. Decoding therefore needs the field descriptors of
//! the type on the reading side.
use bytes::Bytes;

use crate::error::FormatError;
use crate::ident::{IdWidth, ObjectId};
use crate::runtime::{InstanceSlot, PrimKind};

/// One decoded field.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlobValue {
    /// Primitive bits, zero-extended.
    Prim(u64),
    /// Reference identity, null for null.
    Ref(ObjectId),
}

impl BlobValue {
    /// The reference payload; a primitive where a reference was declared
    /// is a corrupt record.
    pub fn reference(self) -> Result<ObjectId, FormatError> {
        match self {
            Self::Ref(id) => Ok(id),
            Self::Prim(_) => Err(FormatError::CorruptRecord(
                "primitive found in a reference field".into(),
            )),
        }
    }
}

/// Builds a field blob.
#[derive(Debug)]
pub struct BlobWriter {
    width: IdWidth,
    out: Vec<u8>,
}

impl BlobWriter {
    /// Empty blob writing references at `width`.
    #[must_use]
    pub const fn new(width: IdWidth) -> Self {
        Self {
            width,
            out: Vec::new(),
        }
    }

    /// Appends a primitive of `kind`.
    pub fn prim(&mut self, kind: PrimKind, bits: u64) {
        self.out.extend_from_slice(&bits.to_le_bytes()[..kind.size()]);
    }

    /// Appends a reference.
    pub fn reference(&mut self, id: ObjectId) {
        self.out
            .extend_from_slice(&id.0.to_le_bytes()[..self.width.bytes()]);
    }

    /// The finished blob.
    #[must_use]
    pub fn finish(self) -> Bytes {
        Bytes::from(self.out)
    }
}

/// Sequential reader over a field blob.
#[derive(Debug)]
pub struct BlobReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    width: IdWidth,
}

impl<'a> BlobReader<'a> {
    /// Reads `bytes`, decoding references at `width`.
    #[must_use]
    pub const fn new(bytes: &'a [u8], width: IdWidth) -> Self {
        Self {
            bytes,
            pos: 0,
            width,
        }
    }

    /// Decodes the next field, declared with `descriptor`.
    pub fn next_value(&mut self, descriptor: &str) -> Result<BlobValue, FormatError> {
        let kind = PrimKind::from_descriptor(descriptor);
        let n = kind.map_or(self.width.bytes(), PrimKind::size);
        let chunk = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or(FormatError::Truncated)?;
        self.pos += n;
        let mut le = [0u8; 8];
        le[..n].copy_from_slice(chunk);
        let raw = u64::from_le_bytes(le);
        Ok(match kind {
            Some(_) => BlobValue::Prim(raw),
            None => BlobValue::Ref(ObjectId(raw)),
        })
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Fails unless the blob of record `id` was read to its end.
    pub fn finish(&self, id: ObjectId) -> Result<(), FormatError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(FormatError::CorruptRecord(format!(
                "record {id} has {n} bytes past its last field"
            ))),
        }
    }
}

/// Value of the field `name` (most-derived declaration) in a blob laid out
/// by `slots`.
pub(crate) fn field_value(
    slots: &[InstanceSlot],
    blob: &[u8],
    width: IdWidth,
    name: &str,
) -> Result<BlobValue, FormatError> {
    let target = slots
        .iter()
        .rposition(|s| s.name == name)
        .ok_or_else(|| FormatError::CorruptRecord(format!("record has no field {name}")))?;
    let mut r = BlobReader::new(blob, width);
    for s in &slots[..target] {
        r.next_value(&s.descriptor)?;
    }
    r.next_value(&slots[target].descriptor)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn mixed_widths_decode_in_order() {
        let mut w = BlobWriter::new(IdWidth::W2);
        w.prim(PrimKind::Byte, 0xfe);
        w.reference(ObjectId(0x0102));
        w.prim(PrimKind::Long, u64::MAX);
        let blob = w.finish();
        assert_eq!(blob.len(), 1 + 2 + 8);
        let mut r = BlobReader::new(&blob, IdWidth::W2);
        assert_eq!(r.next_value("B").unwrap(), BlobValue::Prim(0xfe));
        assert_eq!(
            r.next_value("Ljava/lang/Object;").unwrap(),
            BlobValue::Ref(ObjectId(0x0102))
        );
        assert_eq!(r.next_value("J").unwrap(), BlobValue::Prim(u64::MAX));
        assert_eq!(r.remaining(), 0);
        assert_eq!(r.next_value("Z"), Err(FormatError::Truncated));
        assert_eq!(r.finish(ObjectId(7)), Ok(()));
    }

    #[test]
    fn unread_tail_is_corrupt() {
        let mut w = BlobWriter::new(IdWidth::W4);
        w.prim(PrimKind::Int, 3);
        w.prim(PrimKind::Short, 9);
        let blob = w.finish();
        let mut r = BlobReader::new(&blob, IdWidth::W4);
        assert_eq!(r.next_value("I").unwrap(), BlobValue::Prim(3));
        assert_eq!(r.remaining(), 2);
        assert!(matches!(
            r.finish(ObjectId(7)),
            Err(FormatError::CorruptRecord(msg)) if msg.contains("2 bytes")
        ));
    }
}
