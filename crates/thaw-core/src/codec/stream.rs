// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Little-endian primitive reader and writer shared by both streams.
//!
//! Variable-length arrays and strings carry a `u32` length prefix where
//! [`NO_ARRAY`] means "absent". Identities use the stream's [`IdWidth`];
//! the all-ones value at that width terminates lists.
use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::error::{FormatError, RestoreError};
use crate::ident::{IdWidth, ObjectId, NO_ARRAY};

/// Writes primitives, identities and length-prefixed data.
#[derive(Debug)]
pub struct SnapshotWriter<W> {
    inner: W,
    width: IdWidth,
}

impl<W: Write> SnapshotWriter<W> {
    /// Wraps `inner`, writing identities at `width`.
    pub const fn new(inner: W, width: IdWidth) -> Self {
        Self { inner, width }
    }

    /// Identity width of this stream.
    pub const fn width(&self) -> IdWidth {
        self.width
    }

    /// Unwraps the sink.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Raw bytes, no prefix.
    pub fn raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)
    }

    /// `u8`.
    pub fn u8(&mut self, v: u8) -> io::Result<()> {
        self.raw(&[v])
    }

    /// `u16`.
    pub fn u16(&mut self, v: u16) -> io::Result<()> {
        self.raw(&v.to_le_bytes())
    }

    /// `u32`.
    pub fn u32(&mut self, v: u32) -> io::Result<()> {
        self.raw(&v.to_le_bytes())
    }

    /// `u64`.
    pub fn u64(&mut self, v: u64) -> io::Result<()> {
        self.raw(&v.to_le_bytes())
    }

    /// `bool` as one byte.
    pub fn bool(&mut self, v: bool) -> io::Result<()> {
        self.u8(u8::from(v))
    }

    /// Identity at the stream width.
    pub fn id(&mut self, id: ObjectId) -> io::Result<()> {
        if !self.width.holds(id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("identity {id} does not fit width {}", self.width.bytes()),
            ));
        }
        let le = id.0.to_le_bytes();
        self.raw(&le[..self.width.bytes()])
    }

    /// Terminates a list.
    pub fn end(&mut self) -> io::Result<()> {
        let le = self.width.end_sentinel().to_le_bytes();
        self.raw(&le[..self.width.bytes()])
    }

    /// Length prefix; `None` writes [`NO_ARRAY`].
    pub fn len(&mut self, len: Option<usize>) -> io::Result<()> {
        match len {
            None => self.u32(NO_ARRAY),
            Some(n) => {
                let n = u32::try_from(n)
                    .ok()
                    .filter(|n| *n != NO_ARRAY)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "array too long"))?;
                self.u32(n)
            }
        }
    }

    /// Optional string.
    pub fn string(&mut self, s: Option<&str>) -> io::Result<()> {
        self.bytes(s.map(str::as_bytes))
    }

    /// Required string.
    pub fn str(&mut self, s: &str) -> io::Result<()> {
        self.string(Some(s))
    }

    /// Optional byte array.
    pub fn bytes(&mut self, b: Option<&[u8]>) -> io::Result<()> {
        self.len(b.map(<[u8]>::len))?;
        if let Some(b) = b {
            self.raw(b)?;
        }
        Ok(())
    }

    /// Optional array, each item written by `item`.
    pub fn array<T>(
        &mut self,
        items: Option<&[T]>,
        mut item: impl FnMut(&mut Self, &T) -> io::Result<()>,
    ) -> io::Result<()> {
        self.len(items.map(<[T]>::len))?;
        for x in items.unwrap_or_default() {
            item(self, x)?;
        }
        Ok(())
    }
}

/// Reads what [`SnapshotWriter`] writes, mapping short reads to
/// [`FormatError::Truncated`].
#[derive(Debug)]
pub struct SnapshotReader<R> {
    inner: R,
    width: IdWidth,
}

fn eof_is_truncation(e: io::Error) -> RestoreError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FormatError::Truncated.into()
    } else {
        RestoreError::Io(e)
    }
}

impl<R: Read> SnapshotReader<R> {
    /// Wraps `inner`; the width is usually set after reading the header.
    pub const fn new(inner: R, width: IdWidth) -> Self {
        Self { inner, width }
    }

    /// Switches identity width.
    pub fn set_width(&mut self, width: IdWidth) {
        self.width = width;
    }

    /// Identity width of this stream.
    pub const fn width(&self) -> IdWidth {
        self.width
    }

    /// Exactly `N` raw bytes.
    pub fn array_n<const N: usize>(&mut self) -> Result<[u8; N], RestoreError> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf).map_err(eof_is_truncation)?;
        Ok(buf)
    }

    /// `u8`.
    pub fn u8(&mut self) -> Result<u8, RestoreError> {
        Ok(self.array_n::<1>()?[0])
    }

    /// `u16`.
    pub fn u16(&mut self) -> Result<u16, RestoreError> {
        Ok(u16::from_le_bytes(self.array_n()?))
    }

    /// `u32`.
    pub fn u32(&mut self) -> Result<u32, RestoreError> {
        Ok(u32::from_le_bytes(self.array_n()?))
    }

    /// `u64`.
    pub fn u64(&mut self) -> Result<u64, RestoreError> {
        Ok(u64::from_le_bytes(self.array_n()?))
    }

    /// `bool`; anything but 0 or 1 is an illegal tag.
    pub fn bool(&mut self) -> Result<bool, RestoreError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(FormatError::IllegalTag { what: "bool", tag }.into()),
        }
    }

    fn raw_id(&mut self) -> Result<u64, RestoreError> {
        let mut le = [0u8; 8];
        let n = self.width.bytes();
        self.inner
            .read_exact(&mut le[..n])
            .map_err(eof_is_truncation)?;
        Ok(u64::from_le_bytes(le))
    }

    /// Identity, or `None` at a list terminator.
    pub fn id_or_end(&mut self) -> Result<Option<ObjectId>, RestoreError> {
        let raw = self.raw_id()?;
        Ok((raw != self.width.end_sentinel()).then_some(ObjectId(raw)))
    }

    /// Identity where a terminator is not allowed.
    pub fn id(&mut self) -> Result<ObjectId, RestoreError> {
        self.id_or_end()?
            .ok_or_else(|| FormatError::CorruptRecord("unexpected end-of-list marker".into()).into())
    }

    /// Identities up to the next terminator.
    pub fn ids_until_end(&mut self) -> Result<Vec<ObjectId>, RestoreError> {
        let mut out = Vec::new();
        while let Some(id) = self.id_or_end()? {
            out.push(id);
        }
        Ok(out)
    }

    /// Length prefix; `None` for [`NO_ARRAY`].
    pub fn len(&mut self) -> Result<Option<usize>, RestoreError> {
        let n = self.u32()?;
        Ok((n != NO_ARRAY).then_some(n as usize))
    }

    /// Optional byte array.
    pub fn bytes(&mut self) -> Result<Option<Bytes>, RestoreError> {
        let Some(n) = self.len()? else {
            return Ok(None);
        };
        // Read through `take` so a corrupt length cannot force a huge allocation.
        let mut buf = Vec::new();
        (&mut self.inner)
            .take(n as u64)
            .read_to_end(&mut buf)
            .map_err(eof_is_truncation)?;
        if buf.len() != n {
            return Err(FormatError::Truncated.into());
        }
        Ok(Some(Bytes::from(buf)))
    }

    /// Byte array that must be present.
    pub fn required_bytes(&mut self, what: &str) -> Result<Bytes, RestoreError> {
        self.bytes()?
            .ok_or_else(|| FormatError::CorruptRecord(format!("{what} is absent")).into())
    }

    /// Optional string.
    pub fn string(&mut self) -> Result<Option<String>, RestoreError> {
        self.bytes()?
            .map(|b| String::from_utf8(b.to_vec()).map_err(|_| FormatError::InvalidUtf8.into()))
            .transpose()
    }

    /// String that must be present.
    pub fn str(&mut self, what: &str) -> Result<String, RestoreError> {
        self.string()?
            .ok_or_else(|| FormatError::CorruptRecord(format!("{what} is absent")).into())
    }

    /// Optional array, each item read by `item`.
    pub fn array<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, RestoreError>,
    ) -> Result<Option<Vec<T>>, RestoreError> {
        let Some(n) = self.len()? else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            out.push(item(self)?);
        }
        Ok(Some(out))
    }

    /// Array that must be present.
    pub fn required_array<T>(
        &mut self,
        what: &str,
        item: impl FnMut(&mut Self) -> Result<T, RestoreError>,
    ) -> Result<Vec<T>, RestoreError> {
        self.array(item)?
            .ok_or_else(|| FormatError::CorruptRecord(format!("{what} is absent")).into())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn absent_empty_and_null_stay_distinct() {
        let mut w = SnapshotWriter::new(Vec::new(), IdWidth::W2);
        w.bytes(None).unwrap();
        w.bytes(Some(&[])).unwrap();
        w.id(ObjectId::NULL).unwrap();
        w.end().unwrap();
        let buf = w.into_inner();
        let mut r = SnapshotReader::new(buf.as_slice(), IdWidth::W2);
        assert_eq!(r.bytes().unwrap(), None);
        assert_eq!(r.bytes().unwrap(), Some(Bytes::new()));
        assert_eq!(r.id_or_end().unwrap(), Some(ObjectId::NULL));
        assert_eq!(r.id_or_end().unwrap(), None);
    }

    #[test]
    fn short_stream_is_truncation_not_io() {
        let mut r = SnapshotReader::new(&[1u8, 2][..], IdWidth::W4);
        let err = r.u32().unwrap_err();
        assert!(matches!(err, RestoreError::Format(FormatError::Truncated)));
        let mut r = SnapshotReader::new(&[9u8, 0, 0, 0, b'a'][..], IdWidth::W1);
        assert!(matches!(
            r.bytes().unwrap_err(),
            RestoreError::Format(FormatError::Truncated)
        ));
    }

    #[test]
    fn identities_that_collide_with_the_sentinel_are_refused() {
        let mut w = SnapshotWriter::new(Vec::new(), IdWidth::W1);
        assert!(w.id(ObjectId(255)).is_err());
        assert!(w.id(ObjectId(254)).is_ok());
    }

    #[test]
    fn strings_must_be_utf8() {
        let mut w = SnapshotWriter::new(Vec::new(), IdWidth::W1);
        w.bytes(Some(&[0xff, 0xfe])).unwrap();
        let buf = w.into_inner();
        let mut r = SnapshotReader::new(buf.as_slice(), IdWidth::W1);
        assert!(matches!(
            r.string().unwrap_err(),
            RestoreError::Format(FormatError::InvalidUtf8)
        ));
    }
}
