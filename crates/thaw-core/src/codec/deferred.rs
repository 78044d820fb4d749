// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Deferred inter-type references and portable member descriptions.
//!
//! A class record cannot point at another type's members by index: member
//! order inside a type is not stable across runs. Members are therefore
//! written as `(holder, name, signature, kind)` and looked up again once
//! the holder exists.
use std::io::{self, Read, Write};

use super::stream::{SnapshotReader, SnapshotWriter};
use crate::error::{FormatError, RestoreError};
use crate::ident::ObjectId;
use crate::runtime::{FieldRef, MethodKind, MethodRef, Runtime, TypeRef};

/// Portable description of a method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberDesc {
    /// Identity of the declaring type.
    pub holder: ObjectId,
    /// Method name.
    pub name: String,
    /// Method descriptor.
    pub signature: String,
    /// Static, instance or overpass.
    pub kind: MethodKind,
}

impl MemberDesc {
    /// Describes `m`, naming its holder by `type_id`.
    pub fn of_method(
        rt: &Runtime,
        m: MethodRef,
        type_id: impl Fn(TypeRef) -> Option<ObjectId>,
    ) -> Option<Self> {
        let (holder, info) = rt.method(m)?;
        Some(Self {
            holder: type_id(holder)?,
            name: info.name.clone(),
            signature: info.signature.clone(),
            kind: info.kind(),
        })
    }

    pub(crate) fn write_to<W: Write>(&self, w: &mut SnapshotWriter<W>) -> io::Result<()> {
        w.id(self.holder)?;
        w.str(&self.name)?;
        w.str(&self.signature)?;
        w.u8(self.kind.code())
    }

    pub(crate) fn read_from<R: Read>(r: &mut SnapshotReader<R>) -> Result<Self, RestoreError> {
        let holder = r.id()?;
        let name = r.str("member name")?;
        let signature = r.str("member signature")?;
        let code = r.u8()?;
        let kind = MethodKind::from_code(code).ok_or(FormatError::IllegalTag {
            what: "method kind",
            tag: code,
        })?;
        Ok(Self {
            holder,
            name,
            signature,
            kind,
        })
    }
}

/// Portable description of a field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDesc {
    /// Identity of the declaring type.
    pub holder: ObjectId,
    /// Field name.
    pub name: String,
    /// Field descriptor.
    pub signature: String,
    /// Static field.
    pub is_static: bool,
}

impl FieldDesc {
    /// Describes `f`, naming its holder by `type_id`.
    pub fn of_field(
        rt: &Runtime,
        f: FieldRef,
        type_id: impl Fn(TypeRef) -> Option<ObjectId>,
    ) -> Option<Self> {
        let info = rt.field(f)?;
        Some(Self {
            holder: type_id(f.holder)?,
            name: info.name.clone(),
            signature: info.signature.clone(),
            is_static: info.is_static(),
        })
    }

    pub(crate) fn write_to<W: Write>(&self, w: &mut SnapshotWriter<W>) -> io::Result<()> {
        w.id(self.holder)?;
        w.str(&self.name)?;
        w.str(&self.signature)?;
        w.bool(self.is_static)
    }

    pub(crate) fn read_from<R: Read>(r: &mut SnapshotReader<R>) -> Result<Self, RestoreError> {
        Ok(Self {
            holder: r.id()?,
            name: r.str("field name")?,
            signature: r.str("field signature")?,
            is_static: r.bool()?,
        })
    }
}

/// One link slot of a method entry, before resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkDesc {
    /// Direct type identity.
    Type(ObjectId),
    /// Member description.
    Method(MemberDesc),
}

/// A slot of a parsed type that needs another type or member.
///
/// Collected while a record is parsed; completed by the interclass
/// resolver once every type in the unit exists. Linkage entries named
/// here are left unresolved in the parsed cache until then, so a
/// half-resolved entry is never observable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeferredRef {
    /// Resolved class constant.
    CpClass {
        /// Constant-pool index.
        index: u16,
        /// Identity of the resolved type.
        target: ObjectId,
    },
    /// Resolved field entry of the linkage cache.
    Field {
        /// Entry index.
        entry: usize,
        /// Read bytecode.
        get_code: u8,
        /// Write bytecode.
        put_code: u8,
        /// Entry flags.
        flags: u8,
        /// Resolved field.
        field: FieldDesc,
    },
    /// Resolved method entry of the linkage cache.
    Method {
        /// Entry index.
        entry: usize,
        /// First bytecode.
        bytecode1: u8,
        /// Second bytecode.
        bytecode2: u8,
        /// Entry flags.
        flags: u8,
        /// First link slot.
        f1: Option<LinkDesc>,
        /// Second link slot.
        f2: Option<LinkDesc>,
    },
    /// Resolved invoke-dynamic entry.
    Indy {
        /// Entry index.
        entry: usize,
        /// Linked adapter.
        adapter: MemberDesc,
        /// Identity of the appendix object, restored with the heap.
        appendix: ObjectId,
    },
}

impl DeferredRef {
    /// Returns `true` for references into the linkage cache.
    #[must_use]
    pub const fn is_linkage(&self) -> bool {
        !matches!(self, Self::CpClass { .. })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ident::IdWidth;

    #[test]
    fn member_kind_tag_is_validated() {
        let desc = MemberDesc {
            holder: ObjectId(7),
            name: "area".into(),
            signature: "()D".into(),
            kind: MethodKind::Instance,
        };
        let mut w = SnapshotWriter::new(Vec::new(), IdWidth::W1);
        desc.write_to(&mut w).unwrap();
        let mut buf = w.into_inner();
        assert_eq!(
            MemberDesc::read_from(&mut SnapshotReader::new(buf.as_slice(), IdWidth::W1)).unwrap(),
            desc
        );
        *buf.last_mut().unwrap() = 9;
        let err =
            MemberDesc::read_from(&mut SnapshotReader::new(buf.as_slice(), IdWidth::W1)).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::Format(FormatError::IllegalTag { tag: 9, .. })
        ));
    }
}
