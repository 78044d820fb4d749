// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Interclass reference resolver.
//!
//! Runs once every type of the unit is loaded. Type identities resolve
//! through the identity table; member descriptions resolve by name,
//! descriptor and kind in the holder, falling back to the runtime's
//! signature-polymorphic intrinsics. A miss is fatal: the member existed
//! when the snapshot was taken.
use crate::codec::{DeferredRef, FieldDesc, LinkDesc, MemberDesc};
use crate::error::{FormatError, RestoreError};
use crate::ident::ObjectId;
use crate::identity::IdentityTable;
use crate::runtime::{
    ClassSlot, CpEntry, FieldRef, Link, LinkageCache, MethodRef, ResolvedField, ResolvedIndy,
    Runtime, TypeRef,
};

use super::PendingAppendix;

/// Completes every deferred reference of `t`.
///
/// Resolved call-site entries whose appendix is a heap object are
/// returned through `appendices` for the heap phase.
pub(crate) fn resolve_deferred(
    rt: &mut Runtime,
    ids: &IdentityTable,
    t: TypeRef,
    deferred: Vec<DeferredRef>,
    appendices: &mut Vec<PendingAppendix>,
) -> Result<(), RestoreError> {
    for d in deferred {
        match d {
            DeferredRef::CpClass { index, target } => {
                let resolved = ids.type_of(target)?;
                let entry = rt.instance_mut(t)?.constants.get_mut(index);
                let Some(CpEntry::Class { slot, .. }) = entry else {
                    return Err(FormatError::CorruptRecord(format!(
                        "constant #{index} is not a class constant"
                    ))
                    .into());
                };
                *slot = ClassSlot::Resolved(resolved);
            }
            DeferredRef::Field {
                entry,
                get_code,
                put_code,
                flags,
                field,
            } => {
                let field = resolve_field(rt, ids, &field)?;
                let fe = linkage(rt, t)?
                    .fields
                    .get_mut(entry)
                    .ok_or_else(|| entry_out_of_range("field", entry))?;
                fe.resolved = Some(ResolvedField {
                    get_code,
                    put_code,
                    flags,
                    field,
                });
            }
            DeferredRef::Method {
                entry,
                bytecode1,
                bytecode2,
                flags,
                f1,
                f2,
            } => {
                let f1 = f1.map(|l| resolve_link(rt, ids, &l)).transpose()?;
                let f2 = f2.map(|l| resolve_link(rt, ids, &l)).transpose()?;
                let me = linkage(rt, t)?
                    .methods
                    .get_mut(entry)
                    .ok_or_else(|| entry_out_of_range("method", entry))?;
                me.bytecode1 = bytecode1;
                me.bytecode2 = bytecode2;
                me.flags = flags;
                me.f1 = f1;
                me.f2 = f2;
            }
            DeferredRef::Indy {
                entry,
                adapter,
                appendix,
            } => {
                let adapter = resolve_member(rt, ids, &adapter)?;
                let ie = linkage(rt, t)?
                    .indys
                    .get_mut(entry)
                    .ok_or_else(|| entry_out_of_range("call-site", entry))?;
                ie.resolved = Some(ResolvedIndy {
                    adapter,
                    appendix: None,
                });
                if !appendix.is_null() {
                    appendices.push(PendingAppendix {
                        ty: t,
                        entry,
                        appendix,
                    });
                }
            }
        }
    }
    Ok(())
}

fn linkage(rt: &mut Runtime, t: TypeRef) -> Result<&mut LinkageCache, RestoreError> {
    let ic = rt.instance_mut(t)?;
    ic.linkage
        .as_mut()
        .ok_or_else(|| FormatError::CorruptRecord("linkage entry on a class without a cache".into()).into())
}

fn entry_out_of_range(section: &str, entry: usize) -> RestoreError {
    FormatError::CorruptRecord(format!("{section} entry {entry} is out of range")).into()
}

fn holder(rt: &Runtime, ids: &IdentityTable, id: ObjectId) -> Result<(TypeRef, String), RestoreError> {
    let t = ids.type_of(id)?;
    Ok((t, rt.class(t)?.name.clone()))
}

/// Finds the method `desc` names.
pub(crate) fn resolve_member(
    rt: &mut Runtime,
    ids: &IdentityTable,
    desc: &MemberDesc,
) -> Result<MethodRef, RestoreError> {
    let (t, name) = holder(rt, ids, desc.holder)?;
    rt.find_method(t, &desc.name, &desc.signature, desc.kind)
        .or_else(|| rt.signature_polymorphic_intrinsic(t, &desc.name, &desc.signature))
        .ok_or_else(|| {
            FormatError::MemberNotFound {
                holder: name,
                name: desc.name.clone(),
                signature: desc.signature.clone(),
            }
            .into()
        })
}

fn resolve_field(rt: &Runtime, ids: &IdentityTable, desc: &FieldDesc) -> Result<FieldRef, RestoreError> {
    let (t, name) = holder(rt, ids, desc.holder)?;
    rt.find_field(t, &desc.name, &desc.signature, desc.is_static)
        .ok_or_else(|| {
            FormatError::MemberNotFound {
                holder: name,
                name: desc.name.clone(),
                signature: desc.signature.clone(),
            }
            .into()
        })
}

fn resolve_link(rt: &mut Runtime, ids: &IdentityTable, link: &LinkDesc) -> Result<Link, RestoreError> {
    Ok(match link {
        LinkDesc::Type(id) => Link::Type(ids.type_of(*id)?),
        LinkDesc::Method(desc) => Link::Method(resolve_member(rt, ids, desc)?),
    })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::LiveRef;
    use crate::runtime::MethodKind;

    fn with_core_types() -> (Runtime, IdentityTable) {
        let rt = Runtime::bootstrap().unwrap();
        let mut ids = IdentityTable::new();
        let wk = *rt.well_known();
        ids.insert(ObjectId(1), LiveRef::Type(wk.object)).unwrap();
        ids.insert(ObjectId(2), LiveRef::Type(wk.method_handle)).unwrap();
        (rt, ids)
    }

    #[test]
    fn members_resolve_by_name_signature_and_kind() {
        let (mut rt, ids) = with_core_types();
        let desc = MemberDesc {
            holder: ObjectId(1),
            name: "toString".into(),
            signature: "()Ljava/lang/String;".into(),
            kind: MethodKind::Instance,
        };
        let m = resolve_member(&mut rt, &ids, &desc).unwrap();
        assert_eq!(rt.method(m).unwrap().1.name, "toString");

        let wrong_kind = MemberDesc {
            kind: MethodKind::Static,
            ..desc
        };
        let err = resolve_member(&mut rt, &ids, &wrong_kind).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::Format(FormatError::MemberNotFound { .. })
        ));
    }

    #[test]
    fn polymorphic_members_fall_back_to_intrinsics() {
        let (mut rt, ids) = with_core_types();
        let desc = MemberDesc {
            holder: ObjectId(2),
            name: "invokeExact".into(),
            signature: "(Ljava/lang/String;)I".into(),
            kind: MethodKind::Instance,
        };
        let m = resolve_member(&mut rt, &ids, &desc).unwrap();
        assert!(matches!(m, MethodRef::Intrinsic(_)));
        assert_eq!(resolve_member(&mut rt, &ids, &desc).unwrap(), m);
    }

    #[test]
    fn unknown_holder_is_a_missing_identity() {
        let (mut rt, ids) = with_core_types();
        let desc = MemberDesc {
            holder: ObjectId(40),
            name: "x".into(),
            signature: "()V".into(),
            kind: MethodKind::Static,
        };
        assert!(matches!(
            resolve_member(&mut rt, &ids, &desc).unwrap_err(),
            RestoreError::Format(FormatError::MissingIdentity(ObjectId(40)))
        ));
    }
}
