// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Structural equivalence of a predefined type and its class record.
//!
//! Both sides are reduced to a [`Shape`] and compared by BLAKE3 digest;
//! only on mismatch is the first concrete difference searched for the
//! diagnostic. Constants the runtime synthesized after definition and
//! runtime-synthesized (overpass) methods are not part of the shape.
use blake3::Hasher;

use crate::error::FormatError;
use crate::runtime::{ClassDefinition, InstanceClass, MethodKind, Runtime, TypeRef};

/// Hex characters of each digest shown in diagnostics.
const SHORT_DIGEST: usize = 16;

type Member<'a> = (&'a str, &'a str, u16);

#[derive(Debug, PartialEq, Eq)]
struct Shape<'a> {
    access_flags: u16,
    super_class: Option<TypeRef>,
    interfaces: &'a [TypeRef],
    tags: Vec<u8>,
    fields: Vec<Member<'a>>,
    methods: Vec<Member<'a>>,
}

impl<'a> Shape<'a> {
    fn of(
        access_flags: u16,
        super_class: Option<TypeRef>,
        interfaces: &'a [TypeRef],
        body: &'a InstanceClass,
    ) -> Self {
        let mut methods: Vec<Member<'a>> = body
            .methods
            .iter()
            .filter(|m| m.kind() != MethodKind::Overpass)
            .map(|m| (m.name.as_str(), m.signature.as_str(), m.access_flags))
            .collect();
        methods.sort_unstable();
        Self {
            access_flags,
            super_class,
            interfaces,
            tags: body.constants.original_tags().collect(),
            fields: body
                .fields
                .iter()
                .map(|f| (f.name.as_str(), f.signature.as_str(), f.access_flags))
                .collect(),
            methods,
        }
    }

    fn digest(&self) -> blake3::Hash {
        let mut h = Hasher::new();
        h.update(&self.access_flags.to_le_bytes());
        h.update(&self.super_class.map_or(u32::MAX, |t| t.0).to_le_bytes());
        h.update(&(self.interfaces.len() as u64).to_le_bytes());
        for i in self.interfaces {
            h.update(&i.0.to_le_bytes());
        }
        h.update(&(self.tags.len() as u64).to_le_bytes());
        h.update(&self.tags);
        for members in [&self.fields, &self.methods] {
            h.update(&(members.len() as u64).to_le_bytes());
            for (name, signature, flags) in members {
                hash_str(&mut h, name);
                hash_str(&mut h, signature);
                h.update(&flags.to_le_bytes());
            }
        }
        h.finalize()
    }

    fn first_difference(&self, other: &Self) -> String {
        if self.access_flags != other.access_flags {
            return format!(
                "access flags {:#06x} vs {:#06x}",
                self.access_flags, other.access_flags
            );
        }
        if self.super_class != other.super_class || self.interfaces != other.interfaces {
            return "supertypes differ".into();
        }
        if self.tags != other.tags {
            let at = self
                .tags
                .iter()
                .zip(&other.tags)
                .position(|(a, b)| a != b)
                .unwrap_or_else(|| self.tags.len().min(other.tags.len()));
            return format!("constant pool tags differ at #{at}");
        }
        if let Some(d) = member_difference("field", &self.fields, &other.fields) {
            return d;
        }
        member_difference("method", &self.methods, &other.methods)
            .unwrap_or_else(|| "digest differs".into())
    }
}

fn hash_str(h: &mut Hasher, s: &str) {
    h.update(&(s.len() as u64).to_le_bytes());
    h.update(s.as_bytes());
}

fn member_difference(what: &str, ours: &[Member<'_>], theirs: &[Member<'_>]) -> Option<String> {
    if let Some(m) = ours.iter().find(|m| !theirs.contains(m)) {
        return Some(format!("{what} {}{} ({:#06x}) missing from snapshot", m.0, m.1, m.2));
    }
    if let Some(m) = theirs.iter().find(|m| !ours.contains(m)) {
        return Some(format!("snapshot {what} {}{} ({:#06x}) not predefined", m.0, m.1, m.2));
    }
    (ours != theirs).then(|| format!("{what} order differs"))
}

fn short(hash: &blake3::Hash) -> String {
    let mut s = hex::encode(hash.as_bytes());
    s.truncate(SHORT_DIGEST);
    s
}

/// Fails unless the predefined `existing` type matches `parsed` structurally.
pub(crate) fn check_equivalent(
    rt: &Runtime,
    existing: TypeRef,
    parsed: &ClassDefinition,
) -> Result<(), FormatError> {
    let c = rt.class(existing)?;
    let ic = rt.instance(existing)?;
    let ours = Shape::of(c.access_flags, c.super_class, &c.interfaces, ic);
    let theirs = Shape::of(
        parsed.access_flags,
        parsed.super_class,
        &parsed.interfaces,
        &parsed.body,
    );
    let (a, b) = (ours.digest(), theirs.digest());
    if a == b {
        return Ok(());
    }
    Err(FormatError::PredefinedMismatch {
        name: c.name.clone(),
        detail: ours.first_difference(&theirs),
        ours: short(&a),
        theirs: short(&b),
    })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::runtime::{FieldInfo, MethodInfo};

    fn string_definition(rt: &Runtime) -> ClassDefinition {
        let t = rt.well_known().string;
        let c = rt.class(t).unwrap();
        ClassDefinition {
            name: c.name.clone(),
            loader: c.loader,
            super_class: c.super_class,
            interfaces: c.interfaces.clone(),
            access_flags: c.access_flags,
            body: rt.instance(t).unwrap().clone(),
        }
    }

    #[test]
    fn identical_structure_matches() {
        let rt = Runtime::bootstrap().unwrap();
        let def = string_definition(&rt);
        check_equivalent(&rt, rt.well_known().string, &def).unwrap();
    }

    #[test]
    fn extra_field_is_reported_precisely() {
        let rt = Runtime::bootstrap().unwrap();
        let mut def = string_definition(&rt);
        def.body.fields.push(FieldInfo::new("hash2", "I", 0));
        let err = check_equivalent(&rt, rt.well_known().string, &def).unwrap_err();
        match err {
            FormatError::PredefinedMismatch {
                detail,
                ours,
                theirs,
                ..
            } => {
                assert!(detail.contains("hash2"), "{detail}");
                assert_eq!(ours.len(), SHORT_DIGEST);
                assert_ne!(ours, theirs);
            }
            other => unreachable!("expected a predefined mismatch, got {other:?}"),
        }
    }

    #[test]
    fn method_order_is_irrelevant_but_flags_are_not() {
        let rt = Runtime::bootstrap().unwrap();
        let mut def = string_definition(&rt);
        def.body.methods.reverse();
        check_equivalent(&rt, rt.well_known().string, &def).unwrap();

        def.body.methods.push(MethodInfo::new("intern", "()Ljava/lang/String;", 0x0101, None));
        assert!(check_equivalent(&rt, rt.well_known().string, &def).is_err());
    }
}
