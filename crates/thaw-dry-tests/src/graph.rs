// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Structural comparison of object graphs across two runtimes.

use std::fmt;

use rustc_hash::FxHashMap;
use thaw_core::runtime::{Mirrored, ObjRef, ObjectBody, Runtime, RuntimeError, TypeRef, Value};
use thaw_core::ObjectId;

/// Snapshot identity the dumper assigns to `r`.
pub fn snapshot_id(r: ObjRef) -> ObjectId {
    ObjectId(r.index() as u64 + 1)
}

/// First difference found between two graphs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    /// Access path from the root that was being compared.
    pub path: String,
    /// What differs.
    pub detail: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.detail)
    }
}

impl std::error::Error for Mismatch {}

fn mismatch(path: &str, detail: impl Into<String>) -> Mismatch {
    Mismatch {
        path: path.to_owned(),
        detail: detail.into(),
    }
}

/// Checks that two object graphs are isomorphic.
///
/// Objects are paired as they are reached and each pairing must stay a
/// bijection, so aliasing and cycles are compared too. Type descriptors
/// compare by the type they describe, and a call site's dependency
/// context only by its class, since restore always allocates it fresh.
#[derive(Debug)]
pub struct GraphMatcher<'a> {
    src: &'a Runtime,
    dst: &'a Runtime,
    forward: FxHashMap<ObjRef, ObjRef>,
    backward: FxHashMap<ObjRef, ObjRef>,
    pending: Vec<(ObjRef, ObjRef, String)>,
    check_hashes: bool,
}

impl<'a> GraphMatcher<'a> {
    /// Matcher from `src` into `dst`, checking identity hashes.
    pub fn new(src: &'a Runtime, dst: &'a Runtime) -> Self {
        Self {
            src,
            dst,
            forward: FxHashMap::default(),
            backward: FxHashMap::default(),
            pending: Vec::new(),
            check_hashes: true,
        }
    }

    /// Whether identity hashes recorded in `src` must reappear in `dst`.
    pub fn check_hashes(mut self, on: bool) -> Self {
        self.check_hashes = on;
        self
    }

    /// Counterpart of `src` found so far.
    pub fn counterpart(&self, src: ObjRef) -> Option<ObjRef> {
        self.forward.get(&src).copied()
    }

    /// Pairs two references and compares everything reachable from them.
    pub fn matches(
        &mut self,
        a: Option<ObjRef>,
        b: Option<ObjRef>,
        path: &str,
    ) -> Result<(), Mismatch> {
        self.pair(a, b, path)?;
        self.run()
    }

    /// Pairs the static fields of `a` (in `src`) with those of `b` (in `dst`)
    /// and compares everything reachable from them.
    pub fn statics(&mut self, a: TypeRef, b: TypeRef) -> Result<(), Mismatch> {
        let name = self
            .src
            .class(a)
            .map(|c| c.name.clone())
            .map_err(|e| mismatch("<statics>", e.to_string()))?;
        let sa = self
            .src
            .instance(a)
            .map_err(|e| mismatch(&name, e.to_string()))?
            .statics
            .clone();
        let sb = self
            .dst
            .instance(b)
            .map_err(|e| mismatch(&name, e.to_string()))?
            .statics
            .clone();
        if sa.len() != sb.len() {
            return Err(mismatch(&name, format!("{} statics vs {}", sa.len(), sb.len())));
        }
        for (i, (x, y)) in sa.into_iter().zip(sb).enumerate() {
            self.value(x, y, &format!("{name}.static#{i}"))?;
        }
        self.run()
    }

    fn pair(&mut self, a: Option<ObjRef>, b: Option<ObjRef>, path: &str) -> Result<(), Mismatch> {
        let (a, b) = match (a, b) {
            (None, None) => return Ok(()),
            (Some(a), Some(b)) => (a, b),
            (a, b) => return Err(mismatch(path, format!("{a:?} vs {b:?}"))),
        };
        match (self.forward.get(&a), self.backward.get(&b)) {
            (Some(x), _) if *x == b => Ok(()),
            (None, None) => {
                self.forward.insert(a, b);
                self.backward.insert(b, a);
                self.pending.push((a, b, path.to_owned()));
                Ok(())
            }
            _ => Err(mismatch(path, "aliasing differs")),
        }
    }

    fn value(&mut self, a: Value, b: Value, path: &str) -> Result<(), Mismatch> {
        match (a, b) {
            (Value::Ref(x), Value::Ref(y)) => self.pair(x, y, path),
            (x, y) if x == y => Ok(()),
            (x, y) => Err(mismatch(path, format!("{x:?} vs {y:?}"))),
        }
    }

    fn run(&mut self) -> Result<(), Mismatch> {
        while let Some((a, b, path)) = self.pending.pop() {
            self.compare(a, b, &path)?;
        }
        Ok(())
    }

    fn describe(rt: &Runtime, obj: ObjRef) -> Option<String> {
        match rt.mirrored(obj)? {
            Mirrored::Type(t) => rt.class(t).ok().map(|c| format!("class {}", c.name)),
            Mirrored::Primitive(k) => Some(format!("class {}", k.keyword())),
        }
    }

    fn compare(&mut self, a: ObjRef, b: ObjRef, path: &str) -> Result<(), Mismatch> {
        let (src, dst) = (self.src, self.dst);
        let err = |e: RuntimeError| mismatch(path, e.to_string());
        let (oa, ob) = (src.object(a).map_err(err)?, dst.object(b).map_err(err)?);
        if self.check_hashes {
            if let Some(h) = oa.identity_hash {
                if ob.identity_hash != Some(h) {
                    return Err(mismatch(
                        path,
                        format!("identity hash {h:#x} vs {:?}", ob.identity_hash),
                    ));
                }
            }
        }
        let (da, db) = (Self::describe(src, a), Self::describe(dst, b));
        if da.is_some() || db.is_some() {
            return if da == db {
                Ok(())
            } else {
                Err(mismatch(path, format!("{da:?} vs {db:?}")))
            };
        }
        let ca = src.class(oa.class).map_err(err)?;
        let cb = dst.class(ob.class).map_err(err)?;
        if ca.name != cb.name {
            return Err(mismatch(path, format!("{} vs {}", ca.name, cb.name)));
        }
        if oa.class == src.well_known().call_site_context {
            return Ok(());
        }
        match (&oa.body, &ob.body) {
            (ObjectBody::Instance(va), ObjectBody::Instance(vb)) => {
                let slots = src.instance_slots(oa.class).map_err(err)?;
                if va.len() != vb.len() || va.len() != slots.len() {
                    return Err(mismatch(path, "field count differs"));
                }
                let named: Vec<_> = slots
                    .iter()
                    .map(|s| format!("{path}.{}", s.name))
                    .zip(va.iter().copied().zip(vb.iter().copied()))
                    .collect();
                for (p, (x, y)) in named {
                    self.value(x, y, &p)?;
                }
                Ok(())
            }
            (ObjectBody::ObjArray(ea), ObjectBody::ObjArray(eb)) => {
                if ea.len() != eb.len() {
                    return Err(mismatch(path, format!("length {} vs {}", ea.len(), eb.len())));
                }
                let elements: Vec<_> = ea.iter().copied().zip(eb.iter().copied()).collect();
                for (i, (x, y)) in elements.into_iter().enumerate() {
                    self.pair(x, y, &format!("{path}[{i}]"))?;
                }
                Ok(())
            }
            (ObjectBody::PrimArray(x), ObjectBody::PrimArray(y)) if x == y => Ok(()),
            (ObjectBody::PrimArray(_), ObjectBody::PrimArray(_)) => {
                Err(mismatch(path, "primitive contents differ"))
            }
            _ => Err(mismatch(path, "object shape differs")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use thaw_core::runtime::PrimKind;

    #[test]
    fn a_graph_matches_itself() {
        let mut rt = Runtime::bootstrap().unwrap();
        let arr = rt.new_object_array(rt.well_known().object, 2).unwrap();
        rt.set_element(arr, 0, Some(arr)).unwrap();
        let mut m = GraphMatcher::new(&rt, &rt);
        m.matches(Some(arr), Some(arr), "arr").unwrap();
        assert_eq!(m.counterpart(arr), Some(arr));
    }

    #[test]
    fn aliasing_is_part_of_the_shape() {
        let mut rt = Runtime::bootstrap().unwrap();
        let object = rt.well_known().object;
        let shared = rt.new_prim_array(PrimKind::Int, vec![0; 4]);
        let other = rt.new_prim_array(PrimKind::Int, vec![0; 4]);
        let aliased = rt.new_object_array(object, 2).unwrap();
        rt.set_element(aliased, 0, Some(shared)).unwrap();
        rt.set_element(aliased, 1, Some(shared)).unwrap();
        let distinct = rt.new_object_array(object, 2).unwrap();
        rt.set_element(distinct, 0, Some(shared)).unwrap();
        rt.set_element(distinct, 1, Some(other)).unwrap();

        let err = GraphMatcher::new(&rt, &rt)
            .matches(Some(aliased), Some(distinct), "root")
            .unwrap_err();
        assert_eq!(err.path, "root[1]");
    }
}
