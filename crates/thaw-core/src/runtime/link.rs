// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Linking: field layout, dispatch tables and static storage.
use rustc_hash::FxHashSet;

use super::class::{FieldRef, InstanceSlot, ItableEntry, Layout, LifecycleState, MethodRef, TypeRef};
use super::constant_pool::CpEntry;
use super::heap::{PrimKind, Value};
use super::{Runtime, RuntimeError};

/// Object header size in bytes.
pub(crate) const OBJECT_HEADER_BYTES: u32 = 16;
/// Width of a reference field in bytes.
pub(crate) const REFERENCE_BYTES: u32 = 8;

fn field_width(descriptor: &str) -> u32 {
    PrimKind::from_descriptor(descriptor).map_or(REFERENCE_BYTES, |k| k.size() as u32)
}

const fn align_up(value: u32, to: u32) -> u32 {
    value.div_ceil(to) * to
}

/// Class names mentioned by a method or field descriptor.
fn descriptor_class_names(descriptor: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = descriptor;
    while let Some(start) = rest.find('L') {
        let tail = &rest[start + 1..];
        let Some(end) = tail.find(';') else { break };
        out.push(&tail[..end]);
        rest = &tail[end + 1..];
    }
    out
}

#[derive(Clone, Copy)]
enum Verification {
    /// Run every check the ordinary loader runs.
    Full,
    /// The producer already checked dispatch compatibility; optionally
    /// compare recomputed table sizes with recorded ones.
    Trusted(Option<(usize, usize)>),
}

impl Runtime {
    /// Links `t` (and its supertypes) as the ordinary loader does.
    pub fn link_class(&mut self, t: TypeRef) -> Result<(), RuntimeError> {
        self.link_with(t, Verification::Full)
    }

    /// Links `t` without loader-constraint checks, then validates the
    /// recomputed dispatch table sizes against `vtable_len`/`itable_len`.
    pub fn link_trusted(
        &mut self,
        t: TypeRef,
        vtable_len: usize,
        itable_len: usize,
    ) -> Result<(), RuntimeError> {
        self.link_with(t, Verification::Trusted(Some((vtable_len, itable_len))))
    }

    fn link_with(&mut self, t: TypeRef, mode: Verification) -> Result<(), RuntimeError> {
        let c = self.class(t)?;
        if c.state.is_at_least(LifecycleState::Linked) {
            return Ok(());
        }
        if c.is_array() {
            return self.advance_state(t, LifecycleState::Linked);
        }
        let deps: Vec<TypeRef> = c.super_class.iter().chain(&c.interfaces).copied().collect();
        let dep_mode = match mode {
            Verification::Full => Verification::Full,
            Verification::Trusted(_) => Verification::Trusted(None),
        };
        for d in deps {
            self.link_with(d, dep_mode)?;
        }
        self.advance_state(t, LifecycleState::BeingLinked)?;
        let layout = self.compute_layout(t)?;
        match mode {
            Verification::Full => self.check_loader_constraints(t, &layout)?,
            Verification::Trusted(Some((vtable_len, itable_len))) => {
                let name = || self.class(t).map(|c| c.name.clone()).unwrap_or_default();
                if layout.vtable.len() != vtable_len {
                    return Err(RuntimeError::LayoutMismatch {
                        name: name(),
                        table: "vtable",
                        expected: vtable_len,
                        actual: layout.vtable.len(),
                    });
                }
                if layout.itable_len() != itable_len {
                    return Err(RuntimeError::LayoutMismatch {
                        name: name(),
                        table: "itable",
                        expected: itable_len,
                        actual: layout.itable_len(),
                    });
                }
            }
            Verification::Trusted(None) => {}
        }
        let statics = self.prepare_statics(t, &layout)?;
        let ic = self.instance_mut(t)?;
        ic.layout = Some(layout);
        ic.statics = statics;
        self.advance_state(t, LifecycleState::Linked)
    }

    fn prepare_statics(&mut self, t: TypeRef, layout: &Layout) -> Result<Vec<Value>, RuntimeError> {
        let mut out = Vec::with_capacity(layout.static_fields.len());
        for i in &layout.static_fields {
            let (signature, constant) = {
                let ic = self.instance(t)?;
                let Some(f) = ic.fields.get(usize::from(*i)) else {
                    continue;
                };
                let constant = f
                    .constant_value_index
                    .and_then(|ci| ic.constants.get(ci).cloned());
                (f.signature.clone(), constant)
            };
            let value = match constant {
                Some(CpEntry::Integer(v)) => match PrimKind::from_descriptor(&signature) {
                    Some(k) => Value::from_bits(k, u64::from(v as u32)),
                    None => Value::default_for(&signature),
                },
                Some(CpEntry::Long(v)) => Value::Long(v),
                Some(CpEntry::Float(v)) => Value::Float(v),
                Some(CpEntry::Double(v)) => Value::Double(v),
                Some(CpEntry::String { string_index }) => {
                    let s = self
                        .instance(t)?
                        .constants
                        .utf8(string_index)
                        .map(str::to_owned);
                    match s {
                        Some(s) => Value::Ref(Some(self.intern(&s)?)),
                        None => Value::Ref(None),
                    }
                }
                _ => Value::default_for(&signature),
            };
            out.push(value);
        }
        Ok(out)
    }

    fn same_signature(&self, m: MethodRef, name: &str, signature: &str) -> bool {
        self.method(m)
            .is_some_and(|(_, info)| info.name == name && info.signature == signature)
    }

    /// Interfaces of `t`, transitively, in declaration-order depth-first
    /// order without duplicates (superclass interfaces included).
    pub fn interface_closure(&self, t: TypeRef) -> Vec<TypeRef> {
        fn visit(rt: &Runtime, t: TypeRef, seen: &mut FxHashSet<TypeRef>, out: &mut Vec<TypeRef>) {
            let Ok(c) = rt.class(t) else { return };
            for i in &c.interfaces {
                if seen.insert(*i) {
                    out.push(*i);
                    visit(rt, *i, seen, out);
                }
            }
            if let Some(s) = c.super_class {
                visit(rt, s, seen, out);
            }
        }
        let mut seen = FxHashSet::default();
        let mut out = Vec::new();
        visit(self, t, &mut seen, &mut out);
        out
    }

    /// Computes the layout `t` would have if linked now.
    ///
    /// Pure function of the class and its (linked) supertypes, so two
    /// runtimes holding equivalent universes compute equal layouts.
    pub fn compute_layout(&self, t: TypeRef) -> Result<Layout, RuntimeError> {
        let c = self.class(t)?;
        let ic = self.instance(t)?;
        let (mut slots, mut size, mut vtable) = match c.super_class {
            Some(s) => {
                let sl = self.layout(s)?;
                (sl.slots.clone(), sl.instance_size, sl.vtable.clone())
            }
            None => (Vec::new(), OBJECT_HEADER_BYTES, Vec::new()),
        };
        let mut field_slots = vec![0u32; ic.fields.len()];
        let mut field_offsets = vec![0u32; ic.fields.len()];
        let mut static_fields = Vec::new();
        let mut static_size = 0u32;
        for (i, f) in ic.fields.iter().enumerate() {
            let width = field_width(&f.signature);
            if f.is_static() {
                static_size = align_up(static_size, width);
                field_offsets[i] = static_size;
                static_size += width;
                field_slots[i] = static_fields.len() as u32;
                static_fields.push(i as u16);
            } else {
                size = align_up(size, width);
                field_offsets[i] = size;
                size += width;
                field_slots[i] = slots.len() as u32;
                slots.push(InstanceSlot {
                    field: FieldRef {
                        holder: t,
                        index: i as u16,
                    },
                    name: f.name.clone(),
                    descriptor: f.signature.clone(),
                });
            }
        }

        let interfaces = self.interface_closure(t);
        let mut itable = Vec::new();
        if !c.is_interface() {
            for (i, m) in ic.methods.iter().enumerate() {
                if !m.is_virtual() {
                    continue;
                }
                let own = MethodRef::Declared {
                    holder: t,
                    index: i as u16,
                };
                match vtable
                    .iter()
                    .position(|e| self.same_signature(*e, &m.name, &m.signature))
                {
                    Some(pos) => vtable[pos] = own,
                    None => vtable.push(own),
                }
            }
            for iface in &interfaces {
                for (j, m) in self.instance(*iface)?.methods.iter().enumerate() {
                    if !m.is_virtual() || m.is_abstract() {
                        continue;
                    }
                    if !vtable
                        .iter()
                        .any(|e| self.same_signature(*e, &m.name, &m.signature))
                    {
                        vtable.push(MethodRef::Declared {
                            holder: *iface,
                            index: j as u16,
                        });
                    }
                }
            }
            for iface in &interfaces {
                let methods = self
                    .instance(*iface)?
                    .methods
                    .iter()
                    .filter(|m| m.is_virtual())
                    .map(|m| {
                        vtable
                            .iter()
                            .copied()
                            .find(|e| self.same_signature(*e, &m.name, &m.signature))
                    })
                    .collect();
                itable.push(ItableEntry {
                    interface: *iface,
                    methods,
                });
            }
        }

        Ok(Layout {
            instance_size: align_up(size, 8),
            slots,
            static_fields,
            field_slots,
            field_offsets,
            vtable,
            itable,
        })
    }

    /// Checks that every override agrees with the overridden method on the
    /// types its signature names, as seen from both defining loaders.
    fn check_loader_constraints(&self, t: TypeRef, layout: &Layout) -> Result<(), RuntimeError> {
        let Some(s) = self.class(t)?.super_class else {
            return Ok(());
        };
        let super_vtable = &self.layout(s)?.vtable;
        for (slot, inherited) in super_vtable.iter().enumerate() {
            let Some(own) = layout.vtable.get(slot) else {
                continue;
            };
            if own == inherited {
                continue;
            }
            let (Some((h1, m1)), Some((h2, _))) = (self.method(*own), self.method(*inherited))
            else {
                continue;
            };
            let (l1, l2) = (self.class(h1)?.loader, self.class(h2)?.loader);
            if l1 == l2 {
                continue;
            }
            for name in descriptor_class_names(&m1.signature) {
                let a = self.resolve_class(name, l1);
                let b = self.resolve_class(name, l2);
                if let (Some(a), Some(b)) = (a, b) {
                    if a != b {
                        return Err(RuntimeError::LoaderConstraint(format!(
                            "{}.{}{} sees two definitions of {name}",
                            self.class(h1)?.name,
                            m1.name,
                            m1.signature
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_names_skip_primitives() {
        assert_eq!(
            descriptor_class_names("(ILjava/lang/String;[Ldemo/Node;)V"),
            vec!["java/lang/String", "demo/Node"]
        );
        assert!(descriptor_class_names("(IJ)V").is_empty());
    }

    #[test]
    fn fields_align_to_their_width() {
        assert_eq!(align_up(17, 8), 24);
        assert_eq!(align_up(16, 4), 16);
        assert_eq!(field_width("J"), 8);
        assert_eq!(field_width("Z"), 1);
        assert_eq!(field_width("Ljava/lang/Object;"), REFERENCE_BYTES);
    }
}
