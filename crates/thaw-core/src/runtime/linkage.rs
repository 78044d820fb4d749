// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-class linkage cache: previously resolved field, method and
//! invoke-dynamic references of rewritten bytecode.
use super::class::{FieldRef, MethodRef, TypeRef};
use super::constant_pool::ResolutionError;
use super::heap::ObjRef;

/// One slot of a resolved method entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Link {
    /// Holder or interface type.
    Type(TypeRef),
    /// Target method.
    Method(MethodRef),
    /// Virtual dispatch table index. Valid only in the process that computed it.
    DispatchIndex(u32),
}

/// Resolution of a field access.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ResolvedField {
    /// Bytecode resolved for reads (`getfield`/`getstatic`), 0 if not yet.
    pub get_code: u8,
    /// Bytecode resolved for writes (`putfield`/`putstatic`), 0 if not yet.
    pub put_code: u8,
    /// Entry flags (volatile, final, ...).
    pub flags: u8,
    /// Resolved field.
    pub field: FieldRef,
}

/// Linkage entry for a field reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldEntry {
    /// Constant-pool index of the `FieldRef`.
    pub cp_index: u16,
    /// Resolution, if any.
    pub resolved: Option<ResolvedField>,
}

/// Linkage entry for a method reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodEntry {
    /// Constant-pool index of the method reference.
    pub cp_index: u16,
    /// First resolved bytecode, 0 if unresolved.
    pub bytecode1: u8,
    /// Second resolved bytecode, 0 if unresolved.
    pub bytecode2: u8,
    /// Entry flags.
    pub flags: u8,
    /// First link slot.
    pub f1: Option<Link>,
    /// Second link slot.
    pub f2: Option<Link>,
}

impl MethodEntry {
    /// An unresolved entry for `cp_index`.
    #[must_use]
    pub const fn unresolved(cp_index: u16) -> Self {
        Self {
            cp_index,
            bytecode1: 0,
            bytecode2: 0,
            flags: 0,
            f1: None,
            f2: None,
        }
    }

    /// Returns `true` once either bytecode has been resolved.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.bytecode1 != 0 || self.bytecode2 != 0
    }

    /// Forgets any resolution.
    pub fn clear(&mut self) {
        *self = Self::unresolved(self.cp_index);
    }
}

/// Resolution of an invoke-dynamic call site.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ResolvedIndy {
    /// Linked adapter method.
    pub adapter: MethodRef,
    /// Trailing argument object passed to the adapter.
    pub appendix: Option<ObjRef>,
}

/// Linkage entry for an invoke-dynamic call site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndyEntry {
    /// Constant-pool index of the `InvokeDynamic`.
    pub cp_index: u16,
    /// Resolution, if any.
    pub resolved: Option<ResolvedIndy>,
    /// Recorded bootstrap failure.
    pub error: Option<ResolutionError>,
}

/// The linkage cache of a rewritten class.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkageCache {
    /// Field entries.
    pub fields: Vec<FieldEntry>,
    /// Method entries.
    pub methods: Vec<MethodEntry>,
    /// Invoke-dynamic entries.
    pub indys: Vec<IndyEntry>,
}

impl LinkageCache {
    /// Cache shaped by entry counts, every entry unresolved.
    ///
    /// Constant-pool indices are filled in by the caller.
    #[must_use]
    pub fn with_shape(fields: usize, methods: usize, indys: usize) -> Self {
        Self {
            fields: vec![
                FieldEntry {
                    cp_index: 0,
                    resolved: None,
                };
                fields
            ],
            methods: vec![MethodEntry::unresolved(0); methods],
            indys: vec![
                IndyEntry {
                    cp_index: 0,
                    resolved: None,
                    error: None,
                };
                indys
            ],
        }
    }
}
