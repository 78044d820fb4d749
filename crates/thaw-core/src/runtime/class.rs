// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Type metadata: classes, lifecycle states, flags and derived layout.
use bytes::Bytes;

use super::constant_pool::ConstantPool;
use super::heap::{ObjRef, PrimKind, Value};
use super::linkage::LinkageCache;
use super::member::{ClassAttributes, FieldInfo, MethodInfo};

/// Live reference to a type in the current process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct TypeRef(pub(crate) u32);

impl TypeRef {
    /// Arena slot of this type.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Position of a type in the load → link → initialize state machine.
///
/// States advance monotonically. `FullyInitialized` and
/// `InitializationError` are sibling terminal states.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LifecycleState {
    /// Storage allocated; not yet visible through any loader.
    Allocated,
    /// Registered with its defining loader.
    Loaded,
    /// Linking in progress.
    BeingLinked,
    /// Layout, dispatch tables and static storage computed.
    Linked,
    /// Initialization in progress.
    BeingInitialized,
    /// Initialization completed normally.
    FullyInitialized,
    /// Initialization failed; the error object is recorded on the class.
    InitializationError,
}

impl LifecycleState {
    /// Progress rank; the two terminal states share the highest rank.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Allocated => 0,
            Self::Loaded => 1,
            Self::BeingLinked => 2,
            Self::Linked => 3,
            Self::BeingInitialized => 4,
            Self::FullyInitialized | Self::InitializationError => 5,
        }
    }

    /// Returns `true` if `self` has progressed at least as far as `other`.
    #[must_use]
    pub const fn is_at_least(self, other: Self) -> bool {
        self.rank() >= other.rank()
    }

    /// Returns `true` for the two terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::FullyInitialized | Self::InitializationError)
    }

    /// Last stable state at or before `self`; transient states fall back.
    #[must_use]
    pub const fn stable(self) -> Self {
        match self {
            Self::BeingLinked => Self::Loaded,
            Self::BeingInitialized => Self::Linked,
            other => other,
        }
    }

    /// Wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Allocated => 0,
            Self::Loaded => 1,
            Self::BeingLinked => 2,
            Self::Linked => 3,
            Self::BeingInitialized => 4,
            Self::FullyInitialized => 5,
            Self::InitializationError => 6,
        }
    }

    /// Decodes a wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Allocated,
            1 => Self::Loaded,
            2 => Self::BeingLinked,
            3 => Self::Linked,
            4 => Self::BeingInitialized,
            5 => Self::FullyInitialized,
            6 => Self::InitializationError,
            _ => return None,
        })
    }
}

/// Class-file access flags (subset used by the runtime).
pub mod access {
    /// `ACC_PUBLIC`.
    pub const PUBLIC: u16 = 0x0001;
    /// `ACC_PRIVATE`.
    pub const PRIVATE: u16 = 0x0002;
    /// `ACC_PROTECTED`.
    pub const PROTECTED: u16 = 0x0004;
    /// `ACC_STATIC`.
    pub const STATIC: u16 = 0x0008;
    /// `ACC_FINAL`.
    pub const FINAL: u16 = 0x0010;
    /// `ACC_SUPER` on classes, `ACC_SYNCHRONIZED` on methods.
    pub const SUPER: u16 = 0x0020;
    /// `ACC_VOLATILE` on fields, `ACC_BRIDGE` on methods.
    pub const VOLATILE: u16 = 0x0040;
    /// `ACC_TRANSIENT` on fields, `ACC_VARARGS` on methods.
    pub const VARARGS: u16 = 0x0080;
    /// `ACC_NATIVE`.
    pub const NATIVE: u16 = 0x0100;
    /// `ACC_INTERFACE`.
    pub const INTERFACE: u16 = 0x0200;
    /// `ACC_ABSTRACT`.
    pub const ABSTRACT: u16 = 0x0400;
    /// `ACC_SYNTHETIC`.
    pub const SYNTHETIC: u16 = 0x1000;
    /// `ACC_ANNOTATION`.
    pub const ANNOTATION: u16 = 0x2000;
    /// `ACC_ENUM`.
    pub const ENUM: u16 = 0x4000;
}

/// Runtime-internal class flags, transcribed alongside access flags.
pub mod internal {
    /// Bytecode has been rewritten; the class owns a linkage cache.
    pub const REWRITTEN: u16 = 0x0001;
    /// The class or a supertype inherits default methods.
    pub const HAS_DEFAULT_METHODS: u16 = 0x0002;
    /// The interface declares non-abstract instance methods.
    pub const DECLARES_DEFAULT_METHODS: u16 = 0x0004;
    /// Hidden class; never registered in the dictionary by name.
    pub const HIDDEN: u16 = 0x0008;
    /// Bytes were transformed by an external agent.
    pub const MODIFIED_BY_AGENT: u16 = 0x0010;
}

/// Reference to a method: declared in a class, or synthesized by the runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MethodRef {
    /// `holder.methods[index]`.
    Declared {
        /// Declaring class.
        holder: TypeRef,
        /// Index into the holder's declared methods.
        index: u16,
    },
    /// Runtime-synthesized signature-polymorphic intrinsic.
    Intrinsic(u32),
}

/// Reference to a declared field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FieldRef {
    /// Declaring class.
    pub holder: TypeRef,
    /// Index into the holder's declared fields.
    pub index: u16,
}

/// One flattened instance field slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceSlot {
    /// Field this slot stores.
    pub field: FieldRef,
    /// Field name.
    pub name: String,
    /// Field descriptor.
    pub descriptor: String,
}

/// One interface's block in an itable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItableEntry {
    /// Implemented interface.
    pub interface: TypeRef,
    /// Implementation of each of the interface's methods, in declaration order.
    pub methods: Vec<Option<MethodRef>>,
}

impl ItableEntry {
    /// Slots this block occupies (one header plus one per method).
    #[must_use]
    pub fn slot_count(&self) -> usize {
        1 + self.methods.len()
    }
}

/// Derived, process-local layout. Never transcribed; always recomputed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Layout {
    /// Instance size in bytes, header included.
    pub instance_size: u32,
    /// Instance fields, supertypes first.
    pub slots: Vec<InstanceSlot>,
    /// Declared indices of static fields, in declaration order.
    pub static_fields: Vec<u16>,
    /// Slot (instance) or static ordinal (static) per declared field.
    pub field_slots: Vec<u32>,
    /// Byte offset per declared field within its storage block.
    pub field_offsets: Vec<u32>,
    /// Virtual dispatch table.
    pub vtable: Vec<MethodRef>,
    /// Interface dispatch table.
    pub itable: Vec<ItableEntry>,
}

impl Layout {
    /// Itable length in slots.
    #[must_use]
    pub fn itable_len(&self) -> usize {
        self.itable.iter().map(ItableEntry::slot_count).sum()
    }
}

/// Metadata owned by instance (non-array) classes.
#[derive(Clone, Debug, Default)]
pub struct InstanceClass {
    /// [`internal`] flags.
    pub internal_flags: u16,
    /// Class-level attributes.
    pub attributes: ClassAttributes,
    /// Constant pool.
    pub constants: ConstantPool,
    /// Linkage cache; present iff [`internal::REWRITTEN`].
    pub linkage: Option<LinkageCache>,
    /// Declared fields.
    pub fields: Vec<FieldInfo>,
    /// Declared methods.
    pub methods: Vec<MethodInfo>,
    /// Previously cached raw class definition bytes.
    pub cached_class_file: Option<Bytes>,
    /// Derived layout, set on link.
    pub layout: Option<Layout>,
    /// Static field values by static ordinal, allocated on link.
    pub statics: Vec<Value>,
    /// Recorded initialization error, for [`LifecycleState::InitializationError`].
    pub init_error: Option<ObjRef>,
}

impl InstanceClass {
    /// Returns `true` if every flag in `flags` is set.
    #[must_use]
    pub const fn has_internal(&self, flags: u16) -> bool {
        self.internal_flags & flags == flags
    }
}

/// Shape-specific class data.
#[derive(Clone, Debug)]
pub enum ClassKind {
    /// Ordinary class or interface.
    Instance(Box<InstanceClass>),
    /// Array of references.
    ObjArray {
        /// Element type.
        component: TypeRef,
        /// Number of dimensions (1 for `T[]`).
        dimension: u8,
    },
    /// Array of primitives.
    PrimArray(PrimKind),
}

/// One loaded type.
#[derive(Clone, Debug)]
pub struct Class {
    /// Internal name (`java/lang/String`), or the descriptor for arrays (`[I`).
    pub name: String,
    /// Defining loader; `None` for the bootstrap loader.
    pub loader: Option<ObjRef>,
    /// Shape-specific data.
    pub kind: ClassKind,
    /// [`access`] flags.
    pub access_flags: u16,
    /// Direct supertype; `None` only for the root class.
    pub super_class: Option<TypeRef>,
    /// Directly declared interfaces.
    pub interfaces: Vec<TypeRef>,
    /// Type-descriptor object. A snapshot identity names this object.
    pub mirror: Option<ObjRef>,
    /// Lifecycle state.
    pub state: LifecycleState,
    /// One-dimension-higher array type, once created.
    pub array_class: Option<TypeRef>,
}

impl Class {
    /// Instance data, if this is not an array type.
    #[must_use]
    pub fn as_instance(&self) -> Option<&InstanceClass> {
        match &self.kind {
            ClassKind::Instance(ic) => Some(ic),
            _ => None,
        }
    }

    /// Mutable instance data, if this is not an array type.
    pub fn as_instance_mut(&mut self) -> Option<&mut InstanceClass> {
        match &mut self.kind {
            ClassKind::Instance(ic) => Some(ic),
            _ => None,
        }
    }

    /// Returns `true` for interfaces.
    #[must_use]
    pub const fn is_interface(&self) -> bool {
        self.access_flags & access::INTERFACE != 0
    }

    /// Returns `true` for both array shapes.
    #[must_use]
    pub const fn is_array(&self) -> bool {
        !matches!(self.kind, ClassKind::Instance(_))
    }

    /// Field descriptor naming this type (`Ljava/lang/String;`, `[I`).
    #[must_use]
    pub fn descriptor(&self) -> String {
        if self.is_array() {
            self.name.clone()
        } else {
            format!("L{};", self.name)
        }
    }
}

/// Input to [`Runtime::allocate_class`](super::Runtime::allocate_class).
#[derive(Clone, Debug)]
pub struct ClassDefinition {
    /// Internal name.
    pub name: String,
    /// Defining loader.
    pub loader: Option<ObjRef>,
    /// Direct supertype.
    pub super_class: Option<TypeRef>,
    /// Directly declared interfaces.
    pub interfaces: Vec<TypeRef>,
    /// [`access`] flags.
    pub access_flags: u16,
    /// Class body; `layout`, `statics` and `init_error` are ignored.
    pub body: InstanceClass,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_share_rank_and_transients_fall_back() {
        use LifecycleState as S;
        assert!(S::FullyInitialized.is_at_least(S::InitializationError));
        assert!(S::InitializationError.is_at_least(S::FullyInitialized));
        assert!(S::BeingLinked.is_at_least(S::Loaded));
        assert!(!S::Loaded.is_at_least(S::BeingLinked));
        assert_eq!(S::BeingInitialized.stable(), S::Linked);
        assert_eq!(S::BeingLinked.stable(), S::Loaded);
        for code in 0..=6 {
            assert_eq!(S::from_code(code).map(S::code), Some(code));
        }
        assert_eq!(S::from_code(7), None);
    }
}
