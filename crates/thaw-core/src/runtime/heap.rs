// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Object heap: references, primitive kinds, values and the object arena.
use super::class::TypeRef;

/// Live reference to a heap object in the current process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    /// Arena slot of this object.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Primitive element kinds, in canonical snapshot order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PrimKind {
    /// `boolean` (`Z`).
    Boolean,
    /// `char` (`C`).
    Char,
    /// `float` (`F`).
    Float,
    /// `double` (`D`).
    Double,
    /// `byte` (`B`).
    Byte,
    /// `short` (`S`).
    Short,
    /// `int` (`I`).
    Int,
    /// `long` (`J`).
    Long,
}

impl PrimKind {
    /// Every kind in canonical order.
    pub const ALL: [Self; 8] = [
        Self::Boolean,
        Self::Char,
        Self::Float,
        Self::Double,
        Self::Byte,
        Self::Short,
        Self::Int,
        Self::Long,
    ];

    /// Wire code (matches the `newarray` operand encoding).
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Boolean => 4,
            Self::Char => 5,
            Self::Float => 6,
            Self::Double => 7,
            Self::Byte => 8,
            Self::Short => 9,
            Self::Int => 10,
            Self::Long => 11,
        }
    }

    /// Decodes a wire code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    /// Position in [`PrimKind::ALL`].
    #[must_use]
    pub const fn ordinal(self) -> usize {
        (self.code() - 4) as usize
    }

    /// Element width in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Boolean | Self::Byte => 1,
            Self::Char | Self::Short => 2,
            Self::Float | Self::Int => 4,
            Self::Double | Self::Long => 8,
        }
    }

    /// Single-character type descriptor.
    #[must_use]
    pub const fn descriptor(self) -> char {
        match self {
            Self::Boolean => 'Z',
            Self::Char => 'C',
            Self::Float => 'F',
            Self::Double => 'D',
            Self::Byte => 'B',
            Self::Short => 'S',
            Self::Int => 'I',
            Self::Long => 'J',
        }
    }

    /// Kind named by a one-character descriptor, if primitive.
    #[must_use]
    pub fn from_descriptor(desc: &str) -> Option<Self> {
        let mut chars = desc.chars();
        let c = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        Self::ALL.into_iter().find(|k| k.descriptor() == c)
    }

    /// Source-level keyword.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Char => "char",
            Self::Float => "float",
            Self::Double => "double",
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
        }
    }
}

/// A field, static, array-element or stack value.
///
/// Floating-point values are carried as raw bits so equality is bitwise.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Value {
    /// `boolean`.
    Boolean(bool),
    /// `char` (UTF-16 code unit).
    Char(u16),
    /// `float` bits.
    Float(u32),
    /// `double` bits.
    Double(u64),
    /// `byte`.
    Byte(i8),
    /// `short`.
    Short(i16),
    /// `int`.
    Int(i32),
    /// `long`.
    Long(i64),
    /// Reference, `None` for null.
    Ref(Option<ObjRef>),
}

impl Value {
    /// Zero value for a field descriptor.
    #[must_use]
    pub fn default_for(descriptor: &str) -> Self {
        PrimKind::from_descriptor(descriptor).map_or(Self::Ref(None), Self::zero)
    }

    /// Zero value of a primitive kind.
    #[must_use]
    pub const fn zero(kind: PrimKind) -> Self {
        match kind {
            PrimKind::Boolean => Self::Boolean(false),
            PrimKind::Char => Self::Char(0),
            PrimKind::Float => Self::Float(0),
            PrimKind::Double => Self::Double(0),
            PrimKind::Byte => Self::Byte(0),
            PrimKind::Short => Self::Short(0),
            PrimKind::Int => Self::Int(0),
            PrimKind::Long => Self::Long(0),
        }
    }

    /// Rebuilds a primitive value from its zero-extended little-endian bits.
    #[must_use]
    pub fn from_bits(kind: PrimKind, bits: u64) -> Self {
        match kind {
            PrimKind::Boolean => Self::Boolean(bits & 1 != 0),
            PrimKind::Char => Self::Char(bits as u16),
            PrimKind::Float => Self::Float(bits as u32),
            PrimKind::Double => Self::Double(bits),
            PrimKind::Byte => Self::Byte(bits as u8 as i8),
            PrimKind::Short => Self::Short(bits as u16 as i16),
            PrimKind::Int => Self::Int(bits as u32 as i32),
            PrimKind::Long => Self::Long(bits as i64),
        }
    }

    /// Primitive bits, zero-extended; `None` for references.
    #[must_use]
    pub fn to_bits(self) -> Option<u64> {
        Some(match self {
            Self::Boolean(b) => u64::from(b),
            Self::Char(c) => u64::from(c),
            Self::Float(f) => u64::from(f),
            Self::Double(d) => d,
            Self::Byte(b) => u64::from(b as u8),
            Self::Short(s) => u64::from(s as u16),
            Self::Int(i) => u64::from(i as u32),
            Self::Long(l) => l as u64,
            Self::Ref(_) => return None,
        })
    }

    /// The reference payload, or `None` if this is a primitive.
    #[must_use]
    pub const fn as_reference(self) -> Option<Option<ObjRef>> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// The `int` payload, if any.
    #[must_use]
    pub const fn as_int(self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(i),
            _ => None,
        }
    }

    /// The `long` payload, if any.
    #[must_use]
    pub const fn as_long(self) -> Option<i64> {
        match self {
            Self::Long(l) => Some(l),
            _ => None,
        }
    }
}

/// Object contents by shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectBody {
    /// Instance field values, flattened with supertype fields first.
    Instance(Vec<Value>),
    /// Reference array elements.
    ObjArray(Vec<Option<ObjRef>>),
    /// Primitive array contents as little-endian element bytes.
    PrimArray(Vec<u8>),
}

/// One heap object.
#[derive(Clone, Debug)]
pub struct Object {
    /// Runtime type.
    pub class: TypeRef,
    /// Contents.
    pub body: ObjectBody,
    /// Identity hash, once computed or installed.
    pub identity_hash: Option<u32>,
}

/// Outcome of installing a recorded identity hash.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HashInstall {
    /// The object had no hash; it now carries the requested one.
    Installed,
    /// The object already carried exactly the requested hash.
    AlreadyEqual,
    /// The object already carried a different hash, which is kept.
    Conflict {
        /// Hash the object keeps.
        existing: u32,
    },
}

/// Object arena. Objects are never freed; collection is not modelled.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<Object>,
    hash_seed: u32,
}

impl Heap {
    /// Allocates an object and returns its reference.
    pub fn alloc(&mut self, class: TypeRef, body: ObjectBody) -> ObjRef {
        let r = ObjRef(self.objects.len() as u32);
        self.objects.push(Object {
            class,
            body,
            identity_hash: None,
        });
        r
    }

    /// Object by reference.
    #[must_use]
    pub fn get(&self, r: ObjRef) -> Option<&Object> {
        self.objects.get(r.index())
    }

    /// Mutable object by reference.
    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut Object> {
        self.objects.get_mut(r.index())
    }

    /// Number of allocated objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if nothing has been allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Iterates all objects in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &Object)> {
        self.objects
            .iter()
            .enumerate()
            .map(|(i, o)| (ObjRef(i as u32), o))
    }

    /// Returns the identity hash of `r`, computing one lazily on first use.
    pub fn identity_hash(&mut self, r: ObjRef) -> Option<u32> {
        let next = self.next_hash();
        let obj = self.objects.get_mut(r.index())?;
        Some(*obj.identity_hash.get_or_insert(next))
    }

    /// Installs a recorded identity hash.
    pub fn install_identity_hash(&mut self, r: ObjRef, hash: u32) -> Option<HashInstall> {
        let obj = self.objects.get_mut(r.index())?;
        Some(match obj.identity_hash {
            None => {
                obj.identity_hash = Some(hash);
                HashInstall::Installed
            }
            Some(h) if h == hash => HashInstall::AlreadyEqual,
            Some(existing) => HashInstall::Conflict { existing },
        })
    }

    // xorshift; never yields zero, which is reserved for "no hash" in some dumps.
    fn next_hash(&mut self) -> u32 {
        let mut x = self.hash_seed.wrapping_add(0x9E37_79B9) | 1;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.hash_seed = x;
        (x & 0x7FFF_FFFF) | 1
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn value_bits_preserve_sign_and_width() {
        let v = Value::from_bits(PrimKind::Short, Value::Short(-2).to_bits().unwrap());
        assert_eq!(v, Value::Short(-2));
        let v = Value::from_bits(PrimKind::Long, Value::Long(i64::MIN).to_bits().unwrap());
        assert_eq!(v, Value::Long(i64::MIN));
        assert_eq!(Value::Ref(None).to_bits(), None);
    }

    #[test]
    fn identity_hash_install_reports_conflicts() {
        let mut heap = Heap::default();
        let a = heap.alloc(TypeRef(0), ObjectBody::Instance(Vec::new()));
        assert_eq!(heap.install_identity_hash(a, 7), Some(HashInstall::Installed));
        assert_eq!(heap.install_identity_hash(a, 7), Some(HashInstall::AlreadyEqual));
        assert_eq!(
            heap.install_identity_hash(a, 8),
            Some(HashInstall::Conflict { existing: 7 })
        );
        assert_eq!(heap.identity_hash(a), Some(7));
    }

    #[test]
    fn lazy_identity_hash_is_stable() {
        let mut heap = Heap::default();
        let a = heap.alloc(TypeRef(0), ObjectBody::PrimArray(vec![0; 4]));
        let h = heap.identity_hash(a).unwrap();
        assert_ne!(h, 0);
        assert_eq!(heap.identity_hash(a), Some(h));
    }
}
