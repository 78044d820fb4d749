// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Constant pool entries and resolution state.
use super::class::TypeRef;
use super::RuntimeError;

/// JVM constant-pool tags.
pub mod tag {
    /// `CONSTANT_Utf8`.
    pub const UTF8: u8 = 1;
    /// `CONSTANT_Integer`.
    pub const INTEGER: u8 = 3;
    /// `CONSTANT_Float`.
    pub const FLOAT: u8 = 4;
    /// `CONSTANT_Long`.
    pub const LONG: u8 = 5;
    /// `CONSTANT_Double`.
    pub const DOUBLE: u8 = 6;
    /// `CONSTANT_Class`.
    pub const CLASS: u8 = 7;
    /// `CONSTANT_String`.
    pub const STRING: u8 = 8;
    /// `CONSTANT_Fieldref`.
    pub const FIELD_REF: u8 = 9;
    /// `CONSTANT_Methodref`.
    pub const METHOD_REF: u8 = 10;
    /// `CONSTANT_InterfaceMethodref`.
    pub const INTERFACE_METHOD_REF: u8 = 11;
    /// `CONSTANT_NameAndType`.
    pub const NAME_AND_TYPE: u8 = 12;
    /// `CONSTANT_MethodHandle`.
    pub const METHOD_HANDLE: u8 = 15;
    /// `CONSTANT_MethodType`.
    pub const METHOD_TYPE: u8 = 16;
    /// `CONSTANT_Dynamic`.
    pub const DYNAMIC: u8 = 17;
    /// `CONSTANT_InvokeDynamic`.
    pub const INVOKE_DYNAMIC: u8 = 18;
}

/// Error recorded when resolving a constant failed; rethrown on every retry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionError {
    /// Internal name of the error class.
    pub error_class: String,
    /// Detail message.
    pub message: Option<String>,
    /// Internal name of the cause's class.
    pub cause_class: Option<String>,
    /// Cause detail message.
    pub cause_message: Option<String>,
}

/// Resolution state of a class constant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClassSlot {
    /// Not resolved yet.
    Unresolved,
    /// Resolved to a live type.
    Resolved(TypeRef),
    /// Resolution failed.
    Error(ResolutionError),
}

/// One constant-pool slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CpEntry {
    /// Slot 0 and the upper half of a `Long`/`Double`.
    Invalid,
    /// Modified-UTF-8 string, stored decoded.
    Utf8(String),
    /// `int` literal.
    Integer(i32),
    /// `float` literal bits.
    Float(u32),
    /// `long` literal; occupies two slots.
    Long(i64),
    /// `double` literal bits; occupies two slots.
    Double(u64),
    /// Class reference.
    Class {
        /// `Utf8` index of the name.
        name_index: u16,
        /// Resolution state.
        slot: ClassSlot,
    },
    /// String literal.
    String {
        /// `Utf8` index of the contents.
        string_index: u16,
    },
    /// Field reference.
    FieldRef {
        /// `Class` index.
        class_index: u16,
        /// `NameAndType` index.
        name_and_type_index: u16,
    },
    /// Class method reference.
    MethodRef {
        /// `Class` index.
        class_index: u16,
        /// `NameAndType` index.
        name_and_type_index: u16,
    },
    /// Interface method reference.
    InterfaceMethodRef {
        /// `Class` index.
        class_index: u16,
        /// `NameAndType` index.
        name_and_type_index: u16,
    },
    /// Name and descriptor pair.
    NameAndType {
        /// `Utf8` index of the name.
        name_index: u16,
        /// `Utf8` index of the descriptor.
        descriptor_index: u16,
    },
    /// Method handle constant.
    MethodHandle {
        /// Reference kind (1..=9).
        kind: u8,
        /// Member reference index.
        reference_index: u16,
        /// Recorded resolution failure.
        error: Option<ResolutionError>,
    },
    /// Method type constant.
    MethodType {
        /// `Utf8` index of the descriptor.
        descriptor_index: u16,
        /// Recorded resolution failure.
        error: Option<ResolutionError>,
    },
    /// Dynamically-computed constant.
    Dynamic {
        /// Bootstrap method attribute index.
        bootstrap_index: u16,
        /// `NameAndType` index.
        name_and_type_index: u16,
        /// Recorded resolution failure.
        error: Option<ResolutionError>,
    },
    /// Dynamically-computed call site.
    InvokeDynamic {
        /// Bootstrap method attribute index.
        bootstrap_index: u16,
        /// `NameAndType` index.
        name_and_type_index: u16,
    },
}

impl CpEntry {
    /// JVM tag, independent of resolution state; 0 for [`CpEntry::Invalid`].
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Invalid => 0,
            Self::Utf8(_) => tag::UTF8,
            Self::Integer(_) => tag::INTEGER,
            Self::Float(_) => tag::FLOAT,
            Self::Long(_) => tag::LONG,
            Self::Double(_) => tag::DOUBLE,
            Self::Class { .. } => tag::CLASS,
            Self::String { .. } => tag::STRING,
            Self::FieldRef { .. } => tag::FIELD_REF,
            Self::MethodRef { .. } => tag::METHOD_REF,
            Self::InterfaceMethodRef { .. } => tag::INTERFACE_METHOD_REF,
            Self::NameAndType { .. } => tag::NAME_AND_TYPE,
            Self::MethodHandle { .. } => tag::METHOD_HANDLE,
            Self::MethodType { .. } => tag::METHOD_TYPE,
            Self::Dynamic { .. } => tag::DYNAMIC,
            Self::InvokeDynamic { .. } => tag::INVOKE_DYNAMIC,
        }
    }

    /// Returns `true` for the two-slot literals.
    #[must_use]
    pub const fn is_wide(&self) -> bool {
        matches!(self, Self::Long(_) | Self::Double(_))
    }
}

/// A class's constant pool.
///
/// Entries at or beyond `original_len` were appended by the runtime
/// (for example by bridge-method synthesis) rather than read from the
/// class definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstantPool {
    entries: Vec<CpEntry>,
    original_len: u16,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self {
            entries: vec![CpEntry::Invalid],
            original_len: 1,
        }
    }
}

impl ConstantPool {
    /// Rebuilds a pool from transcribed entries; slot 0 must be `Invalid`.
    #[must_use]
    pub fn from_entries(entries: Vec<CpEntry>, original_len: u16) -> Self {
        Self {
            entries,
            original_len,
        }
    }

    /// Number of slots, including slot 0.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the pool holds only slot 0.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    /// Slots contributed by the class definition.
    #[must_use]
    pub const fn original_len(&self) -> u16 {
        self.original_len
    }

    /// All slots.
    #[must_use]
    pub fn entries(&self) -> &[CpEntry] {
        &self.entries
    }

    /// Slot by index.
    #[must_use]
    pub fn get(&self, index: u16) -> Option<&CpEntry> {
        self.entries.get(usize::from(index))
    }

    /// Mutable slot by index.
    pub fn get_mut(&mut self, index: u16) -> Option<&mut CpEntry> {
        self.entries.get_mut(usize::from(index))
    }

    /// Tag sequence over the slots contributed by the class definition.
    pub fn original_tags(&self) -> impl Iterator<Item = u8> + '_ {
        self.entries
            .iter()
            .take(usize::from(self.original_len))
            .map(CpEntry::tag)
    }

    /// Decoded `Utf8` at `index`.
    #[must_use]
    pub fn utf8(&self, index: u16) -> Option<&str> {
        match self.get(index)? {
            CpEntry::Utf8(s) => Some(s),
            _ => None,
        }
    }

    /// Name of the class constant at `index`.
    #[must_use]
    pub fn class_name(&self, index: u16) -> Option<&str> {
        match self.get(index)? {
            CpEntry::Class { name_index, .. } => self.utf8(*name_index),
            _ => None,
        }
    }

    /// `(class name, member name, descriptor)` of a member reference.
    #[must_use]
    pub fn member_ref(&self, index: u16) -> Option<(&str, &str, &str)> {
        let (class_index, nat) = match self.get(index)? {
            CpEntry::FieldRef {
                class_index,
                name_and_type_index,
            }
            | CpEntry::MethodRef {
                class_index,
                name_and_type_index,
            }
            | CpEntry::InterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index),
            _ => return None,
        };
        let CpEntry::NameAndType {
            name_index,
            descriptor_index,
        } = self.get(nat)?
        else {
            return None;
        };
        Some((
            self.class_name(class_index)?,
            self.utf8(*name_index)?,
            self.utf8(*descriptor_index)?,
        ))
    }

    /// Marks the current end as the end of definition-contributed slots.
    pub fn seal(&mut self) -> Result<(), RuntimeError> {
        self.original_len = slot_index(self.entries.len())?;
        Ok(())
    }

    /// Appends an entry, reserving the second slot of wide literals.
    ///
    /// Fails once the pool would no longer fit a `u16` slot count.
    pub fn push(&mut self, entry: CpEntry) -> Result<u16, RuntimeError> {
        let wide = entry.is_wide();
        let index = slot_index(self.entries.len())?;
        slot_index(self.entries.len() + if wide { 2 } else { 1 })?;
        self.entries.push(entry);
        if wide {
            self.entries.push(CpEntry::Invalid);
        }
        Ok(index)
    }

    /// Interns a `Utf8`.
    pub fn add_utf8(&mut self, s: &str) -> Result<u16, RuntimeError> {
        let found = self
            .entries
            .iter()
            .position(|e| matches!(e, CpEntry::Utf8(x) if x == s));
        match found {
            Some(i) => slot_index(i),
            None => self.push(CpEntry::Utf8(s.to_owned())),
        }
    }

    /// Interns an unresolved class constant.
    pub fn add_class(&mut self, name: &str) -> Result<u16, RuntimeError> {
        let name_index = self.add_utf8(name)?;
        let found = self.entries.iter().position(
            |e| matches!(e, CpEntry::Class { name_index: n, .. } if *n == name_index),
        );
        match found {
            Some(i) => slot_index(i),
            None => self.push(CpEntry::Class {
                name_index,
                slot: ClassSlot::Unresolved,
            }),
        }
    }

    /// Adds a string literal.
    pub fn add_string(&mut self, s: &str) -> Result<u16, RuntimeError> {
        let string_index = self.add_utf8(s)?;
        self.push(CpEntry::String { string_index })
    }

    /// Adds a name-and-type pair.
    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, RuntimeError> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.push(CpEntry::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    /// Adds a field reference.
    pub fn add_field_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, RuntimeError> {
        let class_index = self.add_class(class)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.push(CpEntry::FieldRef {
            class_index,
            name_and_type_index,
        })
    }

    /// Adds a class or interface method reference.
    pub fn add_method_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
        interface: bool,
    ) -> Result<u16, RuntimeError> {
        let class_index = self.add_class(class)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        if interface {
            self.push(CpEntry::InterfaceMethodRef {
                class_index,
                name_and_type_index,
            })
        } else {
            self.push(CpEntry::MethodRef {
                class_index,
                name_and_type_index,
            })
        }
    }

    /// Adds an invoke-dynamic call site.
    pub fn add_invoke_dynamic(
        &mut self,
        bootstrap_index: u16,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, RuntimeError> {
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.push(CpEntry::InvokeDynamic {
            bootstrap_index,
            name_and_type_index,
        })
    }
}

fn slot_index(len: usize) -> Result<u16, RuntimeError> {
    u16::try_from(len).map_err(|_| RuntimeError::ConstantPoolFull(len))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn wide_literals_reserve_two_slots() {
        let mut cp = ConstantPool::default();
        let l = cp.push(CpEntry::Long(7)).unwrap();
        let next = cp.add_utf8("x").unwrap();
        assert_eq!(l, 1);
        assert_eq!(next, 3);
        assert_eq!(cp.get(2), Some(&CpEntry::Invalid));
    }

    #[test]
    fn member_ref_resolves_through_name_and_type() {
        let mut cp = ConstantPool::default();
        let idx = cp.add_field_ref("demo/Node", "next", "Ldemo/Node;").unwrap();
        assert_eq!(cp.member_ref(idx), Some(("demo/Node", "next", "Ldemo/Node;")));
        assert_eq!(cp.add_class("demo/Node"), cp.add_class("demo/Node"));
    }

    #[test]
    fn original_tags_stop_at_seal() {
        let mut cp = ConstantPool::default();
        cp.add_utf8("a").unwrap();
        cp.seal().unwrap();
        cp.add_string("synth").unwrap();
        let tags: Vec<u8> = cp.original_tags().collect();
        assert_eq!(tags, vec![0, tag::UTF8]);
    }

    #[test]
    fn pool_never_outgrows_u16_slot_indices() {
        let mut cp = ConstantPool::default();
        for i in 1..u16::MAX {
            assert_eq!(cp.push(CpEntry::Integer(i32::from(i))).unwrap(), i);
        }
        assert_eq!(cp.len(), usize::from(u16::MAX));
        assert_eq!(
            cp.push(CpEntry::Integer(0)),
            Err(RuntimeError::ConstantPoolFull(usize::from(u16::MAX) + 1))
        );
        assert_eq!(
            cp.add_utf8("late"),
            Err(RuntimeError::ConstantPoolFull(usize::from(u16::MAX) + 1))
        );
        assert_eq!(cp.len(), usize::from(u16::MAX));
        cp.seal().unwrap();
    }

    #[test]
    fn wide_literal_needs_both_slots_free() {
        let mut cp = ConstantPool::default();
        for i in 1..u16::MAX - 1 {
            cp.push(CpEntry::Integer(i32::from(i))).unwrap();
        }
        assert_eq!(cp.len(), usize::from(u16::MAX) - 1);
        assert!(cp.push(CpEntry::Long(1)).is_err());
        assert_eq!(cp.push(CpEntry::Integer(0)).unwrap(), u16::MAX - 1);
    }
}
