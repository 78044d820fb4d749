// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Snapshot identities and identity-width encoding.
use std::fmt;

/// Opaque identity naming one object or type across both snapshot streams.
///
/// Identities are assigned by the dumping runtime and are never valid
/// references in the restoring process; every use goes through the
/// [`IdentityTable`](crate::IdentityTable).
///
/// The identity of a type is the identity of its type-descriptor object
/// (its mirror), so the class-dump stream and the heap stream share one
/// namespace.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Reserved "null / absent" identity.
    pub const NULL: Self = Self(0);

    /// Returns `true` for the reserved null identity.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:#x}", self.0)
    }
}

/// Width in bytes of every identity field in a snapshot stream.
///
/// Selected once per snapshot as the narrowest width that can hold every
/// assigned identity while keeping the all-ones value free for the
/// "no more records" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IdWidth {
    /// One byte.
    W1,
    /// Two bytes.
    W2,
    /// Four bytes.
    W4,
    /// Eight bytes.
    W8,
}

impl IdWidth {
    /// Number of bytes per identity.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::W1 => 1,
            Self::W2 => 2,
            Self::W4 => 4,
            Self::W8 => 8,
        }
    }

    /// Decodes the header byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::W1),
            2 => Some(Self::W2),
            4 => Some(Self::W4),
            8 => Some(Self::W8),
            _ => None,
        }
    }

    /// Raw value of the "no more records" sentinel (all ones at this width).
    #[must_use]
    pub const fn end_sentinel(self) -> u64 {
        match self {
            Self::W1 => u8::MAX as u64,
            Self::W2 => u16::MAX as u64,
            Self::W4 => u32::MAX as u64,
            Self::W8 => u64::MAX,
        }
    }

    /// Narrowest width whose sentinel stays above `max_id`.
    #[must_use]
    pub fn fitting(max_id: u64) -> Option<Self> {
        [Self::W1, Self::W2, Self::W4, Self::W8]
            .into_iter()
            .find(|w| max_id < w.end_sentinel())
    }

    /// Returns `true` if `id` can be written at this width.
    #[must_use]
    pub const fn holds(self, id: ObjectId) -> bool {
        id.0 < self.end_sentinel()
    }
}

/// Length sentinel for an absent variable-length array (distinct from empty).
pub const NO_ARRAY: u32 = u32::MAX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fitting_keeps_sentinel_free() {
        assert_eq!(IdWidth::fitting(0), Some(IdWidth::W1));
        assert_eq!(IdWidth::fitting(254), Some(IdWidth::W1));
        assert_eq!(IdWidth::fitting(255), Some(IdWidth::W2));
        assert_eq!(IdWidth::fitting(65_535), Some(IdWidth::W4));
        assert_eq!(IdWidth::fitting(u64::from(u32::MAX)), Some(IdWidth::W8));
        assert_eq!(IdWidth::fitting(u64::MAX), None);
    }

    #[test]
    fn header_byte_round_trips_only_for_legal_widths() {
        for w in [IdWidth::W1, IdWidth::W2, IdWidth::W4, IdWidth::W8] {
            assert_eq!(IdWidth::from_byte(w.bytes() as u8), Some(w));
        }
        assert_eq!(IdWidth::from_byte(3), None);
        assert_eq!(IdWidth::from_byte(0), None);
    }
}
