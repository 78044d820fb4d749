// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Constants of the class-dump format and the producer feature vector.
use crate::config::{DumpOptions, MismatchPolicy, RestoreConfig};
use crate::error::{RestoreError, Unsupported};

/// Class-dump header string.
pub const CLASS_MAGIC: [u8; 16] = *b"THAW CLASS DUMP\0";
/// Heap-dump header string.
pub const HEAP_MAGIC: [u8; 16] = *b"THAW HEAP DUMP\0\0";
/// Format version this build reads and writes.
pub const FORMAT_VERSION: u16 = 1;

/// Constant-pool tags beyond the JVM's, for resolution states.
pub mod cp_tag {
    /// Class constant, never resolved.
    pub const UNRESOLVED_CLASS: u8 = 100;
    /// Class constant whose resolution failed.
    pub const CLASS_IN_ERROR: u8 = 101;
    /// Method-handle constant whose resolution failed.
    pub const METHOD_HANDLE_IN_ERROR: u8 = 102;
    /// Method-type constant whose resolution failed.
    pub const METHOD_TYPE_IN_ERROR: u8 = 103;
    /// Dynamic constant whose resolution failed.
    pub const DYNAMIC_IN_ERROR: u8 = 104;
}

/// Tags of a method entry link slot.
pub mod link_tag {
    /// Empty slot.
    pub const NONE: u8 = 0;
    /// Type identity.
    pub const TYPE: u8 = 1;
    /// Member description.
    pub const METHOD: u8 = 2;
    /// Dispatch index; carries no payload and is cleared on parse.
    pub const STALE_INDEX: u8 = 3;
}

/// States of an invoke-dynamic entry.
pub mod indy_state {
    /// Not linked.
    pub const UNRESOLVED: u8 = 0;
    /// Linked: adapter description plus appendix identity.
    pub const RESOLVED: u8 = 1;
    /// Bootstrap failed: resolution error follows.
    pub const ERROR: u8 = 2;
}

/// Producer-side feature flags recorded in the header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Features {
    /// Runtime-invisible annotations were recorded.
    pub invisible_annotations: bool,
}

impl Features {
    const INVISIBLE_ANNOTATIONS_BIT: u32 = 0;
    const KNOWN_BITS: u32 = 1;

    /// Flags produced by a dump with `options`.
    #[must_use]
    pub const fn from_options(options: &DumpOptions) -> Self {
        Self {
            invisible_annotations: options.preserve_invisible_annotations,
        }
    }

    /// Bit-vector bytes (bit `n` is bit `n % 8` of byte `n / 8`).
    #[must_use]
    pub fn to_bytes(self) -> Vec<u8> {
        let mut bits = 0u8;
        if self.invisible_annotations {
            bits |= 1 << Self::INVISIBLE_ANNOTATIONS_BIT;
        }
        vec![bits]
    }

    /// Decodes the bit vector, refusing bits this build does not know.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Unsupported> {
        for (i, b) in bytes.iter().enumerate() {
            for bit in 0..8u32 {
                let n = i as u32 * 8 + bit;
                if b & (1 << bit) != 0 && n >= Self::KNOWN_BITS {
                    return Err(Unsupported::UnknownFeature(n));
                }
            }
        }
        Ok(Self {
            invisible_annotations: bytes
                .first()
                .is_some_and(|b| b & (1 << Self::INVISIBLE_ANNOTATIONS_BIT) != 0),
        })
    }

    /// Compares recorded flags with local policy and applies the mismatch policy.
    pub fn check_against(self, config: &RestoreConfig) -> Result<(), RestoreError> {
        let recorded = self.invisible_annotations;
        let local = config.preserve_invisible_annotations;
        if recorded == local {
            return Ok(());
        }
        match config.feature_mismatch {
            MismatchPolicy::Ignore => Ok(()),
            MismatchPolicy::Warn => {
                tracing::warn!(
                    recorded,
                    local,
                    "invisible-annotation preservation differs from the snapshot; restored metadata may be lossy"
                );
                Ok(())
            }
            MismatchPolicy::Fail => Err(Unsupported::FeatureMismatch {
                feature: "preserve_invisible_annotations",
                recorded,
                local,
            }
            .into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn unknown_feature_bits_are_unsupported() {
        assert_eq!(
            Features::from_bytes(&[0b10]),
            Err(Unsupported::UnknownFeature(1))
        );
        assert_eq!(
            Features::from_bytes(&[0, 0x01]),
            Err(Unsupported::UnknownFeature(8))
        );
        let f = Features::from_bytes(&[1]).unwrap();
        assert!(f.invisible_annotations);
        assert_eq!(Features::from_bytes(&f.to_bytes()).unwrap(), f);
    }

    #[test]
    fn mismatch_policy_decides_outcome() {
        let recorded = Features {
            invisible_annotations: true,
        };
        let mut cfg = RestoreConfig::default();
        assert!(recorded.check_against(&cfg).is_ok());
        cfg.feature_mismatch = MismatchPolicy::Fail;
        let err = recorded.check_against(&cfg).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::Unsupported(Unsupported::FeatureMismatch { .. })
        ));
        cfg.preserve_invisible_annotations = true;
        assert!(recorded.check_against(&cfg).is_ok());
    }
}
