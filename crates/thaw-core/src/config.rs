// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Restore and dump policy, loadable from JSON.
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error while reading.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// What to do when a producer feature flag differs from local policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
    /// Accept silently.
    Ignore,
    /// Accept and log a warning; the restored state may be lossy.
    #[default]
    Warn,
    /// Refuse the snapshot.
    Fail,
}

/// Restore-side policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Reaction to producer feature flags that differ from local policy.
    pub feature_mismatch: MismatchPolicy,
    /// Keep runtime-invisible annotations when the snapshot carries them.
    pub preserve_invisible_annotations: bool,
    /// Treat an unreproducible identity hash on a snapshot-created object as
    /// fatal. Objects the runtime pre-created only ever warn.
    pub verify_identity_hashes: bool,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            feature_mismatch: MismatchPolicy::Warn,
            preserve_invisible_annotations: false,
            verify_identity_hashes: true,
        }
    }
}

impl RestoreConfig {
    /// Parses a JSON document; absent keys take their defaults.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Reads and parses a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read(path)?)
    }
}

/// Dump-side policy; determines the producer feature flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpOptions {
    /// Record runtime-invisible annotations.
    pub preserve_invisible_annotations: bool,
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let cfg = RestoreConfig::from_json(br#"{"feature_mismatch":"fail"}"#).unwrap();
        assert_eq!(cfg.feature_mismatch, MismatchPolicy::Fail);
        assert!(cfg.verify_identity_hashes);
        assert!(!cfg.preserve_invisible_annotations);
        assert_eq!(RestoreConfig::from_json(b"{}").unwrap(), RestoreConfig::default());
    }

    #[test]
    fn unknown_policy_is_rejected() {
        assert!(RestoreConfig::from_json(br#"{"feature_mismatch":"shrug"}"#).is_err());
    }
}
