// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error types for dumping and restoring snapshots.
//!
//! Restore distinguishes three classes. I/O failures are reported to the
//! caller, which decides whether to abort. Format and consistency
//! violations are always fatal: the snapshot is trusted to come from a
//! compatible runtime, so a violation means corruption or a version
//! mismatch. Unsupported features are fatal too, but carry their own
//! variant so the specific incompatibility is diagnosable.
use std::io;

use thiserror::Error;

use crate::ident::ObjectId;
use crate::runtime::{LifecycleState, RuntimeError};

/// Which ordering relation a class record violated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    /// The record's supertype.
    Super,
    /// One of the record's declared interfaces.
    Interface,
    /// The type of the record's defining loader.
    DefiningLoader,
    /// The type of the defining loader's parent.
    LoaderParent,
}

/// Consistency violations in a snapshot stream. Always fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// The stream ended inside a record.
    #[error("snapshot truncated")]
    Truncated,
    /// The header string is not ours.
    #[error("bad magic: {found:?}")]
    BadMagic {
        /// Bytes found.
        found: Vec<u8>,
    },
    /// The format version is not the one this build reads.
    #[error("unsupported format version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found.
        found: u16,
        /// Version this build reads.
        expected: u16,
    },
    /// The identity width byte is not 1, 2, 4 or 8.
    #[error("bad identity width {0}")]
    BadIdWidth(u8),
    /// A tag byte has no meaning in its position.
    #[error("illegal {what} tag {tag}")]
    IllegalTag {
        /// What kind of tag was being read.
        what: &'static str,
        /// Value found.
        tag: u8,
    },
    /// A string is not valid UTF-8.
    #[error("invalid UTF-8 in string")]
    InvalidUtf8,
    /// A record names a dependency that has not been restored yet.
    #[error("{relation:?} {id} of class record {class} is not restored yet")]
    OrderingViolation {
        /// Violated relation.
        relation: Relation,
        /// Identity of the missing dependency.
        id: ObjectId,
        /// Name of the class being parsed.
        class: String,
    },
    /// An identity is in neither the class nor the heap namespace.
    #[error("identity {0} is unknown")]
    MissingIdentity(ObjectId),
    /// An identity names a type where an object was required, or vice versa.
    #[error("identity {id} is not {expected}")]
    IdentityKindMismatch {
        /// Offending identity.
        id: ObjectId,
        /// Expected kind.
        expected: &'static str,
    },
    /// An identity was bound to two different live entities.
    #[error("identity {0} is bound twice")]
    DuplicateIdentity(ObjectId),
    /// A reference field received a value of an unrelated type.
    #[error("{holder}.{field} ({descriptor}) cannot hold a {actual}")]
    FieldTypeMismatch {
        /// Class declaring the field (or the array type).
        holder: String,
        /// Field name, or `[]` for array elements.
        field: String,
        /// Declared descriptor.
        descriptor: String,
        /// Runtime type of the value.
        actual: String,
    },
    /// A predefined type differs structurally from its class record.
    #[error("predefined {name} differs from snapshot: {detail} (digest {ours} vs {theirs})")]
    PredefinedMismatch {
        /// Class name.
        name: String,
        /// First difference found.
        detail: String,
        /// Short structural digest of the predefined type.
        ours: String,
        /// Short structural digest of the record.
        theirs: String,
    },
    /// A member description names nothing in its holder.
    #[error("{holder} has no member {name}{signature}")]
    MemberNotFound {
        /// Holder class name.
        holder: String,
        /// Member name.
        name: String,
        /// Member descriptor.
        signature: String,
    },
    /// Recomputed dispatch tables disagree with the recorded sizes.
    #[error("{name}: recorded {table} length {expected}, recomputed {actual}")]
    LayoutMismatch {
        /// Class name.
        name: String,
        /// `"vtable"` or `"itable"`.
        table: &'static str,
        /// Recorded length.
        expected: usize,
        /// Recomputed length.
        actual: usize,
    },
    /// A record is internally inconsistent.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),
    /// A recorded identity hash could not be reproduced on a restored object.
    #[error("identity hash of {id} is {existing:#x}, snapshot recorded {recorded:#x}")]
    IdentityHashConflict {
        /// Object identity.
        id: ObjectId,
        /// Hash the object carries.
        existing: u32,
        /// Hash the snapshot recorded.
        recorded: u32,
    },
}

/// Optional features the restoring side cannot honour.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Unsupported {
    /// The producer set a feature bit this build does not know.
    #[error("unknown producer feature bit {0}")]
    UnknownFeature(u32),
    /// A recorded feature differs from local policy and policy says fail.
    #[error("producer feature {feature} is {recorded}, local policy is {local}")]
    FeatureMismatch {
        /// Feature name.
        feature: &'static str,
        /// Value in the snapshot.
        recorded: bool,
        /// Local policy.
        local: bool,
    },
    /// The class was transformed by an external agent.
    #[error("class {0} was modified by an agent")]
    ModifiedByAgent(String),
    /// A record targets a state restore cannot reach.
    #[error("class {name} targets state {state:?}")]
    TargetState {
        /// Class name.
        name: String,
        /// Recorded target state.
        state: LifecycleState,
    },
}

/// Error returned by restore operations.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// Open/read/seek failure. Not fatal to the caller.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Format or consistency violation. Fatal.
    #[error(transparent)]
    Format(#[from] FormatError),
    /// Optional feature unavailable. Fatal.
    #[error("unsupported: {0}")]
    Unsupported(#[from] Unsupported),
}

impl RestoreError {
    /// Returns `false` only for I/O failures.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Io(_))
    }

    /// Descriptive message for reporting I/O failures.
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl From<RuntimeError> for FormatError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::LayoutMismatch {
                name,
                table,
                expected,
                actual,
            } => Self::LayoutMismatch {
                name,
                table,
                expected,
                actual,
            },
            RuntimeError::NoSuchField { holder, name } => Self::MemberNotFound {
                holder,
                name,
                signature: String::new(),
            },
            RuntimeError::NoSuchMethod {
                holder,
                name,
                signature,
            } => Self::MemberNotFound {
                holder,
                name,
                signature,
            },
            other => Self::CorruptRecord(other.to_string()),
        }
    }
}

impl From<RuntimeError> for RestoreError {
    fn from(e: RuntimeError) -> Self {
        Self::Format(e.into())
    }
}

/// Error returned by [`dump`](crate::codec::dump).
#[derive(Debug, Error)]
pub enum DumpError {
    /// Create/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The target exists and overwriting was not requested.
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// Too many objects for any identity width.
    #[error("identity space exhausted")]
    IdSpaceExhausted,
    /// The runtime holds state that cannot be transcribed.
    #[error("cannot dump: {0}")]
    Inconsistent(String),
}

impl From<RuntimeError> for DumpError {
    fn from(e: RuntimeError) -> Self {
        Self::Inconsistent(e.to_string())
    }
}

impl DumpError {
    /// Descriptive message for the caller to report.
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_io_is_non_fatal() {
        let io = RestoreError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(!io.is_fatal());
        assert!(io.message().contains("gone"));
        assert!(RestoreError::from(FormatError::Truncated).is_fatal());
        assert!(RestoreError::from(Unsupported::UnknownFeature(5)).is_fatal());
    }

    #[test]
    fn runtime_layout_errors_keep_their_shape() {
        let e = FormatError::from(RuntimeError::LayoutMismatch {
            name: "demo/A".into(),
            table: "itable",
            expected: 3,
            actual: 2,
        });
        assert!(matches!(e, FormatError::LayoutMismatch { expected: 3, .. }));
    }
}
