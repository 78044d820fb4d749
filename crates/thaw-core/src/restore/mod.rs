// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Restore: class dump first, heap second.
//!
//! A [`RestoreSession`] owns the identity table for the whole restore.
//! [`RestoreSession::parse`] defines every type of the class dump and
//! returns a [`ParsedUnit`] describing what the heap phase still owes;
//! [`RestoreSession::restore_heap`] settles it.
mod lifecycle;
mod loader;
mod objects;
mod reconcile;
mod resolve;
mod session;
mod strings;

pub use loader::{LoaderContext, LoaderProvider, SnapshotLoaderProvider};
pub use session::RestoreSession;

use crate::codec::Features;
use crate::ident::ObjectId;
use crate::runtime::{LifecycleState, TypeRef};

/// Initialization a type still owes once the heap is available.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnfilledTypeInfo {
    /// Terminal state the type reached when dumped.
    pub target: LifecycleState,
    /// Identity of the initialization error, or null.
    pub init_error: ObjectId,
}

/// A resolved call site whose appendix object lives in the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingAppendix {
    /// Type owning the linkage cache.
    pub ty: TypeRef,
    /// Call-site entry index.
    pub entry: usize,
    /// Identity of the appendix.
    pub appendix: ObjectId,
}

/// Result of parsing a class dump.
#[derive(Clone, Debug, Default)]
pub struct ParsedUnit {
    /// Types of the class records, in stream order.
    pub types: Vec<(ObjectId, TypeRef)>,
    /// Types left `BeingInitialized`, with what completes them.
    pub unfilled: Vec<(TypeRef, UnfilledTypeInfo)>,
    /// Call-site appendices to install from the heap.
    pub appendices: Vec<PendingAppendix>,
    /// Producer feature flags.
    pub features: Features,
}
