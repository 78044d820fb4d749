// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! thaw-core: portable snapshot restore of a managed runtime's class
//! metadata and heap.
//!
//! A snapshot is two streams sharing one identity namespace: the class
//! dump ([`codec`]) and the heap snapshot ([`heap`]). Restoring reads the
//! class dump first, driving every type through the runtime's ordinary
//! lifecycle, then materializes the object graph on demand and completes
//! initialization of the types that needed heap data.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::suboptimal_flops,
    clippy::redundant_pub_crate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::use_self
)]

/// Class-dump stream: writer, parser and deferred references.
pub mod codec;
/// Heap snapshot: records, dumper and captured threads.
pub mod heap;
/// Restore sessions, loader preparation and the object graph restorer.
pub mod restore;
/// The managed runtime restored into.
pub mod runtime;

mod config;
mod error;
mod ident;
mod identity;

/// Restore and dump policy.
pub use config::{ConfigError, DumpOptions, MismatchPolicy, RestoreConfig};
/// Error taxonomy: I/O, format violations, unsupported features.
pub use error::{DumpError, FormatError, Relation, RestoreError, Unsupported};
/// Snapshot identities.
pub use ident::{IdWidth, ObjectId};
/// Identity ↔ live reference bookkeeping.
pub use identity::{IdentityTable, LiveRef};
pub use restore::{LoaderContext, LoaderProvider, ParsedUnit, RestoreSession, SnapshotLoaderProvider};
