// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for Thaw crates.
#![forbid(unsafe_code)]
//!
//! This crate provides the source universes, loader doubles and graph
//! comparison the Thaw test suites share.
//!
//! # Modules
//!
//! - [`classes`] - Class-definition builder with a consistent constant pool
//! - [`graph`] - Structural object-graph comparison across runtimes
//! - [`harness`] - One-call restore and source-to-target lookups
//! - [`loaders`] - Loader creation and a preset loader provider
//! - [`universe`] - A populated demo runtime and its snapshot

pub mod classes;
pub mod graph;
pub mod harness;
pub mod loaders;
pub mod universe;

// Re-export commonly used items at crate root for convenience
pub use classes::ClassBuilder;
pub use graph::{snapshot_id, GraphMatcher, Mismatch};
pub use harness::{restore_fresh, restore_into, Restored};
pub use loaders::{create_loader, PresetLoaderProvider};
pub use universe::{app_loader_definition, DemoObjects, DemoTypes, Snapshot, Universe};
