// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! One-call restore into a fresh runtime, plus source-to-target lookups.

use thaw_core::heap::RestoredThread;
use thaw_core::runtime::{ObjRef, Runtime, TypeRef};
use thaw_core::{
    IdentityTable, LiveRef, LoaderProvider, ParsedUnit, RestoreConfig, RestoreError,
    RestoreSession, SnapshotLoaderProvider,
};

use crate::graph::snapshot_id;
use crate::universe::Snapshot;

/// Outcome of a complete restore.
#[derive(Debug)]
pub struct Restored {
    /// Runtime restored into.
    pub rt: Runtime,
    /// What parsing the class dump produced.
    pub unit: ParsedUnit,
    /// Restored thread stacks.
    pub threads: Vec<RestoredThread>,
    /// Final identity table.
    pub ids: IdentityTable,
}

impl Restored {
    /// Restored counterpart of source object `src`.
    pub fn object(&self, src: ObjRef) -> Option<ObjRef> {
        match self.ids.get(snapshot_id(src))? {
            LiveRef::Object(o) => Some(o),
            LiveRef::Type(t) => self.rt.mirror(t),
        }
    }

    /// Restored counterpart of source type `t` of `src_rt`.
    pub fn ty(&self, src_rt: &Runtime, t: TypeRef) -> Option<TypeRef> {
        let mirror = src_rt.mirror(t)?;
        self.ids.type_of(snapshot_id(mirror)).ok()
    }
}

/// Restores `snapshot` into `rt` with `loaders`, running both phases.
pub fn restore_into(
    mut rt: Runtime,
    snapshot: &Snapshot,
    loaders: &mut dyn LoaderProvider,
    config: RestoreConfig,
) -> Result<Restored, RestoreError> {
    let (unit, threads, ids) = {
        let mut session = RestoreSession::new(&mut rt, &snapshot.heap, loaders, config);
        let unit = session.parse_from(snapshot.classes.as_slice())?;
        let threads = session.restore_heap(&unit, snapshot.heap.threads())?;
        (unit, threads, session.finish())
    };
    Ok(Restored {
        rt,
        unit,
        threads,
        ids,
    })
}

/// Restores `snapshot` into a freshly bootstrapped runtime, preparing
/// loaders from the heap.
pub fn restore_fresh(snapshot: &Snapshot, config: RestoreConfig) -> Result<Restored, RestoreError> {
    restore_into(
        Runtime::bootstrap()?,
        snapshot,
        &mut SnapshotLoaderProvider,
        config,
    )
}
