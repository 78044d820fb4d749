// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
use std::sync::{mpsc, Arc};
use std::thread;

use thaw_core::runtime::{names, LifecycleState, Runtime, TypeRef};
use thaw_core::{DumpOptions, RestoreConfig, RestoreSession, SnapshotLoaderProvider};
use thaw_dry_tests::{ClassBuilder, Universe};

#[test]
fn waiters_only_observe_final_states() {
    let u = Universe::build().expect("build universe");
    let snap = u.snapshot(&DumpOptions::default()).expect("snapshot");
    let mut rt = Runtime::bootstrap().expect("bootstrap");
    let gate = rt.restore_gate();
    let (tx, rx) = mpsc::channel::<Vec<TypeRef>>();
    let (first_tx, first_rx) = mpsc::channel::<TypeRef>();

    let (released, also_released) = thread::scope(|s| {
        let waiting = Arc::clone(&gate);
        let waiter = s.spawn(move || {
            let pending = rx.recv().expect("pending types");
            assert!(!pending.is_empty());
            pending
                .into_iter()
                .map(|t| waiting.wait_until_restored(t))
                .collect::<Vec<_>>()
        });
        let also_waiting = Arc::clone(&gate);
        let second = s.spawn(move || {
            let t = first_rx.recv().expect("first pending type");
            also_waiting.wait_until_restored(t)
        });

        let mut loaders = SnapshotLoaderProvider;
        let mut session =
            RestoreSession::new(&mut rt, &snap.heap, &mut loaders, RestoreConfig::default());
        let unit = session.parse_from(snap.classes.as_slice()).expect("parse");
        let mut unfilled: Vec<_> = unit.unfilled.iter().map(|(t, _)| *t).collect();
        unfilled.sort_unstable();
        assert_eq!(gate.marked(), unfilled);
        for (_, t) in &unit.types {
            if !unfilled.contains(t) {
                assert!(!gate.is_marked(*t));
            }
        }
        let pending = gate.marked();
        first_tx.send(pending[0]).expect("send first");
        tx.send(pending).expect("send");

        session
            .restore_heap(&unit, snap.heap.threads())
            .expect("restore heap");
        (
            waiter.join().expect("waiter"),
            second.join().expect("second waiter"),
        )
    });

    assert_eq!(also_released, released[0]);
    assert_eq!(gate.marked_count(), 0);
    assert!(!released.is_empty());
    for r in &released {
        let state = r.state.expect("published");
        assert!(state.is_terminal(), "{:?} released in {state:?}", r.ty);
        assert_eq!(rt.class(r.ty).expect("class").state, state);
    }
    assert!(released
        .iter()
        .any(|r| r.state == Some(LifecycleState::InitializationError)));
}

#[test]
fn types_outside_the_restore_never_block() {
    let u = Universe::build().expect("build universe");
    let snap = u.snapshot(&DumpOptions::default()).expect("snapshot");
    let mut rt = Runtime::bootstrap().expect("bootstrap");
    let gate = rt.restore_gate();
    let wk = *rt.well_known();
    let local = rt
        .define_class(
            ClassBuilder::new("local/Extra")
                .extends(wk.object, names::OBJECT)
                .build()
                .expect("local definition"),
        )
        .expect("local class");

    let mut loaders = SnapshotLoaderProvider;
    let mut session = RestoreSession::new(&mut rt, &snap.heap, &mut loaders, RestoreConfig::default());
    let unit = session.parse_from(snap.classes.as_slice()).expect("parse");
    let linked = unit
        .types
        .iter()
        .map(|(_, t)| *t)
        .find(|t| session.runtime().class(*t).is_ok_and(|c| c.state == LifecycleState::Linked))
        .expect("a linked type");

    let released = thread::scope(|s| {
        let a = s.spawn(|| gate.wait_until_restored(local));
        let b = s.spawn(|| gate.wait_until_restored(linked));
        (a.join().expect("local"), b.join().expect("linked"))
    });
    assert_eq!(released.0.state, None);
    assert_eq!(released.1.state, Some(LifecycleState::Linked));
    assert!(gate.marked_count() > 0, "heap-dependent types stay marked");
    drop(session);
}
