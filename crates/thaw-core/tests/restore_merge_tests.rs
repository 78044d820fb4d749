// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
use thaw_core::runtime::{names, LifecycleState, Runtime};
use thaw_core::{DumpOptions, FormatError, RestoreConfig, RestoreError, SnapshotLoaderProvider};
use thaw_dry_tests::universe::{APP_LOADER, CIRCLE, SHAPE};
use thaw_dry_tests::{
    app_loader_definition, create_loader, restore_into, snapshot_id, ClassBuilder, GraphMatcher,
    PresetLoaderProvider, Universe,
};

#[test]
fn predefined_types_and_loaders_are_reused() {
    let u = Universe::build().expect("build universe");
    let snap = u.snapshot(&DumpOptions::default()).expect("snapshot");

    let mut rt = Runtime::bootstrap().expect("bootstrap");
    let wk = *rt.well_known();
    let app_loader = rt
        .define_class(app_loader_definition(&wk).expect("loader definition"))
        .expect("predefine loader class");
    rt.initialize_class(app_loader).expect("initialize");
    let platform = create_loader(&mut rt, app_loader, None, "platform").expect("platform");
    let app = create_loader(&mut rt, app_loader, Some(platform), "app").expect("app");

    let mut loaders = PresetLoaderProvider::new()
        .with(snapshot_id(u.objects.platform), platform)
        .with(snapshot_id(u.objects.app), app);
    let r = restore_into(rt, &snap, &mut loaders, RestoreConfig::default()).expect("restore");

    assert_eq!(r.ty(&u.rt, u.types.app_loader), Some(app_loader));
    assert_eq!(r.object(u.objects.platform), Some(platform));
    assert_eq!(r.object(u.objects.app), Some(app));
    assert_eq!(
        loaders.requests(),
        [
            (snapshot_id(u.objects.platform), SHAPE.to_owned()),
            (snapshot_id(u.objects.app), CIRCLE.to_owned()),
        ]
    );
    assert_eq!(loaders.distinct_requests(), 2);

    let circle = r.rt.find_defined(CIRCLE, Some(app)).expect("circle under app");
    assert_eq!(r.ty(&u.rt, u.types.circle), Some(circle));
    assert_eq!(
        r.rt.class(app_loader).expect("loader class").state,
        LifecycleState::FullyInitialized
    );
    assert_eq!(r.rt.loader_parent(app).expect("parent"), Some(platform));

    let mut m = GraphMatcher::new(&u.rt, &r.rt);
    m.statics(u.types.circle, circle).expect("circle statics");
    let node = r.ty(&u.rt, u.types.node).expect("node");
    m.statics(u.types.node, node).expect("node statics");
}

#[test]
fn structural_mismatch_with_a_predefined_type_is_fatal() {
    let u = Universe::build().expect("build universe");
    let snap = u.snapshot(&DumpOptions::default()).expect("snapshot");

    let mut rt = Runtime::bootstrap().expect("bootstrap");
    let wk = *rt.well_known();
    let divergent = ClassBuilder::new(APP_LOADER)
        .extends(wk.class_loader, names::CLASS_LOADER)
        .field("cache", "Ljava/lang/Object;")
        .method("<init>", "(Ljava/lang/ClassLoader;)V", thaw_core::runtime::access::PUBLIC)
        .build()
        .expect("divergent definition");
    rt.define_class(divergent).expect("predefine divergent class");

    let err = restore_into(rt, &snap, &mut SnapshotLoaderProvider, RestoreConfig::default())
        .expect_err("mismatch");
    assert!(err.is_fatal());
    let RestoreError::Format(FormatError::PredefinedMismatch { name, ours, theirs, .. }) = &err else {
        unreachable!("expected a predefined mismatch, got {err}");
    };
    assert_eq!(name, APP_LOADER);
    assert_ne!(ours, theirs);
}
