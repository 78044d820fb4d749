// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
use thaw_core::codec::dump;
use thaw_core::heap::{FrameValue, HeapSnapshot};
use thaw_core::runtime::{
    fields, CpEntry, ClassSlot, LifecycleState, Link, MethodKind, Runtime, TypeRef, Value,
};
use thaw_core::{
    DumpError, DumpOptions, RestoreConfig, RestoreError, RestoreSession, SnapshotLoaderProvider,
};
use thaw_dry_tests::universe::{BROKEN_MESSAGE, CIRCLE, NODE, WIDE_NAME};
use thaw_dry_tests::{restore_fresh, GraphMatcher, Restored, Universe};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn restored_universe() -> (Universe, Restored) {
    init_tracing();
    let u = Universe::build().expect("build universe");
    let snap = u.snapshot(&DumpOptions::default()).expect("snapshot");
    let r = restore_fresh(&snap, RestoreConfig::default()).expect("restore");
    (u, r)
}

fn ty(u: &Universe, r: &Restored, t: TypeRef) -> TypeRef {
    r.ty(&u.rt, t).expect("type restored")
}

fn reference(v: Value) -> thaw_core::runtime::ObjRef {
    v.as_reference().flatten().expect("non-null reference")
}

#[test]
fn restored_types_reach_their_recorded_states() {
    let (u, r) = restored_universe();
    let t = u.types;
    for (src, expected) in [
        (t.app_loader, LifecycleState::FullyInitialized),
        (t.shape, LifecycleState::FullyInitialized),
        (t.circle, LifecycleState::FullyInitialized),
        (t.node, LifecycleState::FullyInitialized),
        (t.registry, LifecycleState::FullyInitialized),
        (t.broken, LifecycleState::InitializationError),
        (t.lazy, LifecycleState::Linked),
        (t.unlinked, LifecycleState::Loaded),
    ] {
        let dst = ty(&u, &r, src);
        let c = r.rt.class(dst).expect("class");
        assert_eq!(c.state, expected, "{}", c.name);
        assert_eq!(c.name, u.rt.class(src).expect("src class").name);
    }
    assert_eq!(r.rt.restore_gate().marked_count(), 0);

    let broken = ty(&u, &r, t.broken);
    let error = r.rt.instance(broken).expect("broken").init_error.expect("init error");
    let message = reference(r.rt.get_field(error, fields::THROWABLE_MESSAGE).expect("message"));
    assert_eq!(r.rt.string_value(message).as_deref(), Some(BROKEN_MESSAGE));
    assert!(r
        .unit
        .unfilled
        .iter()
        .any(|(t, info)| *t == broken && info.target == LifecycleState::InitializationError));
}

#[test]
fn object_graph_and_statics_are_isomorphic() {
    let (u, r) = restored_universe();
    let t = u.types;
    let mut m = GraphMatcher::new(&u.rt, &r.rt);
    for src in [t.circle, t.node, t.registry, t.broken, t.lazy] {
        m.statics(src, ty(&u, &r, src)).expect("statics match");
    }
    let o = u.objects;
    m.matches(Some(o.thread), r.object(o.thread), "thread")
        .expect("thread matches");
    assert_eq!(m.counterpart(o.head), r.object(o.head));
    assert_eq!(m.counterpart(o.grid), r.object(o.grid));

    let head = r.object(o.head).expect("head");
    let tail = reference(r.rt.get_field(head, "next").expect("next"));
    assert_eq!(r.rt.get_field(tail, "next").expect("next"), Value::Ref(Some(head)));
}

#[test]
fn loaders_keep_their_hierarchy_and_initiating_entries() {
    let (u, r) = restored_universe();
    let platform = r.object(u.objects.platform).expect("platform");
    let app = r.object(u.objects.app).expect("app");
    assert_eq!(r.rt.loader_parent(app).expect("parent"), Some(platform));
    assert_eq!(r.rt.loader_parent(platform).expect("parent"), None);

    let name = reference(r.rt.get_field(app, fields::LOADER_NAME).expect("name"));
    assert_eq!(r.rt.string_value(name).as_deref(), Some("app"));

    let shape = ty(&u, &r, u.types.shape);
    let circle = ty(&u, &r, u.types.circle);
    assert_eq!(r.rt.class(shape).expect("shape").loader, Some(platform));
    assert_eq!(r.rt.class(circle).expect("circle").loader, Some(app));
    assert!(r.rt.initiating_entries().contains(&(app, shape)));
    assert_eq!(r.rt.find_defined(CIRCLE, Some(app)), Some(circle));
}

#[test]
fn special_objects_follow_the_restoring_runtime() {
    let (u, r) = restored_universe();
    let registry = ty(&u, &r, u.types.registry);
    let node = ty(&u, &r, u.types.node);

    let handle = reference(r.rt.static_value(registry, "HANDLE").expect("HANDLE"));
    let offset = r.rt.field_offset(node, "value", "I").expect("offset");
    assert_eq!(
        r.rt.get_field(handle, fields::MEMBER_VMINDEX).expect("vmindex"),
        Value::Long(i64::from(offset))
    );

    let site = reference(r.rt.static_value(registry, "SITE").expect("SITE"));
    let context = r.rt.call_site_context(site).expect("context registered");
    assert_eq!(
        r.rt.get_field(site, fields::CALL_SITE_CONTEXT).expect("context field"),
        Value::Ref(Some(context))
    );
    assert_eq!(
        r.rt.get_field(context, "vmdependencies").expect("dependencies"),
        Value::Long(0),
        "dependency context starts empty"
    );
    assert_ne!(
        u.rt.get_field(u.objects.context, "vmdependencies").expect("src dependencies"),
        Value::Long(0)
    );
}

#[test]
fn interned_strings_stay_canonical() {
    let (u, r) = restored_universe();
    let registry = ty(&u, &r, u.types.registry);
    let circle = ty(&u, &r, u.types.circle);

    let names = reference(r.rt.static_value(registry, "NAMES").expect("NAMES"));
    let elements = r.rt.elements(names).expect("elements").to_vec();
    let [Some(alpha), Some(beta), Some(wide)] = elements[..] else {
        unreachable!("NAMES should hold three strings, got {elements:?}");
    };
    assert_eq!(r.rt.interned("alpha"), Some(alpha));
    assert_eq!(r.rt.interned("beta"), Some(beta));
    assert!(!r.rt.is_interned(wide));
    assert_eq!(r.rt.string_value(wide).as_deref(), Some(WIDE_NAME));

    let label = reference(r.rt.static_value(circle, "LABEL").expect("LABEL"));
    assert_eq!(r.rt.interned("circle"), Some(label));
}

#[test]
fn linkage_cache_is_rebound_to_restored_members() {
    let (u, r) = restored_universe();
    let registry = ty(&u, &r, u.types.registry);
    let node = ty(&u, &r, u.types.node);
    let circle = ty(&u, &r, u.types.circle);
    let ic = r.rt.instance(registry).expect("registry");
    let cache = ic.linkage.as_ref().expect("linkage cache");

    assert_eq!(
        cache.fields[0].resolved.map(|f| f.field),
        r.rt.find_field(node, "value", "I", false)
    );
    let area = r
        .rt
        .find_method(circle, "area", "()D", MethodKind::Instance)
        .expect("area");
    assert_eq!(cache.methods[0].f1, Some(Link::Type(circle)));
    assert_eq!(cache.methods[0].f2, Some(Link::Method(area)));
    assert!(!cache.methods[1].is_resolved());

    let resolved = cache.indys[0].resolved.expect("call site resolved");
    let (holder, adapter) = r.rt.method(resolved.adapter).expect("adapter");
    assert_eq!(holder, r.rt.well_known().method_handle);
    assert_eq!((adapter.name.as_str(), adapter.signature.as_str()), ("invokeExact", "(I)I"));
    let appendix = resolved.appendix.expect("appendix installed");
    assert_eq!(r.rt.string_value(appendix).as_deref(), Some("appendix"));
    assert_eq!(Some(appendix), r.object(u.objects.appendix));
    assert!(cache.indys[1].resolved.is_none());
    assert_eq!(r.unit.appendices.len(), 1);

    let node_slot = (0..ic.constants.len())
        .filter_map(|i| u16::try_from(i).ok())
        .find(|i| ic.constants.class_name(*i) == Some(NODE))
        .and_then(|i| ic.constants.get(i).cloned());
    assert!(
        matches!(node_slot, Some(CpEntry::Class { slot: ClassSlot::Resolved(t), .. }) if t == node),
        "{node_slot:?}"
    );
}

#[test]
fn captured_threads_resume_with_live_references() {
    let (u, r) = restored_universe();
    let circle = ty(&u, &r, u.types.circle);
    assert_eq!(r.threads.len(), 1);
    let thread = &r.threads[0];
    assert_eq!(Some(thread.thread), r.object(u.objects.thread));

    let frame = &thread.frames[0];
    assert_eq!(
        Some(frame.method),
        r.rt.find_method(circle, "area", "()D", MethodKind::Instance)
    );
    assert_eq!(
        frame.locals,
        vec![FrameValue::Ref(r.object(u.objects.unit_circle)), FrameValue::Prim(7)]
    );
    assert_eq!(
        frame.operands,
        vec![FrameValue::Ref(None), FrameValue::Prim(1.5f64.to_bits())]
    );
    assert_eq!(frame.monitors, vec![r.object(u.objects.tail).expect("tail")]);
}

#[test]
fn snapshot_files_restore_like_in_memory_streams() {
    init_tracing();
    let u = Universe::build().expect("build universe");
    let dir = tempfile::tempdir().expect("tempdir");
    let classes = dir.path().join("app.classes");
    let heap = dir.path().join("app.heap");
    let options = DumpOptions::default();

    dump(&u.rt, &classes, false, &options).expect("class dump");
    assert!(matches!(
        dump(&u.rt, &classes, false, &options),
        Err(DumpError::AlreadyExists(_))
    ));
    dump(&u.rt, &classes, true, &options).expect("overwrite");
    u.snapshot(&options)
        .expect("snapshot")
        .heap
        .save(&heap, false)
        .expect("heap save");

    let snapshot = HeapSnapshot::open(&heap).expect("heap open");
    let mut rt = Runtime::bootstrap().expect("bootstrap");
    let mut loaders = SnapshotLoaderProvider;
    let mut session = RestoreSession::new(&mut rt, &snapshot, &mut loaders, RestoreConfig::default());
    let unit = session.parse(&classes).expect("parse");
    session
        .restore_heap(&unit, snapshot.threads())
        .expect("restore heap");
    let app = session.runtime().find_defined(CIRCLE, None);
    assert!(app.is_none(), "application classes keep their loader");
    drop(session);

    let missing = RestoreSession::new(&mut rt, &snapshot, &mut loaders, RestoreConfig::default())
        .parse(dir.path().join("absent"))
        .expect_err("absent file");
    assert!(matches!(missing, RestoreError::Io(_)));
    assert!(!missing.is_fatal());
}

#[test]
fn unchanged_state_dumps_identical_bytes() {
    let u = Universe::build().expect("build universe");
    let options = DumpOptions::default();
    let first = u.snapshot(&options).expect("first snapshot");
    let second = u.snapshot(&options).expect("second snapshot");
    assert!(!first.classes.is_empty());
    assert_eq!(first.classes, second.classes);
    assert_eq!(first.heap, second.heap);

    let (mut a, mut b) = (Vec::new(), Vec::new());
    first.heap.write_to(&mut a).expect("first heap bytes");
    second.heap.write_to(&mut b).expect("second heap bytes");
    assert_eq!(a, b);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("app.classes");
    dump(&u.rt, &path, false, &options).expect("class dump");
    assert_eq!(std::fs::read(&path).expect("read dump"), first.classes);
}
