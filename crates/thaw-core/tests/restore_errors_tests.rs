// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
use bytes::Bytes;
use thaw_core::heap::{BlobReader, BlobValue, BlobWriter, HeapSource, RecordBody};
use thaw_core::runtime::{fields, internal, names, ItableEntry, ObjRef, PrimKind, Runtime};
use thaw_core::{
    DumpOptions, FormatError, MismatchPolicy, ObjectId, RestoreConfig, RestoreError,
    RestoreSession, SnapshotLoaderProvider, Unsupported,
};
use thaw_dry_tests::universe::NODE;
use thaw_dry_tests::{
    restore_fresh, restore_into, snapshot_id, ClassBuilder, GraphMatcher, Snapshot, Universe,
};

fn snapshot(options: &DumpOptions) -> (Universe, Snapshot) {
    let u = Universe::build().expect("build universe");
    let snap = u.snapshot(options).expect("snapshot");
    (u, snap)
}

#[test]
fn foreign_header_is_rejected() {
    let (_, mut snap) = snapshot(&DumpOptions::default());
    snap.classes[0] ^= 0xff;
    let err = restore_fresh(&snap, RestoreConfig::default()).expect_err("bad magic");
    assert!(matches!(err, RestoreError::Format(FormatError::BadMagic { .. })), "{err}");
}

#[test]
fn short_class_dumps_are_truncated() {
    let (_, snap) = snapshot(&DumpOptions::default());
    for len in [10, snap.classes.len() - 1] {
        let mut short = Snapshot {
            classes: snap.classes.clone(),
            heap: snap.heap.clone(),
        };
        short.classes.truncate(len);
        let err = restore_fresh(&short, RestoreConfig::default()).expect_err("truncated");
        assert!(
            matches!(err, RestoreError::Format(FormatError::Truncated)),
            "{len} bytes: {err}"
        );
    }
}

#[test]
fn agent_modified_classes_are_refused() {
    let mut u = Universe::build().expect("build universe");
    let wk = *u.rt.well_known();
    u.rt.define_class(
        ClassBuilder::new("demo/Patched")
            .extends(wk.object, names::OBJECT)
            .internal(internal::MODIFIED_BY_AGENT)
            .build()
            .expect("patched definition"),
    )
    .expect("define patched");
    let snap = u.snapshot(&DumpOptions::default()).expect("snapshot");

    let err = restore_fresh(&snap, RestoreConfig::default()).expect_err("refused");
    assert!(
        matches!(&err, RestoreError::Unsupported(Unsupported::ModifiedByAgent(name)) if name == "demo/Patched"),
        "{err}"
    );
}

#[test]
fn feature_mismatch_follows_policy() {
    let (_, snap) = snapshot(&DumpOptions {
        preserve_invisible_annotations: true,
    });

    let strict = RestoreConfig {
        feature_mismatch: MismatchPolicy::Fail,
        ..RestoreConfig::default()
    };
    let err = restore_fresh(&snap, strict).expect_err("mismatch");
    assert!(matches!(
        err,
        RestoreError::Unsupported(Unsupported::FeatureMismatch {
            recorded: true,
            local: false,
            ..
        })
    ));

    restore_fresh(&snap, RestoreConfig::default()).expect("warn accepts");
    let from_file = {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("restore.json");
        std::fs::write(&path, br#"{"feature_mismatch":"ignore"}"#).expect("write config");
        RestoreConfig::from_path(&path).expect("config")
    };
    assert_eq!(from_file.feature_mismatch, MismatchPolicy::Ignore);
    restore_fresh(&snap, from_file).expect("ignore accepts");
}

#[test]
fn unreproducible_hash_on_a_restored_object_is_fatal() {
    let (u, mut snap) = snapshot(&DumpOptions::default());
    let src_array = u
        .rt
        .get_field(u.objects.alpha, fields::STRING_VALUE)
        .expect("value")
        .as_reference()
        .flatten()
        .expect("contents");

    let target = || {
        let mut rt = Runtime::bootstrap().expect("bootstrap");
        let alpha = rt.intern("alpha").expect("intern");
        let array = rt
            .get_field(alpha, fields::STRING_VALUE)
            .expect("value")
            .as_reference()
            .flatten()
            .expect("contents");
        let hash = rt.heap_mut().identity_hash(array).expect("hash");
        (rt, hash)
    };

    let (rt, hash) = target();
    snap.heap
        .record_mut(snapshot_id(src_array))
        .expect("array record")
        .identity_hash = Some(hash ^ 2);
    let err = restore_into(rt, &snap, &mut SnapshotLoaderProvider, RestoreConfig::default())
        .expect_err("conflict");
    assert!(
        matches!(
            err,
            RestoreError::Format(FormatError::IdentityHashConflict { existing, recorded, .. })
                if existing == hash && recorded == hash ^ 2
        ),
        "{err}"
    );

    let (rt, _) = target();
    let lenient = RestoreConfig {
        verify_identity_hashes: false,
        ..RestoreConfig::default()
    };
    restore_into(rt, &snap, &mut SnapshotLoaderProvider, lenient).expect("unverified");
}

#[test]
fn preexisting_objects_keep_their_own_hash() {
    let (u, snap) = snapshot(&DumpOptions::default());
    let mut rt = Runtime::bootstrap().expect("bootstrap");
    let alpha = rt.intern("alpha").expect("intern");
    let ours = rt.heap_mut().identity_hash(alpha).expect("hash");

    let r = restore_into(rt, &snap, &mut SnapshotLoaderProvider, RestoreConfig::default())
        .expect("conflict only warns");
    assert_eq!(r.object(u.objects.alpha), Some(alpha));
    assert_eq!(r.rt.object(alpha).expect("alpha").identity_hash, Some(ours));

    let registry = r.ty(&u.rt, u.types.registry).expect("registry");
    GraphMatcher::new(&u.rt, &r.rt)
        .check_hashes(false)
        .statics(u.types.registry, registry)
        .expect("statics match");
}

fn instance_blob(snap: &mut Snapshot, obj: ObjRef) -> &mut Bytes {
    let record = snap.heap.record_mut(snapshot_id(obj)).expect("record");
    let RecordBody::Instance { fields: blob, .. } = &mut record.body else {
        unreachable!("{obj:?} is recorded as an instance");
    };
    blob
}

/// Re-encodes `obj`'s record with reference field `field` set to `value`.
fn rewrite_reference(u: &Universe, snap: &mut Snapshot, obj: ObjRef, field: &str, value: ObjectId) {
    let class = u.rt.class_of(obj).expect("class");
    let slots = u.rt.instance_slots(class).expect("slots").to_vec();
    let width = snap.heap.id_width();
    let blob = instance_blob(snap, obj);
    let mut reader = BlobReader::new(&blob[..], width);
    let mut writer = BlobWriter::new(width);
    for slot in &slots {
        match reader.next_value(&slot.descriptor).expect("field") {
            _ if slot.name == field => writer.reference(value),
            BlobValue::Ref(id) => writer.reference(id),
            BlobValue::Prim(bits) => writer.prim(
                PrimKind::from_descriptor(&slot.descriptor).expect("primitive"),
                bits,
            ),
        }
    }
    *blob = writer.finish();
}

#[test]
fn field_blobs_longer_than_the_layout_are_corrupt() {
    let u = Universe::build().expect("build universe");
    for obj in [u.objects.head, u.objects.alpha] {
        let mut snap = u.snapshot(&DumpOptions::default()).expect("snapshot");
        let blob = instance_blob(&mut snap, obj);
        let mut longer = blob.to_vec();
        longer.extend_from_slice(&[0; 9]);
        *blob = Bytes::from(longer);

        let err = restore_fresh(&snap, RestoreConfig::default()).expect_err("overlong blob");
        assert!(err.is_fatal());
        assert!(
            matches!(&err, RestoreError::Format(FormatError::CorruptRecord(msg)) if msg.contains("9 bytes")),
            "{obj:?}: {err}"
        );
    }
}

#[test]
fn reference_of_an_unrelated_type_is_fatal() {
    let u = Universe::build().expect("build universe");
    let mut snap = u.snapshot(&DumpOptions::default()).expect("snapshot");
    rewrite_reference(&u, &mut snap, u.objects.tail, "next", snapshot_id(u.objects.alpha));

    let err = restore_fresh(&snap, RestoreConfig::default()).expect_err("type mismatch");
    let RestoreError::Format(FormatError::FieldTypeMismatch {
        holder,
        field,
        descriptor,
        actual,
    }) = &err
    else {
        unreachable!("expected a field type mismatch, got {err}");
    };
    assert_eq!(holder, NODE);
    assert_eq!(field, "next");
    assert_eq!(descriptor, "Ldemo/Node;");
    assert_eq!(actual, names::STRING);
}

#[test]
fn identity_in_neither_namespace_is_fatal() {
    let u = Universe::build().expect("build universe");
    let mut snap = u.snapshot(&DumpOptions::default()).expect("snapshot");
    let width = snap.heap.id_width();
    let missing = (1..width.end_sentinel())
        .rev()
        .map(ObjectId)
        .find(|id| snap.heap.record(*id).is_none())
        .expect("a free identity");
    rewrite_reference(&u, &mut snap, u.objects.tail, "next", missing);

    let err = restore_fresh(&snap, RestoreConfig::default()).expect_err("missing identity");
    assert!(
        matches!(err, RestoreError::Format(FormatError::MissingIdentity(id)) if id == missing),
        "{err}"
    );
}

#[test]
fn restore_is_memoized_per_identity() {
    let u = Universe::build().expect("build universe");
    let snap = u.snapshot(&DumpOptions::default()).expect("snapshot");
    let mut rt = Runtime::bootstrap().expect("bootstrap");
    let mut loaders = SnapshotLoaderProvider;
    let mut session = RestoreSession::new(&mut rt, &snap.heap, &mut loaders, RestoreConfig::default());
    session.parse_from(snap.classes.as_slice()).expect("parse");

    let head = snapshot_id(u.objects.head);
    let first = session.restore(head).expect("first restore");
    assert!(first.is_some());
    assert_eq!(session.restore(head).expect("second restore"), first);

    let unknown = ObjectId(0xfff0);
    assert!(snap.heap.record(unknown).is_none());
    let err = session.restore(unknown).expect_err("unknown identity");
    assert!(matches!(err, RestoreError::Format(FormatError::MissingIdentity(id)) if id == unknown));
}

#[test]
fn recorded_dispatch_sizes_must_match_the_relinked_layout() {
    let mut u = Universe::build().expect("build universe");
    let node = u.types.node;
    let shape = u.types.shape;
    let layout = u
        .rt
        .instance_mut(node)
        .expect("node class")
        .layout
        .as_mut()
        .expect("node is linked");
    let recomputed = layout.itable_len();
    layout.itable.push(ItableEntry {
        interface: shape,
        methods: Vec::new(),
    });
    let snap = u.snapshot(&DumpOptions::default()).expect("snapshot");

    let err = restore_fresh(&snap, RestoreConfig::default()).expect_err("layout mismatch");
    assert!(
        matches!(
            &err,
            RestoreError::Format(FormatError::LayoutMismatch { name, table: "itable", expected, actual })
                if name == NODE && *expected == recomputed + 1 && *actual == recomputed
        ),
        "{err}"
    );
}
