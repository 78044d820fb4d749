// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
use proptest::prelude::*;
use proptest::test_runner::{Config as PropConfig, RngAlgorithm, TestRng, TestRunner};

use thaw_core::runtime::{names, ObjRef, PrimKind, Value};
use thaw_core::{DumpOptions, RestoreConfig};
use thaw_dry_tests::universe::NODE;
use thaw_dry_tests::{restore_fresh, ClassBuilder, GraphMatcher, Universe};

#[derive(Clone, Debug)]
enum Payload {
    Null,
    Ints(Vec<i32>),
    Node(usize),
}

#[derive(Clone, Debug)]
struct NodeShape {
    value: i32,
    next: Option<usize>,
    payload: Payload,
    hashed: bool,
}

fn node_shape(n: usize) -> impl Strategy<Value = NodeShape> {
    let payload = prop_oneof![
        Just(Payload::Null),
        prop::collection::vec(any::<i32>(), 0..4).prop_map(Payload::Ints),
        (0..n).prop_map(Payload::Node),
    ];
    (any::<i32>(), prop::option::of(0..n), payload, any::<bool>()).prop_map(
        |(value, next, payload, hashed)| NodeShape {
            value,
            next,
            payload,
            hashed,
        },
    )
}

fn graph() -> impl Strategy<Value = Vec<NodeShape>> {
    (1usize..12).prop_flat_map(|n| prop::collection::vec(node_shape(n), n))
}

/// Adds `demo/Graph` holding the nodes in its `ALL` static.
fn populate(u: &mut Universe, shapes: &[NodeShape]) -> thaw_core::runtime::TypeRef {
    let rt = &mut u.rt;
    let wk = *rt.well_known();
    let holder = rt
        .define_class(
            ClassBuilder::new("demo/Graph")
                .loader(u.objects.app)
                .extends(wk.object, names::OBJECT)
                .static_field("ALL", "[Ldemo/Node;")
                .build()
                .expect("graph holder definition"),
        )
        .expect("define graph holder");
    rt.initialize_class(holder).expect("initialize holder");

    let node = u.types.node;
    let nodes: Vec<ObjRef> = shapes
        .iter()
        .map(|_| rt.new_instance(node).expect("node"))
        .collect();
    let all = rt.new_object_array(node, nodes.len()).expect("array");
    for (i, (shape, &obj)) in shapes.iter().zip(&nodes).enumerate() {
        rt.set_element(all, i, Some(obj)).expect("element");
        rt.set_field(obj, "value", Value::Int(shape.value)).expect("value");
        rt.set_field(obj, "next", Value::Ref(shape.next.map(|j| nodes[j])))
            .expect("next");
        let payload = match &shape.payload {
            Payload::Null => None,
            Payload::Ints(v) => Some(rt.new_prim_array(
                PrimKind::Int,
                v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            )),
            Payload::Node(j) => Some(nodes[*j]),
        };
        rt.set_field(obj, "payload", Value::Ref(payload)).expect("payload");
        if shape.hashed {
            rt.heap_mut().identity_hash(obj).expect("hash");
        }
    }
    rt.set_static(holder, "ALL", Value::Ref(Some(all)))
        .expect("ALL");
    holder
}

#[test]
fn proptest_seed_pinned_node_graphs_restore_isomorphically() {
    const SEED_BYTES: [u8; 32] = *b"thaw object graph restore seed!!";

    let rng = TestRng::from_seed(RngAlgorithm::ChaCha, &SEED_BYTES);
    let mut runner = TestRunner::new_with_rng(
        PropConfig {
            cases: 48,
            ..PropConfig::default()
        },
        rng,
    );

    runner
        .run(&graph(), |shapes| {
            let mut u = Universe::build().expect("build universe");
            let holder = populate(&mut u, &shapes);
            let snap = u.snapshot(&DumpOptions::default()).expect("snapshot");
            let r = restore_fresh(&snap, RestoreConfig::default()).expect("restore");

            let restored = r.ty(&u.rt, holder).expect("holder restored");
            let node = r.ty(&u.rt, u.types.node).expect("node restored");
            prop_assert_eq!(
                r.rt.class(node).expect("node class").name.as_str(),
                NODE
            );
            let mut m = GraphMatcher::new(&u.rt, &r.rt);
            let matched = m.statics(holder, restored);
            prop_assert!(matched.is_ok(), "{:?}", matched);
            Ok(())
        })
        .expect("proptest with pinned seed should complete");
}
