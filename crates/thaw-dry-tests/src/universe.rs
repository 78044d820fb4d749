// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A small application universe to snapshot and restore.
//!
//! Two loaders (`platform` and its child `app`) define a handful of
//! classes covering each restore path: an interface defined by the parent
//! and initiated by the child, a fully initialized class with interned
//! constants, a reference cycle, multi-dimensional arrays, a rewritten
//! class with resolved linkage entries, special objects (member handle,
//! call site), a failed initialization, and types left linked or loaded.

use thaw_core::codec::dump_to;
use thaw_core::heap::{FrameValue, HeapDumper, HeapSnapshot, RestoredFrame, RestoredThread};
use thaw_core::runtime::{
    access, fields, member_name_flags, names, ClassDefinition, ClassSlot, CpEntry, FieldRef,
    LifecycleState, Link, LinkageCache, MethodEntry, MethodKind, MethodRef, ObjRef, PrimKind,
    ResolvedField, ResolvedIndy, Runtime, RuntimeError, TypeRef, Value, WellKnown,
};
use thaw_core::{DumpError, DumpOptions};

use crate::classes::ClassBuilder;
use crate::loaders::create_loader;

/// Loader class of the demo application.
pub const APP_LOADER: &str = "demo/AppLoader";
/// Interface defined by the platform loader.
pub const SHAPE: &str = "demo/Shape";
/// Fully initialized class with constant statics.
pub const CIRCLE: &str = "demo/Circle";
/// Linked-list node; its statics close a cycle.
pub const NODE: &str = "demo/Node";
/// Rewritten class holding special objects in its statics.
pub const REGISTRY: &str = "demo/Registry";
/// Class whose initialization failed.
pub const BROKEN: &str = "demo/Broken";
/// Class left linked but never initialized.
pub const LAZY: &str = "demo/Lazy";
/// Class left loaded, extending [`LAZY`].
pub const UNLINKED: &str = "demo/Unlinked";

/// Message of the initialization error recorded for [`BROKEN`].
pub const BROKEN_MESSAGE: &str = "boom";

/// Non-Latin-1 string stored among the registry names.
pub const WIDE_NAME: &str = "λx.x";

/// Application types of a [`Universe`].
#[derive(Clone, Copy, Debug)]
pub struct DemoTypes {
    /// [`APP_LOADER`].
    pub app_loader: TypeRef,
    /// [`SHAPE`].
    pub shape: TypeRef,
    /// [`CIRCLE`].
    pub circle: TypeRef,
    /// [`NODE`].
    pub node: TypeRef,
    /// [`REGISTRY`].
    pub registry: TypeRef,
    /// [`BROKEN`].
    pub broken: TypeRef,
    /// [`LAZY`].
    pub lazy: TypeRef,
    /// [`UNLINKED`].
    pub unlinked: TypeRef,
}

/// Notable objects of a [`Universe`].
#[derive(Clone, Copy, Debug)]
pub struct DemoObjects {
    /// Parentless loader.
    pub platform: ObjRef,
    /// Child of `platform`.
    pub app: ObjRef,
    /// `Circle.UNIT`.
    pub unit_circle: ObjRef,
    /// `Node.HEAD`.
    pub head: ObjRef,
    /// `head.next`; its `next` is `head` again.
    pub tail: ObjRef,
    /// `int[]` payload of `head`.
    pub ints: ObjRef,
    /// `Circle[][]` payload of `tail`.
    pub grid: ObjRef,
    /// `Registry.NAMES`.
    pub names: ObjRef,
    /// Interned `"alpha"`.
    pub alpha: ObjRef,
    /// `Registry.HANDLE`, naming `Node.value`.
    pub handle: ObjRef,
    /// `Registry.SITE`.
    pub site: ObjRef,
    /// Context registered for `site`.
    pub context: ObjRef,
    /// Appendix of the registry's resolved call site.
    pub appendix: ObjRef,
    /// Initialization error of [`BROKEN`].
    pub error: ObjRef,
    /// The captured thread.
    pub thread: ObjRef,
}

/// Both streams of a snapshot, in memory.
#[derive(Debug)]
pub struct Snapshot {
    /// Class dump bytes.
    pub classes: Vec<u8>,
    /// Heap snapshot.
    pub heap: HeapSnapshot,
}

/// A populated source runtime.
#[derive(Debug)]
pub struct Universe {
    /// The runtime.
    pub rt: Runtime,
    /// Application types.
    pub types: DemoTypes,
    /// Notable objects.
    pub objects: DemoObjects,
    /// Live thread stacks to capture.
    pub threads: Vec<RestoredThread>,
}

/// Definition of [`APP_LOADER`], shared with targets that predefine it.
pub fn app_loader_definition(wk: &WellKnown) -> Result<ClassDefinition, RuntimeError> {
    ClassBuilder::new(APP_LOADER)
        .extends(wk.class_loader, names::CLASS_LOADER)
        .method("<init>", "(Ljava/lang/ClassLoader;)V", access::PUBLIC)
        .build()
}

fn field_ref(
    rt: &Runtime,
    holder: TypeRef,
    name: &str,
    signature: &str,
) -> Result<FieldRef, RuntimeError> {
    rt.find_field(holder, name, signature, false)
        .ok_or_else(|| RuntimeError::NoSuchField {
            holder: rt.class(holder).map(|c| c.name.clone()).unwrap_or_default(),
            name: name.to_owned(),
        })
}

fn method_ref(
    rt: &Runtime,
    holder: TypeRef,
    name: &str,
    signature: &str,
    kind: MethodKind,
) -> Result<MethodRef, RuntimeError> {
    rt.find_method(holder, name, signature, kind)
        .ok_or_else(|| RuntimeError::NoSuchMethod {
            holder: rt.class(holder).map(|c| c.name.clone()).unwrap_or_default(),
            name: name.to_owned(),
            signature: signature.to_owned(),
        })
}

fn ints(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

impl Universe {
    /// Bootstraps a runtime and populates it.
    pub fn build() -> Result<Self, RuntimeError> {
        let mut rt = Runtime::bootstrap()?;
        let wk = *rt.well_known();
        let object = |b: ClassBuilder| b.extends(wk.object, names::OBJECT);

        let app_loader = rt.define_class(app_loader_definition(&wk)?)?;
        rt.initialize_class(app_loader)?;
        let platform = create_loader(&mut rt, app_loader, None, "platform")?;
        let app = create_loader(&mut rt, app_loader, Some(platform), "app")?;

        let shape = rt.define_class(
            object(ClassBuilder::new(SHAPE).loader(platform))
                .interface()
                .method("area", "()D", access::PUBLIC | access::ABSTRACT)
                .build()?,
        )?;
        rt.initialize_class(shape)?;
        rt.add_initiating_loader(app, shape)?;

        let circle = rt.define_class(
            object(ClassBuilder::new(CIRCLE).loader(app))
                .implements(shape, SHAPE)
                .field("radius", "D")
                .static_field("UNIT", "Ldemo/Circle;")
                .static_int("COUNT", 1)
                .static_string("LABEL", "circle")
                .method("<init>", "()V", access::PUBLIC)
                .method("area", "()D", access::PUBLIC)
                .build()?,
        )?;
        rt.initialize_class(circle)?;
        let unit_circle = rt.new_instance(circle)?;
        rt.set_field(unit_circle, "radius", Value::Double(1.0f64.to_bits()))?;
        rt.set_static(circle, "UNIT", Value::Ref(Some(unit_circle)))?;
        rt.set_static(circle, "COUNT", Value::Int(3))?;

        let node = rt.define_class(
            object(ClassBuilder::new(NODE).loader(app))
                .field("next", "Ldemo/Node;")
                .field("value", "I")
                .field("payload", "Ljava/lang/Object;")
                .static_field("HEAD", "Ldemo/Node;")
                .method("<init>", "()V", access::PUBLIC)
                .build()?,
        )?;
        rt.initialize_class(node)?;
        let head = rt.new_instance(node)?;
        let tail = rt.new_instance(node)?;
        rt.set_field(head, "next", Value::Ref(Some(tail)))?;
        rt.set_field(tail, "next", Value::Ref(Some(head)))?;
        rt.set_field(head, "value", Value::Int(1))?;
        rt.set_field(tail, "value", Value::Int(2))?;
        let int_array = rt.new_prim_array(PrimKind::Int, ints(&[1, 2, 3]));
        rt.set_field(head, "payload", Value::Ref(Some(int_array)))?;
        let circle_row = rt.array_class(circle)?;
        let grid = rt.new_object_array(circle_row, 2)?;
        let row = rt.new_object_array(circle, 2)?;
        rt.set_element(row, 0, Some(unit_circle))?;
        rt.set_element(grid, 0, Some(row))?;
        rt.set_field(tail, "payload", Value::Ref(Some(grid)))?;
        rt.set_static(node, "HEAD", Value::Ref(Some(head)))?;

        let (registry, appendix) = Self::define_registry(&mut rt, &wk, app, node, circle)?;
        rt.initialize_class(registry)?;
        let names_array = rt.new_object_array(wk.string, 3)?;
        let alpha = rt.intern("alpha")?;
        let beta = rt.intern("beta")?;
        let wide = rt.new_string(WIDE_NAME)?;
        for (i, s) in [alpha, beta, wide].into_iter().enumerate() {
            rt.set_element(names_array, i, Some(s))?;
        }
        rt.set_static(registry, "NAMES", Value::Ref(Some(names_array)))?;

        let handle = rt.new_instance(wk.member_name)?;
        let node_mirror = rt.mirror(node);
        let value_name = rt.intern("value")?;
        let value_type = rt.intern("I")?;
        let offset = rt
            .field_offset(node, "value", "I")
            .ok_or_else(|| RuntimeError::NotLinked { name: NODE.into() })?;
        rt.set_field(handle, fields::MEMBER_CLAZZ, Value::Ref(node_mirror))?;
        rt.set_field(handle, fields::MEMBER_NAME, Value::Ref(Some(value_name)))?;
        rt.set_field(handle, fields::MEMBER_TYPE, Value::Ref(Some(value_type)))?;
        rt.set_field(handle, fields::MEMBER_FLAGS, Value::Int(member_name_flags::IS_FIELD))?;
        rt.set_field(handle, fields::MEMBER_VMINDEX, Value::Long(i64::from(offset)))?;
        rt.set_static(registry, "HANDLE", Value::Ref(Some(handle)))?;

        let site = rt.new_instance(wk.call_site)?;
        let context = rt.new_call_site_context()?;
        rt.set_field(context, "vmdependencies", Value::Long(0x5eed))?;
        rt.register_call_site_context(site, context)?;
        rt.set_static(registry, "SITE", Value::Ref(Some(site)))?;

        let broken = rt.define_class(
            object(ClassBuilder::new(BROKEN).loader(app))
                .static_field("ATTEMPTS", "I")
                .method("<clinit>", "()V", access::STATIC)
                .build()?,
        )?;
        rt.link_class(broken)?;
        rt.set_static(broken, "ATTEMPTS", Value::Int(2))?;
        rt.advance_state(broken, LifecycleState::BeingInitialized)?;
        let error = rt.new_instance(wk.throwable)?;
        let message = rt.new_string(BROKEN_MESSAGE)?;
        rt.set_field(error, fields::THROWABLE_MESSAGE, Value::Ref(Some(message)))?;
        rt.finish_initialization(broken, Some(error))?;

        let lazy = rt.define_class(
            object(ClassBuilder::new(LAZY).loader(app))
                .static_field("CACHE", "Ljava/lang/Object;")
                .build()?,
        )?;
        rt.link_class(lazy)?;
        let unlinked = rt.define_class(
            ClassBuilder::new(UNLINKED)
                .loader(app)
                .extends(lazy, LAZY)
                .field("extra", "J")
                .build()?,
        )?;

        let thread = rt.new_instance(wk.thread)?;
        let thread_name = rt.new_string("main")?;
        rt.set_field(thread, "name", Value::Ref(Some(thread_name)))?;
        rt.set_field(thread, "priority", Value::Int(5))?;
        let area = method_ref(&rt, circle, "area", "()D", MethodKind::Instance)?;
        let threads = vec![RestoredThread {
            thread,
            frames: vec![RestoredFrame {
                method: area,
                bci: 0,
                locals: vec![FrameValue::Ref(Some(unit_circle)), FrameValue::Prim(7)],
                operands: vec![FrameValue::Ref(None), FrameValue::Prim(1.5f64.to_bits())],
                monitors: vec![tail],
            }],
        }];

        let node_mirror =
            node_mirror.ok_or_else(|| RuntimeError::NotLinked { name: NODE.into() })?;
        for r in [head, unit_circle, alpha, node_mirror] {
            rt.heap_mut().identity_hash(r);
        }

        Ok(Self {
            rt,
            types: DemoTypes {
                app_loader,
                shape,
                circle,
                node,
                registry,
                broken,
                lazy,
                unlinked,
            },
            objects: DemoObjects {
                platform,
                app,
                unit_circle,
                head,
                tail,
                ints: int_array,
                grid,
                names: names_array,
                alpha,
                handle,
                site,
                context,
                appendix,
                error,
                thread,
            },
            threads,
        })
    }

    /// Defines [`REGISTRY`] with a linkage cache whose first entries are
    /// resolved against `node` and `circle`.
    fn define_registry(
        rt: &mut Runtime,
        wk: &WellKnown,
        app: ObjRef,
        node: TypeRef,
        circle: TypeRef,
    ) -> Result<(TypeRef, ObjRef), RuntimeError> {
        let mut b = ClassBuilder::new(REGISTRY)
            .loader(app)
            .extends(wk.object, names::OBJECT)
            .static_field("NAMES", "[Ljava/lang/String;")
            .static_field("HANDLE", "Ljava/lang/invoke/MemberName;")
            .static_field("SITE", "Ljava/lang/invoke/CallSite;")
            .method("<clinit>", "()V", access::STATIC)
            .method("lookup", "(I)I", access::PUBLIC | access::STATIC);
        let node_class = b.constants().add_class(NODE)?;
        let value_ref = b.constants().add_field_ref(NODE, "value", "I")?;
        let area_ref = b.constants().add_method_ref(CIRCLE, "area", "()D", false)?;
        let init_ref = b.constants().add_method_ref(NODE, "<init>", "()V", false)?;
        let indy = b.constants().add_invoke_dynamic(0, "apply", "(I)I")?;
        if let Some(CpEntry::Class { slot, .. }) = b.constants().get_mut(node_class) {
            *slot = ClassSlot::Resolved(node);
        }

        let value = field_ref(rt, node, "value", "I")?;
        let area = method_ref(rt, circle, "area", "()D", MethodKind::Instance)?;
        let adapter = rt
            .signature_polymorphic_intrinsic(wk.method_handle, "invokeExact", "(I)I")
            .ok_or_else(|| RuntimeError::NoSuchMethod {
                holder: names::METHOD_HANDLE.into(),
                name: "invokeExact".into(),
                signature: "(I)I".into(),
            })?;
        let appendix = rt.new_string("appendix")?;

        let mut cache = LinkageCache::with_shape(1, 2, 2);
        cache.fields[0].cp_index = value_ref;
        cache.fields[0].resolved = Some(ResolvedField {
            get_code: 0xb4,
            put_code: 0,
            flags: 0,
            field: value,
        });
        cache.methods[0] = MethodEntry {
            cp_index: area_ref,
            bytecode1: 0,
            bytecode2: 0xb6,
            flags: 0,
            f1: Some(Link::Type(circle)),
            f2: Some(Link::Method(area)),
        };
        cache.methods[1] = MethodEntry::unresolved(init_ref);
        cache.indys[0].cp_index = indy;
        cache.indys[0].resolved = Some(ResolvedIndy {
            adapter,
            appendix: Some(appendix),
        });
        cache.indys[1].cp_index = indy;

        let registry = rt.define_class(b.linkage(cache).build()?)?;
        Ok((registry, appendix))
    }

    /// Dumps both streams.
    pub fn snapshot(&self, options: &DumpOptions) -> Result<Snapshot, DumpError> {
        let mut classes = Vec::new();
        dump_to(&self.rt, &mut classes, options)?;
        let heap = HeapDumper::new(&self.rt)?.snapshot(&self.threads)?;
        Ok(Snapshot { classes, heap })
    }
}
