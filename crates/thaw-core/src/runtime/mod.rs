// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The managed runtime that snapshots are taken from and restored into.
//!
//! This is the "ordinary loader and heap" collaborator: a class arena, an
//! object arena, a system dictionary keyed by `(name, loader)`, the string
//! intern table and the per-type mirrors. Restore drives it through the
//! same operations normal class loading uses.
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

mod bootstrap;
mod class;
mod constant_pool;
mod gate;
mod heap;
mod link;
mod linkage;
mod member;

pub use bootstrap::{
    fields, member_name_flags, names, WellKnown, LOADER_PREPARED_FIELDS, MIRROR_CREATION_FIELDS,
};
pub use class::{
    access, internal, Class, ClassDefinition, ClassKind, FieldRef, InstanceClass, InstanceSlot,
    ItableEntry, Layout, LifecycleState, MethodRef, TypeRef,
};
pub use constant_pool::{tag, ClassSlot, ConstantPool, CpEntry, ResolutionError};
pub use gate::{Released, RestoreGate};
pub use heap::{HashInstall, Heap, ObjRef, Object, ObjectBody, PrimKind, Value};
pub use linkage::{FieldEntry, IndyEntry, LinkageCache, Link, MethodEntry, ResolvedField, ResolvedIndy};
pub use member::{
    field_flags, method_flags, AnnotationSet, BootstrapMethod, ClassAttributes, EnclosingMethod,
    ExceptionHandler, FieldInfo, InnerClass, LineNumber, LocalVariable, MethodInfo, MethodKind,
    MethodParameter, RecordComponent,
};

/// Errors raised by ordinary runtime operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A type reference does not name a type in this runtime.
    #[error("unknown type {0:?}")]
    UnknownType(TypeRef),
    /// An object reference does not name a live object.
    #[error("unknown object {0:?}")]
    UnknownObject(ObjRef),
    /// The loader already defines a class with this name.
    #[error("{name} is already defined by this loader")]
    DuplicateClass {
        /// Class name.
        name: String,
    },
    /// No class with this name is visible from the loader.
    #[error("class {0} not found")]
    ClassNotFound(String),
    /// A lifecycle transition would move a type backwards.
    #[error("{name}: illegal state transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Class name.
        name: String,
        /// Current state.
        from: LifecycleState,
        /// Requested state.
        to: LifecycleState,
    },
    /// The operation needs a non-array class.
    #[error("{name} is not an instance class")]
    NotInstanceClass {
        /// Class name.
        name: String,
    },
    /// The operation needs a linked class.
    #[error("{name} is not linked")]
    NotLinked {
        /// Class name.
        name: String,
    },
    /// Field lookup failed.
    #[error("no field {holder}.{name}")]
    NoSuchField {
        /// Holder class name.
        holder: String,
        /// Field name.
        name: String,
    },
    /// Method lookup failed.
    #[error("no method {holder}.{name}{signature}")]
    NoSuchMethod {
        /// Holder class name.
        holder: String,
        /// Method name.
        name: String,
        /// Method descriptor.
        signature: String,
    },
    /// A recorded dispatch-table length disagrees with the recomputed one.
    #[error("{name}: recorded {table} length {expected}, recomputed {actual}")]
    LayoutMismatch {
        /// Class name.
        name: String,
        /// `"vtable"` or `"itable"`.
        table: &'static str,
        /// Recorded length.
        expected: usize,
        /// Recomputed length.
        actual: usize,
    },
    /// Two loaders disagree on a type named in an overriding signature.
    #[error("loader constraint violated: {0}")]
    LoaderConstraint(String),
    /// The object does not have the shape this access requires.
    #[error("{0:?} has the wrong shape for this access")]
    WrongShape(ObjRef),
    /// A constant pool would need more slots than a `u16` count holds.
    #[error("constant pool of {0} slots exceeds the u16 limit")]
    ConstantPoolFull(usize),
}

/// What a mirror object describes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mirrored {
    /// A loaded type.
    Type(TypeRef),
    /// A primitive type, which has a mirror but no class.
    Primitive(PrimKind),
}

/// A runtime-synthesized signature-polymorphic method.
#[derive(Clone, Debug)]
struct Intrinsic {
    holder: TypeRef,
    info: MethodInfo,
}

/// A managed runtime instance.
#[derive(Debug)]
pub struct Runtime {
    classes: Vec<Class>,
    heap: Heap,
    defined: FxHashMap<(String, Option<ObjRef>), TypeRef>,
    initiated: FxHashMap<(String, ObjRef), TypeRef>,
    initiating: Vec<(ObjRef, TypeRef)>,
    interned: FxHashMap<String, ObjRef>,
    interned_objects: FxHashSet<ObjRef>,
    mirrors: FxHashMap<ObjRef, Mirrored>,
    prim_mirrors: Vec<ObjRef>,
    prim_arrays: Vec<TypeRef>,
    mirrors_enabled: bool,
    well_known: WellKnown,
    intrinsics: Vec<Intrinsic>,
    call_site_contexts: FxHashMap<ObjRef, ObjRef>,
    gate: Arc<RestoreGate>,
}

impl Runtime {
    fn empty() -> Self {
        Self {
            classes: Vec::new(),
            heap: Heap::default(),
            defined: FxHashMap::default(),
            initiated: FxHashMap::default(),
            initiating: Vec::new(),
            interned: FxHashMap::default(),
            interned_objects: FxHashSet::default(),
            mirrors: FxHashMap::default(),
            prim_mirrors: Vec::new(),
            prim_arrays: Vec::new(),
            mirrors_enabled: false,
            well_known: WellKnown::default(),
            intrinsics: Vec::new(),
            call_site_contexts: FxHashMap::default(),
            gate: Arc::new(RestoreGate::default()),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// Core types every runtime predefines.
    #[must_use]
    pub const fn well_known(&self) -> &WellKnown {
        &self.well_known
    }

    /// Type by reference.
    pub fn class(&self, t: TypeRef) -> Result<&Class, RuntimeError> {
        self.classes.get(t.index()).ok_or(RuntimeError::UnknownType(t))
    }

    /// Mutable type by reference.
    pub fn class_mut(&mut self, t: TypeRef) -> Result<&mut Class, RuntimeError> {
        self.classes
            .get_mut(t.index())
            .ok_or(RuntimeError::UnknownType(t))
    }

    /// Instance-class data of `t`.
    pub fn instance(&self, t: TypeRef) -> Result<&InstanceClass, RuntimeError> {
        let c = self.class(t)?;
        c.as_instance().ok_or_else(|| RuntimeError::NotInstanceClass {
            name: c.name.clone(),
        })
    }

    /// Mutable instance-class data of `t`.
    pub fn instance_mut(&mut self, t: TypeRef) -> Result<&mut InstanceClass, RuntimeError> {
        let c = self.class_mut(t)?;
        let name = c.name.clone();
        c.as_instance_mut()
            .ok_or(RuntimeError::NotInstanceClass { name })
    }

    /// Derived layout of a linked instance class.
    pub fn layout(&self, t: TypeRef) -> Result<&Layout, RuntimeError> {
        let c = self.class(t)?;
        c.as_instance()
            .and_then(|ic| ic.layout.as_ref())
            .ok_or_else(|| RuntimeError::NotLinked {
                name: c.name.clone(),
            })
    }

    /// Every type in allocation order.
    pub fn classes(&self) -> impl Iterator<Item = (TypeRef, &Class)> {
        self.classes
            .iter()
            .enumerate()
            .map(|(i, c)| (TypeRef(i as u32), c))
    }

    /// Number of types.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// The object heap.
    #[must_use]
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The object heap, mutably.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Object by reference.
    pub fn object(&self, r: ObjRef) -> Result<&Object, RuntimeError> {
        self.heap.get(r).ok_or(RuntimeError::UnknownObject(r))
    }

    /// Runtime type of an object.
    pub fn class_of(&self, r: ObjRef) -> Result<TypeRef, RuntimeError> {
        Ok(self.object(r)?.class)
    }

    /// Shared restore gate; clone it into threads that may touch types
    /// while a restore is running.
    #[must_use]
    pub fn restore_gate(&self) -> Arc<RestoreGate> {
        Arc::clone(&self.gate)
    }

    // ── Dictionary ──────────────────────────────────────────────────────

    /// Type defined by exactly `loader` under `name`.
    #[must_use]
    pub fn find_defined(&self, name: &str, loader: Option<ObjRef>) -> Option<TypeRef> {
        self.defined.get(&(name.to_owned(), loader)).copied()
    }

    /// Type `loader` has defined or initiated under `name`.
    #[must_use]
    pub fn find_loaded(&self, name: &str, loader: Option<ObjRef>) -> Option<TypeRef> {
        self.find_defined(name, loader).or_else(|| {
            loader.and_then(|l| self.initiated.get(&(name.to_owned(), l)).copied())
        })
    }

    /// Resolves `name` from `loader`, delegating to parents first.
    ///
    /// Array descriptors resolve through their element type and only find
    /// array types that already exist.
    #[must_use]
    pub fn resolve_class(&self, name: &str, loader: Option<ObjRef>) -> Option<TypeRef> {
        if let Some(rest) = name.strip_prefix('[') {
            let element = if let Some(k) = PrimKind::from_descriptor(rest) {
                return Some(self.prim_array_class(k));
            } else if let Some(inner) = rest.strip_prefix('L').and_then(|r| r.strip_suffix(';')) {
                self.resolve_class(inner, loader)?
            } else {
                self.resolve_class(rest, loader)?
            };
            return self.class(element).ok()?.array_class;
        }
        let mut current = loader;
        let mut chain = Vec::new();
        loop {
            chain.push(current);
            match current {
                None => break,
                Some(l) => current = self.loader_parent(l).ok().flatten(),
            }
            if chain.len() > 64 {
                break;
            }
        }
        chain
            .iter()
            .rev()
            .find_map(|l| self.find_defined(name, *l))
            .or_else(|| self.find_loaded(name, loader))
    }

    /// Records that `loader` can resolve `t` without having defined it.
    pub fn add_initiating_loader(&mut self, loader: ObjRef, t: TypeRef) -> Result<(), RuntimeError> {
        let name = self.class(t)?.name.clone();
        if self.class(t)?.loader == Some(loader) {
            return Ok(());
        }
        if self.initiated.insert((name, loader), t).is_none() {
            self.initiating.push((loader, t));
        }
        Ok(())
    }

    /// `(loader, type)` pairs recorded through [`Runtime::add_initiating_loader`].
    #[must_use]
    pub fn initiating_entries(&self) -> &[(ObjRef, TypeRef)] {
        &self.initiating
    }

    /// Parent of a loader object.
    pub fn loader_parent(&self, loader: ObjRef) -> Result<Option<ObjRef>, RuntimeError> {
        self.get_field(loader, fields::LOADER_PARENT)?
            .as_reference()
            .ok_or(RuntimeError::WrongShape(loader))
    }

    // ── Class lifecycle ─────────────────────────────────────────────────

    fn push_class(&mut self, class: Class) -> Result<TypeRef, RuntimeError> {
        let t = TypeRef(self.classes.len() as u32);
        self.classes.push(class);
        if self.mirrors_enabled {
            self.create_mirror(t)?;
        }
        Ok(t)
    }

    /// Allocates a class from its definition in [`LifecycleState::Allocated`].
    ///
    /// The class is not visible through any loader until
    /// [`Runtime::load_class`].
    pub fn allocate_class(&mut self, def: ClassDefinition) -> Result<TypeRef, RuntimeError> {
        let ClassDefinition {
            name,
            loader,
            super_class,
            interfaces,
            access_flags,
            mut body,
        } = def;
        for dep in super_class.iter().chain(&interfaces) {
            self.class(*dep)?;
        }
        body.layout = None;
        body.statics = Vec::new();
        body.init_error = None;
        if access_flags & access::INTERFACE != 0
            && body
                .methods
                .iter()
                .any(|m| !m.is_static() && !m.is_abstract() && m.is_virtual())
        {
            body.internal_flags |= internal::DECLARES_DEFAULT_METHODS;
        }
        let inherits_defaults = super_class
            .iter()
            .chain(&interfaces)
            .filter_map(|d| self.class(*d).ok()?.as_instance())
            .any(|ic| {
                ic.has_internal(internal::HAS_DEFAULT_METHODS)
                    || ic.has_internal(internal::DECLARES_DEFAULT_METHODS)
            });
        if inherits_defaults {
            body.internal_flags |= internal::HAS_DEFAULT_METHODS;
        }
        self.push_class(Class {
            name,
            loader,
            kind: ClassKind::Instance(Box::new(body)),
            access_flags,
            super_class,
            interfaces,
            mirror: None,
            state: LifecycleState::Allocated,
            array_class: None,
        })
    }

    /// Registers an allocated class with its defining loader.
    pub fn load_class(&mut self, t: TypeRef) -> Result<(), RuntimeError> {
        let c = self.class(t)?;
        let key = (c.name.clone(), c.loader);
        let hidden = c
            .as_instance()
            .is_some_and(|ic| ic.has_internal(internal::HIDDEN));
        if !hidden {
            if self.defined.contains_key(&key) {
                return Err(RuntimeError::DuplicateClass { name: key.0 });
            }
            self.defined.insert(key, t);
        }
        self.advance_state(t, LifecycleState::Loaded)
    }

    /// Allocates and loads a class, as the ordinary loader does.
    pub fn define_class(&mut self, def: ClassDefinition) -> Result<TypeRef, RuntimeError> {
        let t = self.allocate_class(def)?;
        self.load_class(t)?;
        Ok(t)
    }

    /// Moves `t` forward to `to`. Regressions and terminal changes fail.
    pub fn advance_state(&mut self, t: TypeRef, to: LifecycleState) -> Result<(), RuntimeError> {
        let c = self.class_mut(t)?;
        let from = c.state;
        if from == to {
            return Ok(());
        }
        if !to.is_at_least(from) || from.is_terminal() {
            return Err(RuntimeError::IllegalTransition {
                name: c.name.clone(),
                from,
                to,
            });
        }
        c.state = to;
        Ok(())
    }

    /// Runs initialization: links, initializes the superclass, then `t`.
    ///
    /// Class initializers are not interpreted; static state is whatever
    /// linking and `ConstantValue` attributes establish.
    pub fn initialize_class(&mut self, t: TypeRef) -> Result<(), RuntimeError> {
        if self.class(t)?.state.is_terminal() {
            return Ok(());
        }
        self.link_class(t)?;
        if let Some(s) = self.class(t)?.super_class {
            self.initialize_class(s)?;
        }
        self.advance_state(t, LifecycleState::BeingInitialized)?;
        self.advance_state(t, LifecycleState::FullyInitialized)
    }

    /// Completes an initialization in progress, recording `error` if it failed.
    pub fn finish_initialization(
        &mut self,
        t: TypeRef,
        error: Option<ObjRef>,
    ) -> Result<(), RuntimeError> {
        let c = self.class(t)?;
        if c.state != LifecycleState::BeingInitialized {
            return Err(RuntimeError::IllegalTransition {
                name: c.name.clone(),
                from: c.state,
                to: if error.is_some() {
                    LifecycleState::InitializationError
                } else {
                    LifecycleState::FullyInitialized
                },
            });
        }
        match error {
            Some(e) => {
                self.instance_mut(t)?.init_error = Some(e);
                self.advance_state(t, LifecycleState::InitializationError)
            }
            None => self.advance_state(t, LifecycleState::FullyInitialized),
        }
    }

    // ── Array types ─────────────────────────────────────────────────────

    /// Array type of primitive `kind`.
    #[must_use]
    pub fn prim_array_class(&self, kind: PrimKind) -> TypeRef {
        self.prim_arrays[kind.ordinal()]
    }

    /// One-dimension-higher array type of `t`, created on first use.
    pub fn array_class(&mut self, t: TypeRef) -> Result<TypeRef, RuntimeError> {
        let c = self.class(t)?;
        if let Some(a) = c.array_class {
            return Ok(a);
        }
        let dimension = match c.kind {
            ClassKind::Instance(_) => 1,
            ClassKind::PrimArray(_) => 2,
            ClassKind::ObjArray { dimension, .. } => dimension.saturating_add(1),
        };
        let array = Class {
            name: format!("[{}", c.descriptor()),
            loader: c.loader,
            kind: ClassKind::ObjArray {
                component: t,
                dimension,
            },
            access_flags: access::PUBLIC | access::FINAL | access::ABSTRACT,
            super_class: Some(self.well_known.object),
            interfaces: Vec::new(),
            mirror: None,
            state: LifecycleState::FullyInitialized,
            array_class: None,
        };
        let a = self.push_class(array)?;
        self.class_mut(t)?.array_class = Some(a);
        Ok(a)
    }

    // ── Mirrors ─────────────────────────────────────────────────────────

    fn create_mirror(&mut self, t: TypeRef) -> Result<ObjRef, RuntimeError> {
        let m = self.new_instance(self.well_known.class)?;
        let c = self.class(t)?;
        let loader = c.loader;
        let component = match c.kind {
            ClassKind::Instance(_) => None,
            ClassKind::ObjArray { component, .. } => self.class(component)?.mirror,
            ClassKind::PrimArray(k) => self.prim_mirror(k),
        };
        self.set_field(m, fields::CLASS_LOADER, Value::Ref(loader))?;
        self.set_field(m, fields::COMPONENT_TYPE, Value::Ref(component))?;
        self.class_mut(t)?.mirror = Some(m);
        self.mirrors.insert(m, Mirrored::Type(t));
        Ok(m)
    }

    /// Type-descriptor object of `t`.
    #[must_use]
    pub fn mirror(&self, t: TypeRef) -> Option<ObjRef> {
        self.classes.get(t.index())?.mirror
    }

    /// What `obj` describes, if it is a mirror.
    #[must_use]
    pub fn mirrored(&self, obj: ObjRef) -> Option<Mirrored> {
        self.mirrors.get(&obj).copied()
    }

    /// The type `obj` mirrors, if any.
    #[must_use]
    pub fn type_of_mirror(&self, obj: ObjRef) -> Option<TypeRef> {
        match self.mirrored(obj)? {
            Mirrored::Type(t) => Some(t),
            Mirrored::Primitive(_) => None,
        }
    }

    /// Mirror of a primitive type.
    #[must_use]
    pub fn prim_mirror(&self, kind: PrimKind) -> Option<ObjRef> {
        self.prim_mirrors.get(kind.ordinal()).copied()
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Allocates an instance of linked class `t` with zeroed fields.
    pub fn new_instance(&mut self, t: TypeRef) -> Result<ObjRef, RuntimeError> {
        let c = self.class(t)?;
        if c.is_interface() {
            return Err(RuntimeError::NotInstanceClass {
                name: c.name.clone(),
            });
        }
        let values = self
            .layout(t)?
            .slots
            .iter()
            .map(|s| Value::default_for(&s.descriptor))
            .collect();
        Ok(self.heap.alloc(t, ObjectBody::Instance(values)))
    }

    /// Allocates a null-filled array of `component` references.
    pub fn new_object_array(
        &mut self,
        component: TypeRef,
        len: usize,
    ) -> Result<ObjRef, RuntimeError> {
        let a = self.array_class(component)?;
        Ok(self.heap.alloc(a, ObjectBody::ObjArray(vec![None; len])))
    }

    /// Allocates a primitive array holding `bytes` (little-endian elements).
    pub fn new_prim_array(&mut self, kind: PrimKind, bytes: Vec<u8>) -> ObjRef {
        let a = self.prim_array_class(kind);
        self.heap.alloc(a, ObjectBody::PrimArray(bytes))
    }

    /// Allocates a fresh string object.
    pub fn new_string(&mut self, s: &str) -> Result<ObjRef, RuntimeError> {
        let (coder, bytes) = if s.chars().all(|c| u32::from(c) <= 0xFF) {
            (0i8, s.chars().map(|c| u32::from(c) as u8).collect::<Vec<_>>())
        } else {
            (
                1i8,
                s.encode_utf16().flat_map(u16::to_le_bytes).collect::<Vec<_>>(),
            )
        };
        let value = self.new_prim_array(PrimKind::Byte, bytes);
        let obj = self.new_instance(self.well_known.string)?;
        self.set_field(obj, fields::STRING_VALUE, Value::Ref(Some(value)))?;
        self.set_field(obj, fields::STRING_CODER, Value::Byte(coder))?;
        Ok(obj)
    }

    /// Contents of a string object.
    #[must_use]
    pub fn string_value(&self, obj: ObjRef) -> Option<String> {
        if self.class_of(obj).ok()? != self.well_known.string {
            return None;
        }
        let value = self.get_field(obj, fields::STRING_VALUE).ok()?.as_reference()??;
        let coder = self.get_field(obj, fields::STRING_CODER).ok()?;
        let ObjectBody::PrimArray(bytes) = &self.object(value).ok()?.body else {
            return None;
        };
        Some(decode_string(bytes, coder == Value::Byte(1)))
    }

    /// Canonical string object for `s`, allocating it on first use.
    pub fn intern(&mut self, s: &str) -> Result<ObjRef, RuntimeError> {
        if let Some(r) = self.interned.get(s) {
            return Ok(*r);
        }
        let r = self.new_string(s)?;
        self.interned.insert(s.to_owned(), r);
        self.interned_objects.insert(r);
        Ok(r)
    }

    /// Interned string object for `s`, if any.
    #[must_use]
    pub fn interned(&self, s: &str) -> Option<ObjRef> {
        self.interned.get(s).copied()
    }

    /// Returns `true` if `obj` is the canonical interned copy of its contents.
    #[must_use]
    pub fn is_interned(&self, obj: ObjRef) -> bool {
        self.interned_objects.contains(&obj)
    }

    // ── Field access ────────────────────────────────────────────────────

    fn slot_index(&self, t: TypeRef, name: &str) -> Result<usize, RuntimeError> {
        self.layout(t)?
            .slots
            .iter()
            .rposition(|s| s.name == name)
            .ok_or_else(|| RuntimeError::NoSuchField {
                holder: self.class(t).map(|c| c.name.clone()).unwrap_or_default(),
                name: name.to_owned(),
            })
    }

    /// Instance field slots of `t`, supertype fields first.
    pub fn instance_slots(&self, t: TypeRef) -> Result<&[InstanceSlot], RuntimeError> {
        Ok(&self.layout(t)?.slots)
    }

    /// Reads a field by name (the most-derived declaration wins).
    pub fn get_field(&self, obj: ObjRef, name: &str) -> Result<Value, RuntimeError> {
        let o = self.object(obj)?;
        let i = self.slot_index(o.class, name)?;
        self.get_slot(obj, i)
    }

    /// Writes a field by name.
    pub fn set_field(&mut self, obj: ObjRef, name: &str, value: Value) -> Result<(), RuntimeError> {
        let class = self.class_of(obj)?;
        let i = self.slot_index(class, name)?;
        self.set_slot(obj, i, value)
    }

    /// Reads a flattened instance slot.
    pub fn get_slot(&self, obj: ObjRef, slot: usize) -> Result<Value, RuntimeError> {
        match &self.object(obj)?.body {
            ObjectBody::Instance(values) => {
                values.get(slot).copied().ok_or(RuntimeError::WrongShape(obj))
            }
            _ => Err(RuntimeError::WrongShape(obj)),
        }
    }

    /// Writes a flattened instance slot.
    pub fn set_slot(&mut self, obj: ObjRef, slot: usize, value: Value) -> Result<(), RuntimeError> {
        let o = self.heap.get_mut(obj).ok_or(RuntimeError::UnknownObject(obj))?;
        match &mut o.body {
            ObjectBody::Instance(values) => {
                let v = values.get_mut(slot).ok_or(RuntimeError::WrongShape(obj))?;
                *v = value;
                Ok(())
            }
            _ => Err(RuntimeError::WrongShape(obj)),
        }
    }

    /// Elements of a reference array.
    pub fn elements(&self, arr: ObjRef) -> Result<&[Option<ObjRef>], RuntimeError> {
        match &self.object(arr)?.body {
            ObjectBody::ObjArray(e) => Ok(e),
            _ => Err(RuntimeError::WrongShape(arr)),
        }
    }

    /// Writes one element of a reference array.
    pub fn set_element(
        &mut self,
        arr: ObjRef,
        index: usize,
        value: Option<ObjRef>,
    ) -> Result<(), RuntimeError> {
        let o = self.heap.get_mut(arr).ok_or(RuntimeError::UnknownObject(arr))?;
        match &mut o.body {
            ObjectBody::ObjArray(e) => {
                let slot = e.get_mut(index).ok_or(RuntimeError::WrongShape(arr))?;
                *slot = value;
                Ok(())
            }
            _ => Err(RuntimeError::WrongShape(arr)),
        }
    }

    /// Descriptors of `t`'s static fields, by static ordinal.
    pub fn static_descriptors(&self, t: TypeRef) -> Result<Vec<String>, RuntimeError> {
        let ic = self.instance(t)?;
        let layout = self.layout(t)?;
        Ok(layout
            .static_fields
            .iter()
            .filter_map(|i| ic.fields.get(usize::from(*i)))
            .map(|f| f.signature.clone())
            .collect())
    }

    fn static_ordinal(&self, t: TypeRef, name: &str) -> Result<usize, RuntimeError> {
        let ic = self.instance(t)?;
        let layout = self.layout(t)?;
        layout
            .static_fields
            .iter()
            .position(|i| ic.fields.get(usize::from(*i)).is_some_and(|f| f.name == name))
            .ok_or_else(|| RuntimeError::NoSuchField {
                holder: self.class(t).map(|c| c.name.clone()).unwrap_or_default(),
                name: name.to_owned(),
            })
    }

    /// Reads a static field by name.
    pub fn static_value(&self, t: TypeRef, name: &str) -> Result<Value, RuntimeError> {
        let i = self.static_ordinal(t, name)?;
        self.instance(t)?
            .statics
            .get(i)
            .copied()
            .ok_or(RuntimeError::UnknownType(t))
    }

    /// Writes a static field by name.
    pub fn set_static(&mut self, t: TypeRef, name: &str, value: Value) -> Result<(), RuntimeError> {
        let i = self.static_ordinal(t, name)?;
        self.set_static_at(t, i, value)
    }

    /// Writes a static field by static ordinal.
    pub fn set_static_at(&mut self, t: TypeRef, ordinal: usize, value: Value) -> Result<(), RuntimeError> {
        let ic = self.instance_mut(t)?;
        let v = ic
            .statics
            .get_mut(ordinal)
            .ok_or(RuntimeError::UnknownType(t))?;
        *v = value;
        Ok(())
    }

    // ── Member lookup ───────────────────────────────────────────────────

    /// Method declared by `holder` with this name, descriptor and kind.
    #[must_use]
    pub fn find_method(
        &self,
        holder: TypeRef,
        name: &str,
        signature: &str,
        kind: MethodKind,
    ) -> Option<MethodRef> {
        let ic = self.instance(holder).ok()?;
        ic.methods
            .iter()
            .position(|m| m.name == name && m.signature == signature && m.kind() == kind)
            .map(|i| MethodRef::Declared {
                holder,
                index: i as u16,
            })
    }

    /// Field declared by `holder` with this name, descriptor and staticness.
    #[must_use]
    pub fn find_field(
        &self,
        holder: TypeRef,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> Option<FieldRef> {
        let ic = self.instance(holder).ok()?;
        ic.fields
            .iter()
            .position(|f| f.name == name && f.signature == signature && f.is_static() == is_static)
            .map(|i| FieldRef {
                holder,
                index: i as u16,
            })
    }

    /// Holder and declaration of a method.
    #[must_use]
    pub fn method(&self, m: MethodRef) -> Option<(TypeRef, &MethodInfo)> {
        match m {
            MethodRef::Declared { holder, index } => self
                .instance(holder)
                .ok()?
                .methods
                .get(usize::from(index))
                .map(|info| (holder, info)),
            MethodRef::Intrinsic(i) => self
                .intrinsics
                .get(i as usize)
                .map(|x| (x.holder, &x.info)),
        }
    }

    /// Declaration of a field.
    #[must_use]
    pub fn field(&self, f: FieldRef) -> Option<&FieldInfo> {
        self.instance(f.holder).ok()?.fields.get(usize::from(f.index))
    }

    /// Byte offset of a declared field in the current layout of its holder.
    #[must_use]
    pub fn field_offset(&self, holder: TypeRef, name: &str, signature: &str) -> Option<u32> {
        let ic = self.instance(holder).ok()?;
        let layout = ic.layout.as_ref()?;
        let i = ic
            .fields
            .iter()
            .position(|f| f.name == name && f.signature == signature)?;
        layout.field_offsets.get(i).copied()
    }

    /// Returns `true` if `holder` synthesizes methods named `name` on demand.
    #[must_use]
    pub fn is_signature_polymorphic(&self, holder: TypeRef, name: &str) -> bool {
        if holder != self.well_known.method_handle && holder != self.well_known.var_handle {
            return false;
        }
        self.instance(holder).is_ok_and(|ic| {
            ic.methods.iter().any(|m| {
                m.name == name
                    && m.access_flags & (access::NATIVE | access::VARARGS)
                        == access::NATIVE | access::VARARGS
                    && m.signature == bootstrap::POLYMORPHIC_SIGNATURE
            })
        })
    }

    /// Intrinsic for a signature-polymorphic call, synthesized on first use.
    pub fn signature_polymorphic_intrinsic(
        &mut self,
        holder: TypeRef,
        name: &str,
        signature: &str,
    ) -> Option<MethodRef> {
        if !self.is_signature_polymorphic(holder, name) {
            return None;
        }
        if let Some(i) = self
            .intrinsics
            .iter()
            .position(|x| x.holder == holder && x.info.name == name && x.info.signature == signature)
        {
            return Some(MethodRef::Intrinsic(i as u32));
        }
        let generic = self
            .instance(holder)
            .ok()?
            .methods
            .iter()
            .find(|m| m.name == name)?;
        let info = MethodInfo::new(
            name,
            signature,
            generic.access_flags & !access::VARARGS | access::SYNTHETIC | access::FINAL,
            None,
        );
        self.intrinsics.push(Intrinsic { holder, info });
        Some(MethodRef::Intrinsic((self.intrinsics.len() - 1) as u32))
    }

    // ── Subtyping ───────────────────────────────────────────────────────

    /// Returns `true` if `t`, a supertype, or an inherited interface is named `name`.
    #[must_use]
    pub fn has_supertype_named(&self, t: TypeRef, name: &str) -> bool {
        let mut stack = vec![t];
        let mut seen = FxHashSet::default();
        while let Some(cur) = stack.pop() {
            if !seen.insert(cur) {
                continue;
            }
            let Ok(c) = self.class(cur) else { continue };
            if c.name == name {
                return true;
            }
            stack.extend(c.super_class);
            stack.extend(c.interfaces.iter().copied());
        }
        false
    }

    /// Returns `true` if a value of runtime type `t` may be stored in a
    /// location declared with field descriptor `descriptor`.
    #[must_use]
    pub fn is_assignable_to(&self, t: TypeRef, descriptor: &str) -> bool {
        if descriptor == "Ljava/lang/Object;" {
            return true;
        }
        let Ok(c) = self.class(t) else { return false };
        if let Some(name) = descriptor.strip_prefix('L').and_then(|d| d.strip_suffix(';')) {
            return self.has_supertype_named(t, name);
        }
        let Some(element) = descriptor.strip_prefix('[') else {
            return false;
        };
        match c.kind {
            ClassKind::PrimArray(k) => PrimKind::from_descriptor(element) == Some(k),
            ClassKind::ObjArray { component, .. } => self.is_assignable_to(component, element),
            ClassKind::Instance(_) => false,
        }
    }

    // ── Call sites ──────────────────────────────────────────────────────

    /// Allocates a fresh, empty dependency context for a call site.
    pub fn new_call_site_context(&mut self) -> Result<ObjRef, RuntimeError> {
        self.new_instance(self.well_known.call_site_context)
    }

    /// Attaches `context` to `call_site`.
    pub fn register_call_site_context(
        &mut self,
        call_site: ObjRef,
        context: ObjRef,
    ) -> Result<(), RuntimeError> {
        self.set_field(call_site, fields::CALL_SITE_CONTEXT, Value::Ref(Some(context)))?;
        self.call_site_contexts.insert(call_site, context);
        Ok(())
    }

    /// Context registered for `call_site`.
    #[must_use]
    pub fn call_site_context(&self, call_site: ObjRef) -> Option<ObjRef> {
        self.call_site_contexts.get(&call_site).copied()
    }
}

/// Decodes string contents by coder: Latin-1 bytes or UTF-16LE units.
pub(crate) fn decode_string(bytes: &[u8], utf16: bool) -> String {
    if utf16 {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|b| char::from(*b)).collect()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn strings_round_trip_through_both_coders() {
        let mut rt = Runtime::bootstrap().unwrap();
        let latin = rt.new_string("café").unwrap();
        let wide = rt.new_string("λx").unwrap();
        assert_eq!(rt.string_value(latin).as_deref(), Some("café"));
        assert_eq!(rt.string_value(wide).as_deref(), Some("λx"));
        assert_eq!(rt.get_field(wide, fields::STRING_CODER).unwrap(), Value::Byte(1));
    }

    #[test]
    fn intern_returns_canonical_copy() {
        let mut rt = Runtime::bootstrap().unwrap();
        let a = rt.intern("k").unwrap();
        let b = rt.intern("k").unwrap();
        let c = rt.new_string("k").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(rt.is_interned(a));
        assert!(!rt.is_interned(c));
    }

    #[test]
    fn state_never_regresses() {
        let mut rt = Runtime::bootstrap().unwrap();
        let s = rt.well_known().string;
        let err = rt.advance_state(s, LifecycleState::Linked).unwrap_err();
        assert!(matches!(err, RuntimeError::IllegalTransition { .. }));
        let err = rt
            .advance_state(s, LifecycleState::InitializationError)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::IllegalTransition { .. }));
    }

    #[test]
    fn array_assignability_follows_components() {
        let mut rt = Runtime::bootstrap().unwrap();
        let s = rt.well_known().string;
        let sa = rt.array_class(s).unwrap();
        assert!(rt.is_assignable_to(sa, "[Ljava/lang/String;"));
        assert!(rt.is_assignable_to(sa, "[Ljava/lang/Object;"));
        assert!(!rt.is_assignable_to(sa, "[I"));
        let ia = rt.prim_array_class(PrimKind::Int);
        assert!(rt.is_assignable_to(ia, "[I"));
        assert!(!rt.is_assignable_to(ia, "Ljava/lang/String;"));
        assert_eq!(rt.resolve_class("[Ljava/lang/String;", None), Some(sa));
    }

    #[test]
    fn signature_polymorphic_intrinsics_are_shared() {
        let mut rt = Runtime::bootstrap().unwrap();
        let mh = rt.well_known().method_handle;
        let a = rt
            .signature_polymorphic_intrinsic(mh, "invokeExact", "(I)I")
            .unwrap();
        let b = rt
            .signature_polymorphic_intrinsic(mh, "invokeExact", "(I)I")
            .unwrap();
        assert_eq!(a, b);
        assert!(rt
            .signature_polymorphic_intrinsic(mh, "notThere", "(I)I")
            .is_none());
        let (holder, info) = rt.method(a).unwrap();
        assert_eq!(holder, mh);
        assert_eq!(info.signature, "(I)I");
    }
}
