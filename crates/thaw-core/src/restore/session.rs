// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Restore session: one identity table across both snapshot streams.
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use rustc_hash::FxHashSet;
use tracing::{debug, info, instrument};

use super::lifecycle;
use super::loader::{obtain_loader, LoaderContext, LoaderProvider};
use super::objects::ObjectRestorer;
use super::resolve::{resolve_deferred, resolve_member};
use super::{ParsedUnit, UnfilledTypeInfo};
use crate::codec::stream::SnapshotReader;
use crate::codec::{read_class_record, read_features, read_preamble, RecordScope, CLASS_MAGIC};
use crate::config::RestoreConfig;
use crate::error::{FormatError, Relation, RestoreError};
use crate::heap::{CapturedThread, FrameValue, HeapSource, RecordBody, RestoredFrame, RestoredThread, StackSlot};
use crate::ident::{IdWidth, ObjectId};
use crate::identity::{IdentityTable, LiveRef};
use crate::runtime::{
    fields, ClassKind, LifecycleState, ObjRef, PrimKind, Runtime, TypeRef,
};

/// Restores a class dump and its heap into a runtime.
///
/// The session borrows the runtime for the whole restore, which stands in
/// for stopping every other mutator. Threads that only hold the runtime's
/// [`RestoreGate`](crate::runtime::RestoreGate) wait on it for types still
/// being restored.
pub struct RestoreSession<'a> {
    rt: &'a mut Runtime,
    heap: &'a dyn HeapSource,
    loaders: &'a mut dyn LoaderProvider,
    ids: IdentityTable,
    config: RestoreConfig,
    statics_pending: FxHashSet<TypeRef>,
}

impl<'a> RestoreSession<'a> {
    /// Session restoring into `rt` from `heap`, preparing loaders with `loaders`.
    pub fn new(
        rt: &'a mut Runtime,
        heap: &'a dyn HeapSource,
        loaders: &'a mut dyn LoaderProvider,
        config: RestoreConfig,
    ) -> Self {
        Self {
            rt,
            heap,
            loaders,
            ids: IdentityTable::new(),
            config,
            statics_pending: FxHashSet::default(),
        }
    }

    /// Identities bound so far.
    #[must_use]
    pub const fn identities(&self) -> &IdentityTable {
        &self.ids
    }

    /// The runtime being restored into.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        self.rt
    }

    /// Ends the session, handing back the identity table.
    #[must_use]
    pub fn finish(self) -> IdentityTable {
        self.ids
    }

    /// Parses the class dump at `path`.
    pub fn parse(&mut self, path: impl AsRef<Path>) -> Result<ParsedUnit, RestoreError> {
        let file = File::open(path)?;
        self.parse_from(BufReader::new(file))
    }

    /// Parses a class dump: defines every type, resolves their deferred
    /// references and applies initiating loaders.
    ///
    /// Fails on the first violation; types defined before it stay defined.
    #[instrument(skip_all)]
    pub fn parse_from<R: Read>(&mut self, input: R) -> Result<ParsedUnit, RestoreError> {
        let mut r = SnapshotReader::new(input, IdWidth::W8);
        read_preamble(&mut r, &CLASS_MAGIC)?;
        let features = read_features(&mut r)?;
        features.check_against(&self.config)?;
        let mut unit = ParsedUnit {
            features,
            ..ParsedUnit::default()
        };

        for kind in PrimKind::ALL {
            let id = r.id()?;
            let t = self.rt.prim_array_class(kind);
            self.ids.insert_preexisting(id, LiveRef::Type(t))?;
            self.bind_array_ids(&mut r, t)?;
        }

        let keep_invisible = self.config.preserve_invisible_annotations;
        let mut pending = Vec::new();
        while let Some(id) = r.id_or_end()? {
            let parsed = read_class_record(&mut r, id, self, keep_invisible)?;
            let defined = lifecycle::define(self.rt, &mut self.ids, parsed)?;
            unit.types.push((id, defined.ty));
            if let Some(info) = defined.unfilled {
                unit.unfilled.push((defined.ty, info));
            }
            pending.push((defined.ty, defined.deferred));
            self.bind_array_ids(&mut r, defined.ty)?;
        }
        for (t, deferred) in pending {
            resolve_deferred(self.rt, &self.ids, t, deferred, &mut unit.appendices)?;
        }

        while let Some(loader_id) = r.id_or_end()? {
            let loader = self.loader(loader_id, "")?;
            while let Some(type_id) = r.id_or_end()? {
                let t = self.ids.type_of(type_id)?;
                self.rt.add_initiating_loader(loader, t)?;
            }
        }

        self.statics_pending = unit.unfilled.iter().map(|(t, _)| *t).collect();
        let gate = self.rt.restore_gate();
        for (_, t) in &unit.types {
            if !self.statics_pending.contains(t) {
                gate.clear(*t, self.rt.class(*t)?.state);
            }
        }
        info!(
            types = unit.types.len(),
            pending_init = unit.unfilled.len(),
            appendices = unit.appendices.len(),
            "class dump parsed"
        );
        Ok(unit)
    }

    /// Binds the identities of `t[]`, `t[][]`, ... up to the list end.
    fn bind_array_ids<R: Read>(
        &mut self,
        r: &mut SnapshotReader<R>,
        t: TypeRef,
    ) -> Result<(), RestoreError> {
        let mut current = t;
        while let Some(id) = r.id_or_end()? {
            let existed = self.rt.class(current)?.array_class.is_some();
            current = self.rt.array_class(current)?;
            if existed {
                self.ids.insert_preexisting(id, LiveRef::Type(current))?;
            } else {
                self.ids.insert(id, LiveRef::Type(current))?;
            }
        }
        Ok(())
    }

    fn loader(&mut self, id: ObjectId, requester: &str) -> Result<ObjRef, RestoreError> {
        let mut cx = LoaderContext {
            runtime: &mut *self.rt,
            identities: &mut self.ids,
            heap: self.heap,
            config: &self.config,
            requester,
        };
        obtain_loader(&mut *self.loaders, &mut cx, id)
    }

    fn objects(&mut self) -> ObjectRestorer<'_> {
        ObjectRestorer::new(
            &mut *self.rt,
            &mut self.ids,
            self.heap,
            &mut *self.loaders,
            &self.config,
            &self.statics_pending,
        )
    }

    /// Live object for `id`, restoring it from the heap on first use.
    ///
    /// Memoized: every call with the same identity yields the same object.
    pub fn restore(&mut self, id: ObjectId) -> Result<Option<ObjRef>, RestoreError> {
        self.objects().restore(id)
    }

    /// Restores the heap state `unit` still owes, then `threads`, and
    /// completes initialization of every pending type.
    #[instrument(skip_all)]
    pub fn restore_heap(
        &mut self,
        unit: &ParsedUnit,
        threads: &[CapturedThread],
    ) -> Result<Vec<RestoredThread>, RestoreError> {
        self.reconcile_preexisting()?;

        let mut objects = self.objects();
        let mut errors = Vec::with_capacity(unit.unfilled.len());
        for (t, info) in &unit.unfilled {
            let id = objects
                .ids
                .id_of_type(*t)
                .ok_or_else(|| FormatError::CorruptRecord(format!("type {t:?} has no identity")))?;
            objects.restore(id)?;
            errors.push(objects.restore(info.init_error)?);
        }
        for p in &unit.appendices {
            let appendix = objects.restore(p.appendix)?;
            let entry = objects
                .rt
                .instance_mut(p.ty)?
                .linkage
                .as_mut()
                .and_then(|l| l.indys.get_mut(p.entry))
                .and_then(|e| e.resolved.as_mut())
                .ok_or_else(|| FormatError::CorruptRecord(format!("appendix {} has no call site", p.appendix)))?;
            entry.appendix = appendix;
        }
        let mut restored = Vec::with_capacity(threads.len());
        for thread in threads {
            restored.push(restore_thread(&mut objects, thread)?);
        }
        loop {
            let pending = objects.ids.drain_pending_fills();
            if pending.is_empty() {
                break;
            }
            for id in pending {
                objects.resume(id)?;
            }
        }

        let gate = objects.rt.restore_gate();
        for ((t, info), error) in unit.unfilled.iter().zip(errors) {
            finish(objects.rt, *t, *info, error)?;
            gate.clear(*t, objects.rt.class(*t)?.state);
        }
        drop(objects);
        self.statics_pending.clear();
        info!(
            identities = self.ids.len(),
            initialized = unit.unfilled.len(),
            threads = restored.len(),
            "heap restored"
        );
        Ok(restored)
    }

    /// Queues a fill for every type descriptor the runtime already holds,
    /// and binds the primitive descriptors that only appear as components
    /// of primitive array types.
    fn reconcile_preexisting(&mut self) -> Result<(), RestoreError> {
        let class_type = self.rt.well_known().class;
        let heap = self.heap;
        let width = heap.id_width();
        for (id, t) in self.ids.types() {
            let Some(record) = heap.record(id) else {
                continue;
            };
            self.ids.defer_fill(id);
            let ClassKind::PrimArray(kind) = self.rt.class(t)?.kind else {
                continue;
            };
            let RecordBody::Instance { fields: blob, .. } = &record.body else {
                return Err(FormatError::IdentityKindMismatch {
                    id,
                    expected: "a type descriptor",
                }
                .into());
            };
            let slots = self.rt.instance_slots(class_type)?;
            let component = crate::heap::field_value(slots, blob, width, fields::COMPONENT_TYPE)?
                .reference()?;
            if component.is_null() || self.ids.contains(component) {
                continue;
            }
            let mirror = self.rt.prim_mirror(kind).ok_or_else(|| {
                FormatError::CorruptRecord(format!("no descriptor for primitive {}", kind.keyword()))
            })?;
            self.ids.insert_preexisting(component, LiveRef::Object(mirror))?;
            self.ids.defer_fill(component);
            debug!(%component, kind = kind.keyword(), "primitive descriptor bound");
        }
        Ok(())
    }
}

impl RecordScope for RestoreSession<'_> {
    fn dependency(
        &self,
        id: ObjectId,
        relation: Relation,
        class: &str,
    ) -> Result<TypeRef, RestoreError> {
        match self.ids.type_of(id) {
            Ok(t) => Ok(t),
            Err(FormatError::MissingIdentity(_)) => Err(FormatError::OrderingViolation {
                relation,
                id,
                class: class.to_owned(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    fn defining_loader(&mut self, id: ObjectId, class: &str) -> Result<ObjRef, RestoreError> {
        self.loader(id, class)
    }
}

fn restore_thread(
    objects: &mut ObjectRestorer<'_>,
    captured: &CapturedThread,
) -> Result<RestoredThread, RestoreError> {
    let thread = objects
        .restore(captured.thread)?
        .ok_or_else(|| FormatError::CorruptRecord("captured stack without a thread".into()))?;
    let mut frames = Vec::with_capacity(captured.frames.len());
    for f in &captured.frames {
        let method = resolve_member(objects.rt, objects.ids, &f.method)?;
        let mut slot = |s: &StackSlot| -> Result<FrameValue, RestoreError> {
            Ok(match *s {
                StackSlot::Prim(bits) => FrameValue::Prim(bits),
                StackSlot::Ref(id) => FrameValue::Ref(objects.restore(id)?),
            })
        };
        let locals = f.locals.iter().map(&mut slot).collect::<Result<Vec<_>, _>>()?;
        let operands = f.operands.iter().map(&mut slot).collect::<Result<Vec<_>, _>>()?;
        let monitors = f
            .monitors
            .iter()
            .map(|m| {
                objects.restore(*m)?.ok_or_else(|| {
                    FormatError::CorruptRecord("null monitor in captured frame".into()).into()
                })
            })
            .collect::<Result<Vec<_>, RestoreError>>()?;
        frames.push(RestoredFrame {
            method,
            bci: f.bci,
            locals,
            operands,
            monitors,
        });
    }
    Ok(RestoredThread { thread, frames })
}

/// Completes the initialization `info` describes.
fn finish(
    rt: &mut Runtime,
    t: TypeRef,
    info: UnfilledTypeInfo,
    error: Option<ObjRef>,
) -> Result<(), RestoreError> {
    let error = match (info.target, error) {
        (LifecycleState::InitializationError, Some(e)) => Some(e),
        (LifecycleState::FullyInitialized, None) => None,
        (target, error) => {
            return Err(FormatError::CorruptRecord(format!(
                "{}: target {target:?} with initialization error {error:?}",
                rt.class(t)?.name
            ))
            .into())
        }
    };
    rt.finish_initialization(t, error)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::codec::{dump_order, write_in_order};
    use crate::config::DumpOptions;
    use crate::heap::HeapDumper;
    use crate::restore::SnapshotLoaderProvider;
    use crate::runtime::{access, names, ClassDefinition, InstanceClass, Value};

    fn plain(name: &str, loader: Option<ObjRef>, super_class: TypeRef) -> ClassDefinition {
        ClassDefinition {
            name: name.into(),
            loader,
            super_class: Some(super_class),
            interfaces: Vec::new(),
            access_flags: access::PUBLIC | access::SUPER,
            body: InstanceClass::default(),
        }
    }

    /// Parses a dump of `src` whose record order was changed by `reorder`.
    fn parse_reordered(src: &Runtime, reorder: impl FnOnce(&mut Vec<TypeRef>)) -> RestoreError {
        let mut order = dump_order(src).unwrap();
        reorder(&mut order);
        let mut bytes = Vec::new();
        write_in_order(src, &mut bytes, &DumpOptions::default(), &order).unwrap();
        let heap = HeapDumper::new(src).unwrap().snapshot(&[]).unwrap();

        let mut rt = Runtime::bootstrap().unwrap();
        let mut loaders = SnapshotLoaderProvider;
        let mut session = RestoreSession::new(&mut rt, &heap, &mut loaders, RestoreConfig::default());
        session.parse_from(bytes.as_slice()).unwrap_err()
    }

    /// Parses a dump of `src` whose records for `first` and `second` are swapped.
    fn parse_swapped(src: &Runtime, first: TypeRef, second: TypeRef) -> RestoreError {
        parse_reordered(src, |order| {
            let a = order.iter().position(|t| *t == first).unwrap();
            let b = order.iter().position(|t| *t == second).unwrap();
            assert!(a < b, "dump order must already be topological");
            order.swap(a, b);
        })
    }

    fn loader(src: &mut Runtime, class: TypeRef, parent: Option<ObjRef>, name: &str) -> ObjRef {
        let loader = src.new_instance(class).unwrap();
        let name = src.new_string(name).unwrap();
        src.set_field(loader, fields::LOADER_PARENT, Value::Ref(parent))
            .unwrap();
        src.set_field(loader, fields::LOADER_NAME, Value::Ref(Some(name)))
            .unwrap();
        loader
    }

    #[test]
    fn subclass_before_superclass_is_an_ordering_violation() {
        let mut src = Runtime::bootstrap().unwrap();
        let object = src.well_known().object;
        let base = src.define_class(plain("demo/Base", None, object)).unwrap();
        let derived = src.define_class(plain("demo/Derived", None, base)).unwrap();

        let err = parse_swapped(&src, base, derived);
        assert!(
            matches!(
                &err,
                RestoreError::Format(FormatError::OrderingViolation {
                    relation: Relation::Super,
                    class,
                    ..
                }) if class == "demo/Derived"
            ),
            "{err:?}"
        );
    }

    #[test]
    fn class_before_its_loaders_class_is_an_ordering_violation() {
        let mut src = Runtime::bootstrap().unwrap();
        let wk = *src.well_known();
        let loader_class = src
            .define_class(plain("demo/Loader", None, wk.class_loader))
            .unwrap();
        src.initialize_class(loader_class).unwrap();
        let loader = loader(&mut src, loader_class, None, "app");
        let app = src
            .define_class(plain("demo/App", Some(loader), wk.object))
            .unwrap();
        assert!(src.has_supertype_named(loader_class, names::CLASS_LOADER));

        let err = parse_swapped(&src, loader_class, app);
        assert!(
            matches!(
                &err,
                RestoreError::Format(FormatError::OrderingViolation {
                    relation: Relation::DefiningLoader,
                    class,
                    ..
                }) if class == "demo/App"
            ),
            "{err:?}"
        );
    }

    #[test]
    fn implementor_before_its_interface_is_an_ordering_violation() {
        let mut src = Runtime::bootstrap().unwrap();
        let object = src.well_known().object;
        let shape = src
            .define_class(ClassDefinition {
                access_flags: access::PUBLIC | access::INTERFACE | access::ABSTRACT,
                ..plain("demo/I", None, object)
            })
            .unwrap();
        let concrete = src
            .define_class(ClassDefinition {
                interfaces: vec![shape],
                ..plain("demo/C", None, object)
            })
            .unwrap();

        let err = parse_swapped(&src, shape, concrete);
        assert!(
            matches!(
                &err,
                RestoreError::Format(FormatError::OrderingViolation {
                    relation: Relation::Interface,
                    class,
                    ..
                }) if class == "demo/C"
            ),
            "{err:?}"
        );
    }

    #[test]
    fn class_before_its_loaders_parent_class_is_an_ordering_violation() {
        let mut src = Runtime::bootstrap().unwrap();
        let wk = *src.well_known();
        let parent_class = src
            .define_class(plain("demo/ParentLoader", None, wk.class_loader))
            .unwrap();
        let child_class = src
            .define_class(plain("demo/ChildLoader", None, wk.class_loader))
            .unwrap();
        src.initialize_class(parent_class).unwrap();
        src.initialize_class(child_class).unwrap();
        let platform = loader(&mut src, parent_class, None, "platform");
        let app_loader = loader(&mut src, child_class, Some(platform), "app");
        let app = src
            .define_class(plain("demo/App", Some(app_loader), wk.object))
            .unwrap();

        // Only the parent's class moves; the defining loader's class stays ahead.
        let err = parse_reordered(&src, |order| {
            let from = order.iter().position(|t| *t == parent_class).unwrap();
            let to = order.iter().position(|t| *t == app).unwrap();
            assert!(from < to);
            let moved = order.remove(from);
            order.insert(to, moved);
        });
        assert!(
            matches!(
                &err,
                RestoreError::Format(FormatError::OrderingViolation {
                    relation: Relation::LoaderParent,
                    class,
                    ..
                }) if class == "demo/App"
            ),
            "{err:?}"
        );
    }

    #[test]
    fn parsed_types_are_marked_until_the_heap_completes_them() {
        let mut src = Runtime::bootstrap().unwrap();
        let object = src.well_known().object;
        let done = src.define_class(plain("demo/Done", None, object)).unwrap();
        src.initialize_class(done).unwrap();
        let linked = src.define_class(plain("demo/Linked", None, object)).unwrap();
        src.link_class(linked).unwrap();
        let mut bytes = Vec::new();
        crate::codec::dump_to(&src, &mut bytes, &DumpOptions::default()).unwrap();
        let heap = HeapDumper::new(&src).unwrap().snapshot(&[]).unwrap();

        let mut rt = Runtime::bootstrap().unwrap();
        let gate = rt.restore_gate();
        let mut loaders = SnapshotLoaderProvider;
        let mut session = RestoreSession::new(&mut rt, &heap, &mut loaders, RestoreConfig::default());
        let unit = session.parse_from(bytes.as_slice()).unwrap();

        let pending: Vec<TypeRef> = unit.unfilled.iter().map(|(t, _)| *t).collect();
        assert_eq!(gate.marked(), {
            let mut p = pending.clone();
            p.sort_unstable();
            p
        });
        let linked_now = session.runtime().find_defined("demo/Linked", None).unwrap();
        assert!(!gate.is_marked(linked_now));
        assert_eq!(
            session.runtime().class(linked_now).unwrap().state,
            LifecycleState::Linked
        );

        session.restore_heap(&unit, &[]).unwrap();
        assert_eq!(gate.marked_count(), 0);
        let done_now = session.runtime().find_defined("demo/Done", None).unwrap();
        assert_eq!(
            session.runtime().class(done_now).unwrap().state,
            LifecycleState::FullyInitialized
        );
    }
}
