// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Class-dump writer.
//!
//! Output is a pure function of the runtime state: records are emitted in
//! a fixed order and derived layout (field offsets, dispatch-table slots)
//! is never written, only the sizes needed to validate recomputation.
#![allow(clippy::cast_possible_truncation)]

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use rustc_hash::FxHashSet;
use tracing::{debug, info, instrument};

use super::deferred::{FieldDesc, MemberDesc};
use super::format::{cp_tag, indy_state, link_tag, Features, CLASS_MAGIC, FORMAT_VERSION};
use super::object_id;
use super::stream::SnapshotWriter;
use crate::config::DumpOptions;
use crate::error::DumpError;
use crate::ident::{IdWidth, ObjectId};
use crate::runtime::{
    internal, tag, AnnotationSet, ClassAttributes, ClassSlot, CpEntry, FieldInfo, LifecycleState,
    LinkageCache, Link, MethodInfo, PrimKind, ResolutionError, Runtime, TypeRef,
};

/// Writes the class dump of `rt` to `path`.
///
/// The caller must hold the runtime still for the duration (the shared
/// borrow enforces it). Fails with [`DumpError::AlreadyExists`] if `path`
/// exists and `overwrite` is `false`.
pub fn dump(
    rt: &Runtime,
    path: impl AsRef<Path>,
    overwrite: bool,
    options: &DumpOptions,
) -> Result<(), DumpError> {
    let file = create_dump_file(path.as_ref(), overwrite)?;
    let mut out = BufWriter::new(file);
    dump_to(rt, &mut out, options)?;
    out.flush()?;
    Ok(())
}

/// Creates a dump target, refusing to clobber it unless `overwrite`.
pub(crate) fn create_dump_file(path: &Path, overwrite: bool) -> Result<File, DumpError> {
    let mut open = OpenOptions::new();
    open.write(true);
    if overwrite {
        open.create(true).truncate(true);
    } else {
        open.create_new(true);
    }
    open.open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::AlreadyExists {
            DumpError::AlreadyExists(path.display().to_string())
        } else {
            DumpError::Io(e)
        }
    })
}

/// Writes the class dump of `rt` to `out`.
#[instrument(skip_all)]
pub fn dump_to<W: Write>(rt: &Runtime, out: W, options: &DumpOptions) -> Result<(), DumpError> {
    let order = dump_order(rt)?;
    write_in_order(rt, out, options, &order)
}

/// Writes the class dump with class records in exactly `order`.
pub(crate) fn write_in_order<W: Write>(
    rt: &Runtime,
    out: W,
    options: &DumpOptions,
    order: &[TypeRef],
) -> Result<(), DumpError> {
    let width =
        IdWidth::fitting(rt.heap().len() as u64).ok_or(DumpError::IdSpaceExhausted)?;
    let mut w = SnapshotWriter::new(out, width);
    w.raw(&CLASS_MAGIC)?;
    w.u16(FORMAT_VERSION)?;
    w.u8(width.bytes() as u8)?;
    let features = Features::from_options(options).to_bytes();
    w.u8(features.len() as u8)?;
    w.raw(&features)?;

    let cw = ClassWriter { rt, options };
    for kind in PrimKind::ALL {
        let t = rt.prim_array_class(kind);
        w.id(cw.type_id(t)?)?;
        cw.write_array_ids(&mut w, t)?;
    }
    for t in order {
        w.id(cw.type_id(*t)?)?;
        cw.write_record(&mut w, *t)?;
        cw.write_array_ids(&mut w, *t)?;
    }
    w.end()?;
    cw.write_initiating_loaders(&mut w)?;
    info!(
        classes = order.len(),
        width = width.bytes(),
        "class dump written"
    );
    Ok(())
}

fn dumpable(rt: &Runtime, t: TypeRef) -> bool {
    rt.class(t)
        .is_ok_and(|c| !c.is_array() && c.state != LifecycleState::Allocated)
}

/// Instance classes such that supertypes, interfaces and the classes of
/// every loader on the defining loader's parent chain come first.
pub(crate) fn dump_order(rt: &Runtime) -> Result<Vec<TypeRef>, DumpError> {
    let mut order = Vec::new();
    let mut seen = FxHashSet::default();
    for (t, _) in rt.classes() {
        if dumpable(rt, t) {
            visit(rt, t, &mut seen, &mut order)?;
        }
    }
    Ok(order)
}

fn visit(
    rt: &Runtime,
    t: TypeRef,
    seen: &mut FxHashSet<TypeRef>,
    order: &mut Vec<TypeRef>,
) -> Result<(), DumpError> {
    if !seen.insert(t) {
        return Ok(());
    }
    let c = rt.class(t)?;
    let mut deps: Vec<TypeRef> = c.super_class.into_iter().chain(c.interfaces.iter().copied()).collect();
    let mut loader = c.loader;
    while let Some(l) = loader {
        deps.push(rt.class_of(l)?);
        loader = rt.loader_parent(l)?;
    }
    for dep in deps {
        if dumpable(rt, dep) {
            visit(rt, dep, seen, order)?;
        }
    }
    order.push(t);
    Ok(())
}

struct ClassWriter<'a> {
    rt: &'a Runtime,
    options: &'a DumpOptions,
}

impl ClassWriter<'_> {
    fn type_id(&self, t: TypeRef) -> Result<ObjectId, DumpError> {
        self.rt.mirror(t).map(object_id).ok_or_else(|| {
            DumpError::Inconsistent(format!(
                "type {} has no type descriptor",
                self.rt.class(t).map(|c| c.name.as_str()).unwrap_or("?")
            ))
        })
    }

    fn opt_type_id(&self, t: Option<TypeRef>) -> Result<ObjectId, DumpError> {
        t.map_or(Ok(ObjectId::NULL), |t| self.type_id(t))
    }

    fn write_array_ids<W: Write>(
        &self,
        w: &mut SnapshotWriter<W>,
        t: TypeRef,
    ) -> Result<(), DumpError> {
        let mut next = self.rt.class(t).ok().and_then(|c| c.array_class);
        while let Some(a) = next {
            w.id(self.type_id(a)?)?;
            next = self.rt.class(a).ok().and_then(|c| c.array_class);
        }
        w.end()?;
        Ok(())
    }

    fn write_record<W: Write>(&self, w: &mut SnapshotWriter<W>, t: TypeRef) -> Result<(), DumpError> {
        let rt = self.rt;
        let c = rt.class(t)?;
        let ic = c
            .as_instance()
            .ok_or_else(|| DumpError::Inconsistent(format!("{} is an array type", c.name)))?;
        if ic.has_internal(internal::MODIFIED_BY_AGENT) {
            debug!(class = %c.name, "dumping agent-modified class; restore will refuse it");
        }
        w.str(&c.name)?;
        w.id(c.loader.map_or(ObjectId::NULL, object_id))?;
        w.id(self.opt_type_id(c.super_class)?)?;
        let interfaces = c
            .interfaces
            .iter()
            .map(|i| self.type_id(*i))
            .collect::<Result<Vec<_>, _>>()?;
        w.array(Some(interfaces.as_slice()), |w, id| w.id(*id))?;
        w.u16(c.access_flags)?;
        w.u16(ic.internal_flags)?;
        let target = c.state.stable();
        w.u8(target.code())?;
        let init_error = match (target, ic.init_error) {
            (LifecycleState::InitializationError, Some(e)) => object_id(e),
            _ => ObjectId::NULL,
        };
        w.id(init_error)?;
        let (vtable_len, itable_len) = ic
            .layout
            .as_ref()
            .map_or((0, 0), |l| (l.vtable.len(), l.itable_len()));
        for len in [vtable_len, itable_len] {
            let len = u32::try_from(len).map_err(|_| {
                DumpError::Inconsistent(format!("{}: dispatch table of {len} slots", c.name))
            })?;
            w.u32(len)?;
        }

        self.write_attributes(w, &ic.attributes)?;
        self.write_constants(w, t)?;
        if ic.has_internal(internal::REWRITTEN) {
            let cache = ic.linkage.as_ref().ok_or_else(|| {
                DumpError::Inconsistent(format!("{} is rewritten but has no linkage cache", c.name))
            })?;
            self.write_linkage(w, cache)?;
        }
        w.array(Some(ic.fields.as_slice()), |w, f| self.write_field(w, f))?;
        w.array(Some(ic.methods.as_slice()), |w, m| self.write_method(w, m))?;
        w.bytes(ic.cached_class_file.as_deref())?;
        debug!(class = %c.name, state = ?target, "class record written");
        Ok(())
    }

    fn write_annotations<W: Write>(
        &self,
        w: &mut SnapshotWriter<W>,
        set: &AnnotationSet,
    ) -> io::Result<()> {
        w.bytes(set.visible.as_deref())?;
        let invisible = if self.options.preserve_invisible_annotations {
            set.invisible.as_deref()
        } else {
            None
        };
        w.bytes(invisible)
    }

    fn write_attributes<W: Write>(
        &self,
        w: &mut SnapshotWriter<W>,
        a: &ClassAttributes,
    ) -> io::Result<()> {
        w.string(a.source_file.as_deref())?;
        w.string(a.generic_signature.as_deref())?;
        w.bytes(a.source_debug_extension.as_deref())?;
        write_opt_u16(w, a.nest_host_index)?;
        w.array(a.nest_members.as_deref(), |w, i| w.u16(*i))?;
        w.array(a.inner_classes.as_deref(), |w, ic| {
            w.u16(ic.inner_class_index)?;
            w.u16(ic.outer_class_index)?;
            w.u16(ic.inner_name_index)?;
            w.u16(ic.access_flags)
        })?;
        w.bool(a.enclosing_method.is_some())?;
        if let Some(em) = a.enclosing_method {
            w.u16(em.class_index)?;
            w.u16(em.method_index)?;
        }
        w.array(a.permitted_subclasses.as_deref(), |w, i| w.u16(*i))?;
        self.write_annotations(w, &a.annotations)?;
        self.write_annotations(w, &a.type_annotations)?;
        w.array(a.bootstrap_methods.as_deref(), |w, bm| {
            w.u16(bm.method_ref)?;
            w.array(Some(bm.arguments.as_slice()), |w, i| w.u16(*i))
        })?;
        w.array(a.record_components.as_deref(), |w, rc| {
            w.str(&rc.name)?;
            w.str(&rc.signature)?;
            w.string(rc.generic_signature.as_deref())?;
            self.write_annotations(w, &rc.annotations)?;
            self.write_annotations(w, &rc.type_annotations)
        })
    }

    fn write_constants<W: Write>(&self, w: &mut SnapshotWriter<W>, t: TypeRef) -> Result<(), DumpError> {
        let ic = self.rt.instance(t)?;
        let cp = &ic.constants;
        let count = u16::try_from(cp.len())
            .map_err(|_| DumpError::Inconsistent("constant pool too large".into()))?;
        w.u16(count)?;
        w.u16(cp.original_len())?;
        let mut entries = cp.entries().iter().skip(1);
        while let Some(e) = entries.next() {
            self.write_constant(w, e)?;
            if e.is_wide() {
                entries.next();
            }
        }
        Ok(())
    }

    fn write_constant<W: Write>(&self, w: &mut SnapshotWriter<W>, e: &CpEntry) -> Result<(), DumpError> {
        match e {
            CpEntry::Invalid => w.u8(0)?,
            CpEntry::Utf8(s) => {
                w.u8(tag::UTF8)?;
                w.str(s)?;
            }
            CpEntry::Integer(v) => {
                w.u8(tag::INTEGER)?;
                w.raw(&v.to_le_bytes())?;
            }
            CpEntry::Float(bits) => {
                w.u8(tag::FLOAT)?;
                w.u32(*bits)?;
            }
            CpEntry::Long(v) => {
                w.u8(tag::LONG)?;
                w.raw(&v.to_le_bytes())?;
            }
            CpEntry::Double(bits) => {
                w.u8(tag::DOUBLE)?;
                w.u64(*bits)?;
            }
            CpEntry::Class { name_index, slot } => match slot {
                ClassSlot::Unresolved => {
                    w.u8(cp_tag::UNRESOLVED_CLASS)?;
                    w.u16(*name_index)?;
                }
                ClassSlot::Resolved(target) => {
                    w.u8(tag::CLASS)?;
                    w.u16(*name_index)?;
                    w.id(self.type_id(*target)?)?;
                }
                ClassSlot::Error(err) => {
                    w.u8(cp_tag::CLASS_IN_ERROR)?;
                    w.u16(*name_index)?;
                    write_resolution_error(w, err)?;
                }
            },
            CpEntry::String { string_index } => {
                w.u8(tag::STRING)?;
                w.u16(*string_index)?;
            }
            CpEntry::FieldRef {
                class_index,
                name_and_type_index,
            } => write_pair(w, tag::FIELD_REF, *class_index, *name_and_type_index)?,
            CpEntry::MethodRef {
                class_index,
                name_and_type_index,
            } => write_pair(w, tag::METHOD_REF, *class_index, *name_and_type_index)?,
            CpEntry::InterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => write_pair(
                w,
                tag::INTERFACE_METHOD_REF,
                *class_index,
                *name_and_type_index,
            )?,
            CpEntry::NameAndType {
                name_index,
                descriptor_index,
            } => write_pair(w, tag::NAME_AND_TYPE, *name_index, *descriptor_index)?,
            CpEntry::MethodHandle {
                kind,
                reference_index,
                error,
            } => {
                w.u8(if error.is_some() {
                    cp_tag::METHOD_HANDLE_IN_ERROR
                } else {
                    tag::METHOD_HANDLE
                })?;
                w.u8(*kind)?;
                w.u16(*reference_index)?;
                if let Some(err) = error {
                    write_resolution_error(w, err)?;
                }
            }
            CpEntry::MethodType {
                descriptor_index,
                error,
            } => {
                w.u8(if error.is_some() {
                    cp_tag::METHOD_TYPE_IN_ERROR
                } else {
                    tag::METHOD_TYPE
                })?;
                w.u16(*descriptor_index)?;
                if let Some(err) = error {
                    write_resolution_error(w, err)?;
                }
            }
            CpEntry::Dynamic {
                bootstrap_index,
                name_and_type_index,
                error,
            } => {
                let t = if error.is_some() {
                    cp_tag::DYNAMIC_IN_ERROR
                } else {
                    tag::DYNAMIC
                };
                write_pair(w, t, *bootstrap_index, *name_and_type_index)?;
                if let Some(err) = error {
                    write_resolution_error(w, err)?;
                }
            }
            CpEntry::InvokeDynamic {
                bootstrap_index,
                name_and_type_index,
            } => write_pair(
                w,
                tag::INVOKE_DYNAMIC,
                *bootstrap_index,
                *name_and_type_index,
            )?,
        }
        Ok(())
    }

    fn write_linkage<W: Write>(
        &self,
        w: &mut SnapshotWriter<W>,
        cache: &LinkageCache,
    ) -> Result<(), DumpError> {
        let type_id = |t: TypeRef| self.rt.mirror(t).map(object_id);
        w.len(Some(cache.fields.len()))?;
        w.len(Some(cache.methods.len()))?;
        w.len(Some(cache.indys.len()))?;
        for fe in &cache.fields {
            w.u16(fe.cp_index)?;
            w.bool(fe.resolved.is_some())?;
            if let Some(rf) = fe.resolved {
                w.u8(rf.get_code)?;
                w.u8(rf.put_code)?;
                w.u8(rf.flags)?;
                FieldDesc::of_field(self.rt, rf.field, type_id)
                    .ok_or_else(|| DumpError::Inconsistent("dangling field entry".into()))?
                    .write_to(w)?;
            }
        }
        for me in &cache.methods {
            w.u16(me.cp_index)?;
            w.u8(me.bytecode1)?;
            w.u8(me.bytecode2)?;
            w.u8(me.flags)?;
            self.write_link(w, me.f1)?;
            self.write_link(w, me.f2)?;
        }
        for ie in &cache.indys {
            w.u16(ie.cp_index)?;
            match (&ie.resolved, &ie.error) {
                (Some(r), _) => {
                    w.u8(indy_state::RESOLVED)?;
                    MemberDesc::of_method(self.rt, r.adapter, type_id)
                        .ok_or_else(|| DumpError::Inconsistent("dangling call-site adapter".into()))?
                        .write_to(w)?;
                    w.id(r.appendix.map_or(ObjectId::NULL, object_id))?;
                }
                (None, Some(err)) => {
                    w.u8(indy_state::ERROR)?;
                    write_resolution_error(w, err)?;
                }
                (None, None) => w.u8(indy_state::UNRESOLVED)?,
            }
        }
        Ok(())
    }

    fn write_link<W: Write>(&self, w: &mut SnapshotWriter<W>, link: Option<Link>) -> Result<(), DumpError> {
        match link {
            None => w.u8(link_tag::NONE)?,
            Some(Link::Type(t)) => {
                w.u8(link_tag::TYPE)?;
                w.id(self.type_id(t)?)?;
            }
            Some(Link::Method(m)) => {
                w.u8(link_tag::METHOD)?;
                MemberDesc::of_method(self.rt, m, |t| self.rt.mirror(t).map(object_id))
                    .ok_or_else(|| DumpError::Inconsistent("dangling method entry".into()))?
                    .write_to(w)?;
            }
            Some(Link::DispatchIndex(_)) => w.u8(link_tag::STALE_INDEX)?,
        }
        Ok(())
    }

    fn write_field<W: Write>(&self, w: &mut SnapshotWriter<W>, f: &FieldInfo) -> io::Result<()> {
        w.str(&f.name)?;
        w.str(&f.signature)?;
        w.u16(f.access_flags)?;
        w.u8(f.internal_flags)?;
        write_opt_u16(w, f.constant_value_index)?;
        w.string(f.generic_signature.as_deref())?;
        self.write_annotations(w, &f.annotations)?;
        self.write_annotations(w, &f.type_annotations)
    }

    fn write_method<W: Write>(&self, w: &mut SnapshotWriter<W>, m: &MethodInfo) -> io::Result<()> {
        w.str(&m.name)?;
        w.str(&m.signature)?;
        w.u16(m.access_flags)?;
        w.u8(m.internal_flags)?;
        w.u16(m.max_stack)?;
        w.u16(m.max_locals)?;
        w.bytes(m.code.as_deref())?;
        w.array(Some(m.exception_table.as_slice()), |w, h| {
            w.u16(h.start_pc)?;
            w.u16(h.end_pc)?;
            w.u16(h.handler_pc)?;
            w.u16(h.catch_type)
        })?;
        w.array(m.line_numbers.as_deref(), |w, l| {
            w.u16(l.start_pc)?;
            w.u16(l.line)
        })?;
        w.array(m.local_variables.as_deref(), |w, v| {
            w.u16(v.start_pc)?;
            w.u16(v.length)?;
            w.str(&v.name)?;
            w.str(&v.signature)?;
            w.u16(v.slot)
        })?;
        w.array(Some(m.checked_exceptions.as_slice()), |w, i| w.u16(*i))?;
        w.array(m.parameters.as_deref(), |w, p| {
            w.string(p.name.as_deref())?;
            w.u16(p.access_flags)
        })?;
        self.write_annotations(w, &m.annotations)?;
        self.write_annotations(w, &m.parameter_annotations)?;
        w.bytes(m.annotation_default.as_deref())?;
        self.write_annotations(w, &m.type_annotations)
    }

    fn write_initiating_loaders<W: Write>(&self, w: &mut SnapshotWriter<W>) -> Result<(), DumpError> {
        let mut loaders = Vec::new();
        for (loader, _) in self.rt.initiating_entries() {
            if !loaders.contains(loader) {
                loaders.push(*loader);
            }
        }
        for loader in loaders {
            w.id(object_id(loader))?;
            for (l, t) in self.rt.initiating_entries() {
                if *l == loader {
                    w.id(self.type_id(*t)?)?;
                }
            }
            w.end()?;
        }
        w.end()?;
        Ok(())
    }
}

fn write_pair<W: Write>(w: &mut SnapshotWriter<W>, tag: u8, a: u16, b: u16) -> io::Result<()> {
    w.u8(tag)?;
    w.u16(a)?;
    w.u16(b)
}

fn write_opt_u16<W: Write>(w: &mut SnapshotWriter<W>, v: Option<u16>) -> io::Result<()> {
    w.bool(v.is_some())?;
    w.u16(v.unwrap_or(0))
}

fn write_resolution_error<W: Write>(
    w: &mut SnapshotWriter<W>,
    e: &ResolutionError,
) -> io::Result<()> {
    w.str(&e.error_class)?;
    w.string(e.message.as_deref())?;
    w.string(e.cause_class.as_deref())?;
    w.string(e.cause_message.as_deref())
}
