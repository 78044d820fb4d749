// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Class-dump parser.
//!
//! Produces unlinked class definitions plus the deferred references each
//! one needs. The four structural relations of a record (supertype,
//! interfaces, defining loader, loader parent) are resolved while the
//! record is read and must already be restored: they are never deferred.
#![allow(clippy::cast_possible_truncation)]

use std::io::Read;

use bytes::Bytes;

use super::deferred::{DeferredRef, FieldDesc, LinkDesc, MemberDesc};
use super::format::{cp_tag, indy_state, link_tag, Features, FORMAT_VERSION};
use super::stream::SnapshotReader;
use crate::error::{FormatError, Relation, RestoreError, Unsupported};
use crate::ident::{IdWidth, ObjectId};
use crate::runtime::{
    internal, tag, AnnotationSet, BootstrapMethod, ClassAttributes, ClassDefinition, ClassSlot,
    ConstantPool, CpEntry, EnclosingMethod, ExceptionHandler, FieldInfo, InnerClass,
    InstanceClass, LifecycleState, LineNumber, LinkageCache, LocalVariable, MethodInfo,
    MethodParameter, ObjRef, RecordComponent, ResolutionError, TypeRef,
};

/// Upper bound on any linkage-cache section; entries are indexed by `u16`.
const MAX_CACHE_ENTRIES: usize = u16::MAX as usize;

/// One class record, parsed but not yet defined.
#[derive(Clone, Debug)]
pub struct ParsedClass {
    /// Identity of the type.
    pub id: ObjectId,
    /// Unlinked definition.
    pub definition: ClassDefinition,
    /// Lifecycle state the type reached when dumped.
    pub target: LifecycleState,
    /// Identity of the recorded initialization error, or null.
    pub init_error: ObjectId,
    /// Recorded virtual dispatch table length.
    pub vtable_len: usize,
    /// Recorded interface dispatch table length.
    pub itable_len: usize,
    /// References to complete once the unit is loaded.
    pub deferred: Vec<DeferredRef>,
}

/// Resolution of the structural relations of a record in progress.
pub(crate) trait RecordScope {
    /// Type bound to `id`; fails with an ordering violation if unbound.
    fn dependency(
        &self,
        id: ObjectId,
        relation: Relation,
        class: &str,
    ) -> Result<TypeRef, RestoreError>;

    /// Prepared loader object for `id`.
    fn defining_loader(&mut self, id: ObjectId, class: &str) -> Result<ObjRef, RestoreError>;
}

/// Reads a stream header: magic, version and identity width.
pub(crate) fn read_preamble<R: Read>(
    r: &mut SnapshotReader<R>,
    magic: &[u8; 16],
) -> Result<IdWidth, RestoreError> {
    let found: [u8; 16] = r.array_n()?;
    if &found != magic {
        return Err(FormatError::BadMagic {
            found: found.to_vec(),
        }
        .into());
    }
    let version = r.u16()?;
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion {
            found: version,
            expected: FORMAT_VERSION,
        }
        .into());
    }
    let byte = r.u8()?;
    let width = IdWidth::from_byte(byte).ok_or(FormatError::BadIdWidth(byte))?;
    r.set_width(width);
    Ok(width)
}

/// Reads the producer feature vector following a class-dump preamble.
pub(crate) fn read_features<R: Read>(r: &mut SnapshotReader<R>) -> Result<Features, RestoreError> {
    let n = r.u8()?;
    let mut bytes = Vec::with_capacity(usize::from(n));
    for _ in 0..n {
        bytes.push(r.u8()?);
    }
    Ok(Features::from_bytes(&bytes)?)
}

/// Reads one class record (the identity has already been consumed).
pub(crate) fn read_class_record<R: Read>(
    r: &mut SnapshotReader<R>,
    id: ObjectId,
    scope: &mut dyn RecordScope,
    keep_invisible: bool,
) -> Result<ParsedClass, RestoreError> {
    let name = r.str("class name")?;
    let loader_id = r.id()?;
    let super_id = r.id()?;
    let interface_ids = r.required_array("interfaces", SnapshotReader::id)?;

    let super_class = if super_id.is_null() {
        None
    } else {
        Some(scope.dependency(super_id, Relation::Super, &name)?)
    };
    let interfaces = interface_ids
        .into_iter()
        .map(|i| scope.dependency(i, Relation::Interface, &name))
        .collect::<Result<Vec<_>, _>>()?;
    let loader = if loader_id.is_null() {
        None
    } else {
        Some(scope.defining_loader(loader_id, &name)?)
    };

    let access_flags = r.u16()?;
    let internal_flags = r.u16()?;
    if internal_flags & internal::MODIFIED_BY_AGENT != 0 {
        return Err(Unsupported::ModifiedByAgent(name).into());
    }
    let code = r.u8()?;
    let target = LifecycleState::from_code(code).ok_or(FormatError::IllegalTag {
        what: "lifecycle state",
        tag: code,
    })?;
    if target != target.stable() || target == LifecycleState::Allocated {
        return Err(Unsupported::TargetState {
            name,
            state: target,
        }
        .into());
    }
    let init_error = r.id()?;
    let vtable_len = r.u32()? as usize;
    let itable_len = r.u32()? as usize;

    let mut p = RecordParser {
        keep_invisible,
        deferred: Vec::new(),
    };
    let attributes = p.attributes(r)?;
    let constants = p.constants(r)?;
    let linkage = if internal_flags & internal::REWRITTEN != 0 {
        Some(p.linkage(r)?)
    } else {
        None
    };
    let fields = r.required_array("fields", |r| p.field(r))?;
    let methods = r.required_array("methods", |r| p.method(r))?;
    let cached_class_file = r.bytes()?;

    Ok(ParsedClass {
        id,
        definition: ClassDefinition {
            name,
            loader,
            super_class,
            interfaces,
            access_flags,
            body: InstanceClass {
                internal_flags,
                attributes,
                constants,
                linkage,
                fields,
                methods,
                cached_class_file,
                ..InstanceClass::default()
            },
        },
        target,
        init_error,
        vtable_len,
        itable_len,
        deferred: p.deferred,
    })
}

struct RecordParser {
    keep_invisible: bool,
    deferred: Vec<DeferredRef>,
}

impl RecordParser {
    fn annotations<R: Read>(&self, r: &mut SnapshotReader<R>) -> Result<AnnotationSet, RestoreError> {
        let visible = r.bytes()?;
        let invisible = r.bytes()?;
        Ok(AnnotationSet {
            visible,
            invisible: invisible.filter(|_| self.keep_invisible),
        })
    }

    fn attributes<R: Read>(&self, r: &mut SnapshotReader<R>) -> Result<ClassAttributes, RestoreError> {
        let source_file = r.string()?;
        let generic_signature = r.string()?;
        let source_debug_extension = r.bytes()?;
        let nest_host_index = read_opt_u16(r)?;
        let nest_members = r.array(SnapshotReader::u16)?;
        let inner_classes = r.array(|r| {
            Ok(InnerClass {
                inner_class_index: r.u16()?,
                outer_class_index: r.u16()?,
                inner_name_index: r.u16()?,
                access_flags: r.u16()?,
            })
        })?;
        let enclosing_method = if r.bool()? {
            Some(EnclosingMethod {
                class_index: r.u16()?,
                method_index: r.u16()?,
            })
        } else {
            None
        };
        let permitted_subclasses = r.array(SnapshotReader::u16)?;
        let annotations = self.annotations(r)?;
        let type_annotations = self.annotations(r)?;
        let bootstrap_methods = r.array(|r| {
            Ok(BootstrapMethod {
                method_ref: r.u16()?,
                arguments: r.required_array("bootstrap arguments", SnapshotReader::u16)?,
            })
        })?;
        let record_components = r.array(|r| {
            Ok(RecordComponent {
                name: r.str("record component name")?,
                signature: r.str("record component signature")?,
                generic_signature: r.string()?,
                annotations: self.annotations(r)?,
                type_annotations: self.annotations(r)?,
            })
        })?;
        Ok(ClassAttributes {
            source_file,
            generic_signature,
            source_debug_extension,
            nest_host_index,
            nest_members,
            inner_classes,
            enclosing_method,
            permitted_subclasses,
            annotations,
            type_annotations,
            bootstrap_methods,
            record_components,
        })
    }

    fn constants<R: Read>(&mut self, r: &mut SnapshotReader<R>) -> Result<ConstantPool, RestoreError> {
        let count = usize::from(r.u16()?);
        let original_len = r.u16()?;
        if usize::from(original_len) > count || count == 0 {
            return Err(FormatError::CorruptRecord(format!(
                "constant pool length {count}, original length {original_len}"
            ))
            .into());
        }
        let mut entries = Vec::with_capacity(count);
        entries.push(CpEntry::Invalid);
        while entries.len() < count {
            let index = u16::try_from(entries.len())
                .map_err(|_| FormatError::CorruptRecord(format!("constant pool length {count}")))?;
            let entry = self.constant(r, index)?;
            let wide = entry.is_wide();
            entries.push(entry);
            if wide {
                entries.push(CpEntry::Invalid);
            }
        }
        if entries.len() != count {
            return Err(FormatError::CorruptRecord("wide constant overruns the pool".into()).into());
        }
        Ok(ConstantPool::from_entries(entries, original_len))
    }

    fn constant<R: Read>(
        &mut self,
        r: &mut SnapshotReader<R>,
        index: u16,
    ) -> Result<CpEntry, RestoreError> {
        let t = r.u8()?;
        Ok(match t {
            0 => CpEntry::Invalid,
            tag::UTF8 => CpEntry::Utf8(r.str("utf8 constant")?),
            tag::INTEGER => CpEntry::Integer(i32::from_le_bytes(r.array_n()?)),
            tag::FLOAT => CpEntry::Float(r.u32()?),
            tag::LONG => CpEntry::Long(i64::from_le_bytes(r.array_n()?)),
            tag::DOUBLE => CpEntry::Double(r.u64()?),
            tag::CLASS => {
                let name_index = r.u16()?;
                let target = r.id()?;
                self.deferred.push(DeferredRef::CpClass { index, target });
                CpEntry::Class {
                    name_index,
                    slot: ClassSlot::Unresolved,
                }
            }
            cp_tag::UNRESOLVED_CLASS => CpEntry::Class {
                name_index: r.u16()?,
                slot: ClassSlot::Unresolved,
            },
            cp_tag::CLASS_IN_ERROR => CpEntry::Class {
                name_index: r.u16()?,
                slot: ClassSlot::Error(read_resolution_error(r)?),
            },
            tag::STRING => CpEntry::String {
                string_index: r.u16()?,
            },
            tag::FIELD_REF => CpEntry::FieldRef {
                class_index: r.u16()?,
                name_and_type_index: r.u16()?,
            },
            tag::METHOD_REF => CpEntry::MethodRef {
                class_index: r.u16()?,
                name_and_type_index: r.u16()?,
            },
            tag::INTERFACE_METHOD_REF => CpEntry::InterfaceMethodRef {
                class_index: r.u16()?,
                name_and_type_index: r.u16()?,
            },
            tag::NAME_AND_TYPE => CpEntry::NameAndType {
                name_index: r.u16()?,
                descriptor_index: r.u16()?,
            },
            tag::METHOD_HANDLE | cp_tag::METHOD_HANDLE_IN_ERROR => CpEntry::MethodHandle {
                kind: r.u8()?,
                reference_index: r.u16()?,
                error: read_error_if(r, t == cp_tag::METHOD_HANDLE_IN_ERROR)?,
            },
            tag::METHOD_TYPE | cp_tag::METHOD_TYPE_IN_ERROR => CpEntry::MethodType {
                descriptor_index: r.u16()?,
                error: read_error_if(r, t == cp_tag::METHOD_TYPE_IN_ERROR)?,
            },
            tag::DYNAMIC | cp_tag::DYNAMIC_IN_ERROR => CpEntry::Dynamic {
                bootstrap_index: r.u16()?,
                name_and_type_index: r.u16()?,
                error: read_error_if(r, t == cp_tag::DYNAMIC_IN_ERROR)?,
            },
            tag::INVOKE_DYNAMIC => CpEntry::InvokeDynamic {
                bootstrap_index: r.u16()?,
                name_and_type_index: r.u16()?,
            },
            other => {
                return Err(FormatError::IllegalTag {
                    what: "constant pool",
                    tag: other,
                }
                .into())
            }
        })
    }

    fn section_len<R: Read>(r: &mut SnapshotReader<R>, what: &str) -> Result<usize, RestoreError> {
        let n = r
            .len()?
            .ok_or_else(|| FormatError::CorruptRecord(format!("{what} count is absent")))?;
        if n > MAX_CACHE_ENTRIES {
            return Err(FormatError::CorruptRecord(format!("{what} count {n} is too large")).into());
        }
        Ok(n)
    }

    /// Allocates the whole cache from the declared counts, then fills it.
    fn linkage<R: Read>(&mut self, r: &mut SnapshotReader<R>) -> Result<LinkageCache, RestoreError> {
        let nf = Self::section_len(r, "field entry")?;
        let nm = Self::section_len(r, "method entry")?;
        let ni = Self::section_len(r, "call-site entry")?;
        let mut cache = LinkageCache::with_shape(nf, nm, ni);

        for (entry, fe) in cache.fields.iter_mut().enumerate() {
            fe.cp_index = r.u16()?;
            if r.bool()? {
                self.deferred.push(DeferredRef::Field {
                    entry,
                    get_code: r.u8()?,
                    put_code: r.u8()?,
                    flags: r.u8()?,
                    field: FieldDesc::read_from(r)?,
                });
            }
        }
        for (entry, me) in cache.methods.iter_mut().enumerate() {
            me.cp_index = r.u16()?;
            let bytecode1 = r.u8()?;
            let bytecode2 = r.u8()?;
            let flags = r.u8()?;
            let f1 = read_link(r)?;
            let f2 = read_link(r)?;
            // A dispatch index is meaningless here: leave the entry unresolved
            // so the next call re-resolves it.
            let (LinkSlot::Portable(f1), LinkSlot::Portable(f2)) = (f1, f2) else {
                continue;
            };
            if bytecode1 != 0 || bytecode2 != 0 || f1.is_some() || f2.is_some() {
                self.deferred.push(DeferredRef::Method {
                    entry,
                    bytecode1,
                    bytecode2,
                    flags,
                    f1,
                    f2,
                });
            }
        }
        for (entry, ie) in cache.indys.iter_mut().enumerate() {
            ie.cp_index = r.u16()?;
            match r.u8()? {
                indy_state::UNRESOLVED => {}
                indy_state::RESOLVED => {
                    let adapter = MemberDesc::read_from(r)?;
                    let appendix = r.id()?;
                    self.deferred.push(DeferredRef::Indy {
                        entry,
                        adapter,
                        appendix,
                    });
                }
                indy_state::ERROR => ie.error = Some(read_resolution_error(r)?),
                other => {
                    return Err(FormatError::IllegalTag {
                        what: "call-site state",
                        tag: other,
                    }
                    .into())
                }
            }
        }
        Ok(cache)
    }

    fn field<R: Read>(&self, r: &mut SnapshotReader<R>) -> Result<FieldInfo, RestoreError> {
        Ok(FieldInfo {
            name: r.str("field name")?,
            signature: r.str("field signature")?,
            access_flags: r.u16()?,
            internal_flags: r.u8()?,
            constant_value_index: read_opt_u16(r)?,
            generic_signature: r.string()?,
            annotations: self.annotations(r)?,
            type_annotations: self.annotations(r)?,
        })
    }

    fn method<R: Read>(&self, r: &mut SnapshotReader<R>) -> Result<MethodInfo, RestoreError> {
        let name = r.str("method name")?;
        let signature = r.str("method signature")?;
        let access_flags = r.u16()?;
        let internal_flags = r.u8()?;
        let max_stack = r.u16()?;
        let max_locals = r.u16()?;
        let code: Option<Bytes> = r.bytes()?;
        let exception_table = r.required_array("exception table", |r| {
            Ok(ExceptionHandler {
                start_pc: r.u16()?,
                end_pc: r.u16()?,
                handler_pc: r.u16()?,
                catch_type: r.u16()?,
            })
        })?;
        let line_numbers = r.array(|r| {
            Ok(LineNumber {
                start_pc: r.u16()?,
                line: r.u16()?,
            })
        })?;
        let local_variables = r.array(|r| {
            Ok(LocalVariable {
                start_pc: r.u16()?,
                length: r.u16()?,
                name: r.str("local variable name")?,
                signature: r.str("local variable signature")?,
                slot: r.u16()?,
            })
        })?;
        let checked_exceptions = r.required_array("checked exceptions", SnapshotReader::u16)?;
        let parameters = r.array(|r| {
            Ok(MethodParameter {
                name: r.string()?,
                access_flags: r.u16()?,
            })
        })?;
        Ok(MethodInfo {
            name,
            signature,
            access_flags,
            internal_flags,
            max_stack,
            max_locals,
            code,
            exception_table,
            line_numbers,
            local_variables,
            checked_exceptions,
            parameters,
            annotations: self.annotations(r)?,
            parameter_annotations: self.annotations(r)?,
            annotation_default: r.bytes()?,
            type_annotations: self.annotations(r)?,
        })
    }
}

enum LinkSlot {
    Portable(Option<LinkDesc>),
    StaleIndex,
}

fn read_link<R: Read>(r: &mut SnapshotReader<R>) -> Result<LinkSlot, RestoreError> {
    Ok(match r.u8()? {
        link_tag::NONE => LinkSlot::Portable(None),
        link_tag::TYPE => LinkSlot::Portable(Some(LinkDesc::Type(r.id()?))),
        link_tag::METHOD => LinkSlot::Portable(Some(LinkDesc::Method(MemberDesc::read_from(r)?))),
        link_tag::STALE_INDEX => LinkSlot::StaleIndex,
        other => {
            return Err(FormatError::IllegalTag {
                what: "link",
                tag: other,
            }
            .into())
        }
    })
}

fn read_opt_u16<R: Read>(r: &mut SnapshotReader<R>) -> Result<Option<u16>, RestoreError> {
    let present = r.bool()?;
    let v = r.u16()?;
    Ok(present.then_some(v))
}

fn read_resolution_error<R: Read>(r: &mut SnapshotReader<R>) -> Result<ResolutionError, RestoreError> {
    Ok(ResolutionError {
        error_class: r.str("resolution error class")?,
        message: r.string()?,
        cause_class: r.string()?,
        cause_message: r.string()?,
    })
}

fn read_error_if<R: Read>(
    r: &mut SnapshotReader<R>,
    present: bool,
) -> Result<Option<ResolutionError>, RestoreError> {
    if present {
        read_resolution_error(r).map(Some)
    } else {
        Ok(None)
    }
}
