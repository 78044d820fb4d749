// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Core types every runtime predefines before any snapshot is involved.
//!
//! Both the dumping and the restoring runtime start from the same
//! bootstrap universe, so restore always finds these as predefined types
//! and reconciles against them.
use bytes::Bytes;

use super::class::{access, ClassDefinition, InstanceClass, LifecycleState, TypeRef};
use super::constant_pool::ConstantPool;
use super::heap::{ObjRef, PrimKind};
use super::member::{field_flags, FieldInfo, MethodInfo};
use super::{Class, ClassKind, Mirrored, Runtime, RuntimeError};

/// Internal names of the core types.
pub mod names {
    /// Root class.
    pub const OBJECT: &str = "java/lang/Object";
    /// Type-descriptor (mirror) class.
    pub const CLASS: &str = "java/lang/Class";
    /// Immutable string class.
    pub const STRING: &str = "java/lang/String";
    /// Base class of loader objects.
    pub const CLASS_LOADER: &str = "java/lang/ClassLoader";
    /// Base class of errors and exceptions.
    pub const THROWABLE: &str = "java/lang/Throwable";
    /// Thread objects.
    pub const THREAD: &str = "java/lang/Thread";
    /// Resolved-member handles.
    pub const MEMBER_NAME: &str = "java/lang/invoke/MemberName";
    /// Method handles; hosts signature-polymorphic methods.
    pub const METHOD_HANDLE: &str = "java/lang/invoke/MethodHandle";
    /// Variable handles; hosts signature-polymorphic methods.
    pub const VAR_HANDLE: &str = "java/lang/invoke/VarHandle";
    /// Linked call sites.
    pub const CALL_SITE: &str = "java/lang/invoke/CallSite";
    /// Runtime-internal compilation-dependency context of a call site.
    pub const CALL_SITE_CONTEXT: &str = "java/lang/invoke/MethodHandleNatives$CallSiteContext";
}

/// Field names the runtime reads or writes directly.
pub mod fields {
    /// `Class.classLoader`.
    pub const CLASS_LOADER: &str = "classLoader";
    /// `Class.componentType`.
    pub const COMPONENT_TYPE: &str = "componentType";
    /// `Class.name`.
    pub const CLASS_NAME: &str = "name";
    /// `String.value`.
    pub const STRING_VALUE: &str = "value";
    /// `String.coder`.
    pub const STRING_CODER: &str = "coder";
    /// `ClassLoader.parent`.
    pub const LOADER_PARENT: &str = "parent";
    /// `ClassLoader.name`.
    pub const LOADER_NAME: &str = "name";
    /// `MemberName.clazz`.
    pub const MEMBER_CLAZZ: &str = "clazz";
    /// `MemberName.name`.
    pub const MEMBER_NAME: &str = "name";
    /// `MemberName.type`.
    pub const MEMBER_TYPE: &str = "type";
    /// `MemberName.flags`.
    pub const MEMBER_FLAGS: &str = "flags";
    /// `MemberName.vmindex` (injected).
    pub const MEMBER_VMINDEX: &str = "vmindex";
    /// `CallSite.target`.
    pub const CALL_SITE_TARGET: &str = "target";
    /// `CallSite.context`.
    pub const CALL_SITE_CONTEXT: &str = "context";
    /// `Throwable.detailMessage`.
    pub const THROWABLE_MESSAGE: &str = "detailMessage";
}

/// `MemberName.flags` bits.
pub mod member_name_flags {
    /// Names a method.
    pub const IS_METHOD: i32 = 0x0001_0000;
    /// Names a constructor.
    pub const IS_CONSTRUCTOR: i32 = 0x0002_0000;
    /// Names a field.
    pub const IS_FIELD: i32 = 0x0004_0000;
}

/// Mirror fields populated when the mirror is created.
pub const MIRROR_CREATION_FIELDS: [&str; 2] = [fields::CLASS_LOADER, fields::COMPONENT_TYPE];

/// Loader fields populated when the loader is prepared.
pub const LOADER_PREPARED_FIELDS: [&str; 2] = [fields::LOADER_PARENT, fields::LOADER_NAME];

/// Descriptor shared by every signature-polymorphic declaration.
pub(crate) const POLYMORPHIC_SIGNATURE: &str = "([Ljava/lang/Object;)Ljava/lang/Object;";

/// Core types of a bootstrapped runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct WellKnown {
    /// `java/lang/Object`.
    pub object: TypeRef,
    /// `java/lang/Class`.
    pub class: TypeRef,
    /// `java/lang/String`.
    pub string: TypeRef,
    /// `java/lang/ClassLoader`.
    pub class_loader: TypeRef,
    /// `java/lang/Throwable`.
    pub throwable: TypeRef,
    /// `java/lang/Thread`.
    pub thread: TypeRef,
    /// `java/lang/invoke/MemberName`.
    pub member_name: TypeRef,
    /// `java/lang/invoke/MethodHandle`.
    pub method_handle: TypeRef,
    /// `java/lang/invoke/VarHandle`.
    pub var_handle: TypeRef,
    /// `java/lang/invoke/CallSite`.
    pub call_site: TypeRef,
    /// `java/lang/invoke/MethodHandleNatives$CallSiteContext`.
    pub call_site_context: TypeRef,
}

const RETURN: &[u8] = &[0xb1];
const ALOAD0_ARETURN: &[u8] = &[0x2a, 0xb0];
const ICONST0_IRETURN: &[u8] = &[0x03, 0xac];

fn method(name: &str, signature: &str, access_flags: u16, code: Option<&'static [u8]>) -> MethodInfo {
    let mut m = MethodInfo::new(name, signature, access_flags, code.map(Bytes::from_static));
    if m.code.is_some() {
        m.max_stack = 2;
        m.max_locals = 2;
    }
    m
}

fn injected(name: &str, signature: &str) -> FieldInfo {
    let mut f = FieldInfo::new(name, signature, access::PRIVATE);
    f.internal_flags = field_flags::INJECTED;
    f
}

fn core_class(
    name: &str,
    super_class: Option<(TypeRef, &str)>,
    access_flags: u16,
    fields: Vec<FieldInfo>,
    methods: Vec<MethodInfo>,
) -> Result<ClassDefinition, RuntimeError> {
    let mut constants = ConstantPool::default();
    constants.add_class(name)?;
    if let Some((_, super_name)) = super_class {
        constants.add_class(super_name)?;
        if methods.iter().any(|m| m.name == "<init>") {
            constants.add_method_ref(super_name, "<init>", "()V", false)?;
        }
    }
    for f in &fields {
        constants.add_field_ref(name, &f.name, &f.signature)?;
    }
    constants.seal()?;
    Ok(ClassDefinition {
        name: name.to_owned(),
        loader: None,
        super_class: super_class.map(|(t, _)| t),
        interfaces: Vec::new(),
        access_flags,
        body: InstanceClass {
            attributes: super::ClassAttributes {
                source_file: Some(format!(
                    "{}.java",
                    name.rsplit('/').next().unwrap_or(name)
                )),
                ..Default::default()
            },
            constants,
            fields,
            methods,
            ..InstanceClass::default()
        },
    })
}

fn init() -> MethodInfo {
    method("<init>", "()V", access::PUBLIC, Some(RETURN))
}

fn polymorphic(name: &str, extra: u16) -> MethodInfo {
    method(
        name,
        POLYMORPHIC_SIGNATURE,
        access::PUBLIC | access::FINAL | access::NATIVE | access::VARARGS | extra,
        None,
    )
}

impl Runtime {
    /// A runtime holding only the core types, fully initialized, plus
    /// primitive mirrors and every primitive array type.
    pub fn bootstrap() -> Result<Self, RuntimeError> {
        let pub_ = access::PUBLIC;
        let mut rt = Self::empty();
        let object = rt.define_class(core_class(
            names::OBJECT,
            None,
            pub_ | access::SUPER,
            Vec::new(),
            vec![
                init(),
                method("hashCode", "()I", pub_ | access::NATIVE, None),
                method("equals", "(Ljava/lang/Object;)Z", pub_, Some(ICONST0_IRETURN)),
                method("toString", "()Ljava/lang/String;", pub_, Some(ALOAD0_ARETURN)),
            ],
        )?)?;
        let sup = Some((object, names::OBJECT));
        let class = rt.define_class(core_class(
            names::CLASS,
            sup,
            pub_ | access::FINAL | access::SUPER,
            vec![
                FieldInfo::new(fields::CLASS_LOADER, "Ljava/lang/ClassLoader;", access::PRIVATE | access::FINAL),
                FieldInfo::new(fields::COMPONENT_TYPE, "Ljava/lang/Class;", access::PRIVATE | access::FINAL),
                FieldInfo::new(fields::CLASS_NAME, "Ljava/lang/String;", access::PRIVATE),
                FieldInfo::new("classData", "Ljava/lang/Object;", access::PRIVATE),
                FieldInfo::new("reflectionData", "Ljava/lang/Object;", access::PRIVATE),
            ],
            vec![method("getName", "()Ljava/lang/String;", pub_, Some(ALOAD0_ARETURN))],
        )?)?;
        let string = rt.define_class(core_class(
            names::STRING,
            sup,
            pub_ | access::FINAL | access::SUPER,
            vec![
                FieldInfo::new(fields::STRING_VALUE, "[B", access::PRIVATE | access::FINAL),
                FieldInfo::new(fields::STRING_CODER, "B", access::PRIVATE | access::FINAL),
                FieldInfo::new("hash", "I", access::PRIVATE),
            ],
            vec![
                init(),
                method("length", "()I", pub_, Some(ICONST0_IRETURN)),
                method("hashCode", "()I", pub_, Some(ICONST0_IRETURN)),
                method("equals", "(Ljava/lang/Object;)Z", pub_, Some(ICONST0_IRETURN)),
                method("toString", "()Ljava/lang/String;", pub_, Some(ALOAD0_ARETURN)),
            ],
        )?)?;
        let class_loader = rt.define_class(core_class(
            names::CLASS_LOADER,
            sup,
            pub_ | access::ABSTRACT | access::SUPER,
            vec![
                FieldInfo::new(fields::LOADER_PARENT, "Ljava/lang/ClassLoader;", access::PRIVATE | access::FINAL),
                FieldInfo::new(fields::LOADER_NAME, "Ljava/lang/String;", access::PRIVATE | access::FINAL),
                FieldInfo::new("classes", "Ljava/lang/Object;", access::PRIVATE | access::FINAL),
            ],
            vec![
                init(),
                method("loadClass", "(Ljava/lang/String;)Ljava/lang/Class;", pub_, Some(ALOAD0_ARETURN)),
            ],
        )?)?;
        let throwable = rt.define_class(core_class(
            names::THROWABLE,
            sup,
            pub_ | access::SUPER,
            vec![
                FieldInfo::new(fields::THROWABLE_MESSAGE, "Ljava/lang/String;", access::PRIVATE),
                FieldInfo::new("cause", "Ljava/lang/Throwable;", access::PRIVATE),
            ],
            vec![
                init(),
                method("getMessage", "()Ljava/lang/String;", pub_, Some(ALOAD0_ARETURN)),
            ],
        )?)?;
        let thread = rt.define_class(core_class(
            names::THREAD,
            sup,
            pub_ | access::SUPER,
            vec![
                FieldInfo::new("name", "Ljava/lang/String;", access::PRIVATE | access::VOLATILE),
                FieldInfo::new("priority", "I", access::PRIVATE),
                FieldInfo::new("daemon", "Z", access::PRIVATE),
            ],
            vec![init(), method("run", "()V", pub_, Some(RETURN))],
        )?)?;
        let member_name = rt.define_class(core_class(
            names::MEMBER_NAME,
            sup,
            access::FINAL | access::SUPER,
            vec![
                FieldInfo::new(fields::MEMBER_CLAZZ, "Ljava/lang/Class;", access::PRIVATE),
                FieldInfo::new(fields::MEMBER_NAME, "Ljava/lang/String;", access::PRIVATE),
                FieldInfo::new(fields::MEMBER_TYPE, "Ljava/lang/Object;", access::PRIVATE),
                FieldInfo::new(fields::MEMBER_FLAGS, "I", access::PRIVATE),
                injected(fields::MEMBER_VMINDEX, "J"),
            ],
            vec![init()],
        )?)?;
        let method_handle = rt.define_class(core_class(
            names::METHOD_HANDLE,
            sup,
            pub_ | access::SUPER,
            vec![FieldInfo::new("type", "Ljava/lang/Object;", access::PRIVATE | access::FINAL)],
            vec![
                init(),
                polymorphic("invokeExact", 0),
                polymorphic("invoke", 0),
                polymorphic("linkToStatic", access::STATIC),
            ],
        )?)?;
        let var_handle = rt.define_class(core_class(
            names::VAR_HANDLE,
            sup,
            pub_ | access::SUPER,
            Vec::new(),
            vec![init(), polymorphic("get", 0), polymorphic("set", 0)],
        )?)?;
        let call_site = rt.define_class(core_class(
            names::CALL_SITE,
            sup,
            pub_ | access::SUPER,
            vec![
                FieldInfo::new(fields::CALL_SITE_TARGET, "Ljava/lang/invoke/MethodHandle;", 0),
                FieldInfo::new(
                    fields::CALL_SITE_CONTEXT,
                    "Ljava/lang/invoke/MethodHandleNatives$CallSiteContext;",
                    access::FINAL,
                ),
            ],
            vec![init()],
        )?)?;
        let call_site_context = rt.define_class(core_class(
            names::CALL_SITE_CONTEXT,
            sup,
            access::FINAL | access::SUPER,
            vec![injected("vmdependencies", "J")],
            vec![init()],
        )?)?;
        rt.well_known = WellKnown {
            object,
            class,
            string,
            class_loader,
            throwable,
            thread,
            member_name,
            method_handle,
            var_handle,
            call_site,
            call_site_context,
        };

        rt.link_class(object)?;
        rt.link_class(class)?;
        rt.mirrors_enabled = true;
        let defined: Vec<TypeRef> = rt.classes().map(|(t, _)| t).collect();
        for t in &defined {
            rt.create_mirror(*t)?;
        }
        for kind in PrimKind::ALL {
            let m = rt.new_instance(class)?;
            rt.mirrors.insert(m, Mirrored::Primitive(kind));
            rt.prim_mirrors.push(m);
        }
        for kind in PrimKind::ALL {
            let t = rt.push_class(Class {
                name: format!("[{}", kind.descriptor()),
                loader: None,
                kind: ClassKind::PrimArray(kind),
                access_flags: access::PUBLIC | access::FINAL | access::ABSTRACT,
                super_class: Some(object),
                interfaces: Vec::new(),
                mirror: None,
                state: LifecycleState::FullyInitialized,
                array_class: None,
            })?;
            rt.prim_arrays.push(t);
        }
        for t in defined {
            rt.initialize_class(t)?;
        }
        Ok(rt)
    }

    /// Loader object for `loader`, if it is a live instance of a loader class.
    #[must_use]
    pub fn is_loader(&self, loader: ObjRef) -> bool {
        self.class_of(loader)
            .is_ok_and(|t| self.has_supertype_named(t, names::CLASS_LOADER))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::runtime::Value;

    #[test]
    fn bootstrap_initializes_core_types_with_mirrors() {
        let rt = Runtime::bootstrap().unwrap();
        let wk = *rt.well_known();
        for t in [wk.object, wk.class, wk.string, wk.member_name, wk.call_site_context] {
            let c = rt.class(t).unwrap();
            assert_eq!(c.state, LifecycleState::FullyInitialized, "{}", c.name);
            let m = c.mirror.unwrap();
            assert_eq!(rt.type_of_mirror(m), Some(t));
        }
        for kind in PrimKind::ALL {
            let a = rt.prim_array_class(kind);
            let m = rt.mirror(a).unwrap();
            let component = rt.get_field(m, fields::COMPONENT_TYPE).unwrap();
            assert_eq!(component, Value::Ref(rt.prim_mirror(kind)));
        }
    }

    #[test]
    fn string_vtable_overrides_object_slots() {
        let rt = Runtime::bootstrap().unwrap();
        let wk = *rt.well_known();
        let obj = rt.layout(wk.object).unwrap().vtable.clone();
        let s = rt.layout(wk.string).unwrap().vtable.clone();
        assert_eq!(obj.len(), 3);
        assert_eq!(s.len(), 4);
        let (holder, info) = rt.method(s[0]).unwrap();
        assert_eq!((holder, info.name.as_str()), (wk.string, "hashCode"));
    }
}
