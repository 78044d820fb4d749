// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Class-definition builder for tests.

use bytes::Bytes;
use thaw_core::runtime::{
    access, internal, ClassDefinition, ConstantPool, CpEntry, FieldInfo, InstanceClass,
    LinkageCache, MethodInfo, ObjRef, RuntimeError, TypeRef,
};

/// Body of every concrete method the builder emits: a bare `return`.
const RETURN: &[u8] = &[0xb1];

/// Builder for [`ClassDefinition`]s with a consistent constant pool.
///
/// Every supertype, field and method added also lands in the constant pool
/// the way a compiler would emit it, so two builders fed the same calls
/// produce structurally identical definitions. A constant pool that
/// overflows is reported by [`ClassBuilder::build`].
///
/// # Example
///
/// ```
/// use thaw_core::runtime::{names, Runtime};
/// use thaw_dry_tests::ClassBuilder;
///
/// let rt = Runtime::bootstrap().unwrap();
/// let def = ClassBuilder::new("demo/Point")
///     .extends(rt.well_known().object, names::OBJECT)
///     .field("x", "I")
///     .static_int("ORIGIN", 0)
///     .build()
///     .unwrap();
///
/// assert_eq!(def.name, "demo/Point");
/// assert_eq!(def.body.fields.len(), 2);
/// ```
#[derive(Debug)]
pub struct ClassBuilder {
    name: String,
    loader: Option<ObjRef>,
    super_class: Option<TypeRef>,
    interfaces: Vec<TypeRef>,
    access_flags: u16,
    internal_flags: u16,
    constants: ConstantPool,
    fields: Vec<FieldInfo>,
    methods: Vec<MethodInfo>,
    linkage: Option<LinkageCache>,
    error: Option<RuntimeError>,
}

impl ClassBuilder {
    /// A public class named `name` with no supertype yet.
    pub fn new(name: &str) -> Self {
        let mut b = Self {
            name: name.to_owned(),
            loader: None,
            super_class: None,
            interfaces: Vec::new(),
            access_flags: access::PUBLIC | access::SUPER,
            internal_flags: 0,
            constants: ConstantPool::default(),
            fields: Vec::new(),
            methods: Vec::new(),
            linkage: None,
            error: None,
        };
        let added = b.constants.add_class(name);
        b.keep(added);
        b
    }

    /// Defining loader; bootstrap when never called.
    pub fn loader(mut self, loader: ObjRef) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Superclass `t`, named `name` in the constant pool.
    pub fn extends(mut self, t: TypeRef, name: &str) -> Self {
        let added = self.constants.add_class(name);
        self.keep(added);
        self.super_class = Some(t);
        self
    }

    /// Adds interface `t`, named `name` in the constant pool.
    pub fn implements(mut self, t: TypeRef, name: &str) -> Self {
        let added = self.constants.add_class(name);
        self.keep(added);
        self.interfaces.push(t);
        self
    }

    /// Makes this an interface.
    pub fn interface(mut self) -> Self {
        self.access_flags = access::PUBLIC | access::INTERFACE | access::ABSTRACT;
        self
    }

    /// Adds a private instance field.
    pub fn field(mut self, name: &str, signature: &str) -> Self {
        self.push_field(name, signature, access::PRIVATE, None);
        self
    }

    /// Adds a public static field with no constant value.
    pub fn static_field(mut self, name: &str, signature: &str) -> Self {
        self.push_field(name, signature, access::PUBLIC | access::STATIC, None);
        self
    }

    /// Adds a static `int` field initialized from a `ConstantValue`.
    pub fn static_int(mut self, name: &str, value: i32) -> Self {
        let ci = self.constants.push(CpEntry::Integer(value));
        let ci = self.keep(ci);
        self.push_field(name, "I", access::PUBLIC | access::STATIC | access::FINAL, ci);
        self
    }

    /// Adds a static string field initialized from a `ConstantValue`.
    pub fn static_string(mut self, name: &str, value: &str) -> Self {
        let ci = self.constants.add_string(value);
        let ci = self.keep(ci);
        self.push_field(
            name,
            "Ljava/lang/String;",
            access::PUBLIC | access::STATIC | access::FINAL,
            ci,
        );
        self
    }

    /// Adds a method; abstract and native methods get no code.
    pub fn method(mut self, name: &str, signature: &str, access_flags: u16) -> Self {
        let code = (access_flags & (access::ABSTRACT | access::NATIVE) == 0)
            .then(|| Bytes::from_static(RETURN));
        let mut m = MethodInfo::new(name, signature, access_flags, code);
        if m.code.is_some() {
            m.max_stack = 1;
            m.max_locals = u16::from(access_flags & access::STATIC == 0);
        }
        let added = self
            .constants
            .add_method_ref(&self.name, name, signature, self.is_interface());
        self.keep(added);
        self.methods.push(m);
        self
    }

    /// Sets internal flag bits.
    pub fn internal(mut self, flags: u16) -> Self {
        self.internal_flags |= flags;
        self
    }

    /// Installs a linkage cache, marking the class rewritten.
    pub fn linkage(mut self, cache: LinkageCache) -> Self {
        self.linkage = Some(cache);
        self.internal_flags |= internal::REWRITTEN;
        self
    }

    /// The constant pool under construction, for entries the shortcuts
    /// above do not cover.
    pub fn constants(&mut self) -> &mut ConstantPool {
        &mut self.constants
    }

    /// Seals the constant pool and builds the definition.
    ///
    /// Fails with the first constant pool error any earlier call hit.
    pub fn build(self) -> Result<ClassDefinition, RuntimeError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let mut constants = self.constants;
        constants.seal()?;
        Ok(ClassDefinition {
            name: self.name,
            loader: self.loader,
            super_class: self.super_class,
            interfaces: self.interfaces,
            access_flags: self.access_flags,
            body: InstanceClass {
                internal_flags: self.internal_flags,
                constants,
                linkage: self.linkage,
                fields: self.fields,
                methods: self.methods,
                ..InstanceClass::default()
            },
        })
    }

    fn is_interface(&self) -> bool {
        self.access_flags & access::INTERFACE != 0
    }

    /// Unwraps `result`, remembering the first error for `build`.
    fn keep(&mut self, result: Result<u16, RuntimeError>) -> Option<u16> {
        match result {
            Ok(index) => Some(index),
            Err(e) => {
                self.error.get_or_insert(e);
                None
            }
        }
    }

    fn push_field(&mut self, name: &str, signature: &str, flags: u16, constant: Option<u16>) {
        let added = self.constants.add_field_ref(&self.name, name, signature);
        self.keep(added);
        let mut f = FieldInfo::new(name, signature, flags);
        f.constant_value_index = constant;
        self.fields.push(f);
    }
}
