// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Declared fields, methods and class-level attributes.
//!
//! Optional tables use `Option<Vec<_>>` so an absent table stays distinct
//! from an empty one; both survive transcription.
use bytes::Bytes;

use super::class::access;

/// Runtime-internal field flags.
pub mod field_flags {
    /// Field injected by the runtime rather than declared in source.
    pub const INJECTED: u8 = 0x01;
}

/// Runtime-internal method flags.
pub mod method_flags {
    /// Method synthesized by the runtime during linking.
    pub const OVERPASS: u8 = 0x01;
}

/// Visible and invisible flavours of one annotation attribute.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnnotationSet {
    /// Runtime-visible annotations, raw.
    pub visible: Option<Bytes>,
    /// Runtime-invisible annotations, raw.
    pub invisible: Option<Bytes>,
}

impl AnnotationSet {
    /// Drops the invisible flavour.
    pub fn strip_invisible(&mut self) {
        self.invisible = None;
    }
}

/// A declared field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldInfo {
    /// Name.
    pub name: String,
    /// Descriptor.
    pub signature: String,
    /// [`access`] flags.
    pub access_flags: u16,
    /// [`field_flags`].
    pub internal_flags: u8,
    /// `ConstantValue` pool index.
    pub constant_value_index: Option<u16>,
    /// Generic signature.
    pub generic_signature: Option<String>,
    /// Declaration annotations.
    pub annotations: AnnotationSet,
    /// Type annotations.
    pub type_annotations: AnnotationSet,
}

impl FieldInfo {
    /// A plain field.
    #[must_use]
    pub fn new(name: &str, signature: &str, access_flags: u16) -> Self {
        Self {
            name: name.to_owned(),
            signature: signature.to_owned(),
            access_flags,
            ..Self::default()
        }
    }

    /// Returns `true` for static fields.
    #[must_use]
    pub const fn is_static(&self) -> bool {
        self.access_flags & access::STATIC != 0
    }
}

/// How a method is invoked; part of every member description.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MethodKind {
    /// Static method.
    Static,
    /// Instance method.
    Instance,
    /// Runtime-synthesized instance method.
    Overpass,
}

impl MethodKind {
    /// Wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Static => 0,
            Self::Instance => 1,
            Self::Overpass => 2,
        }
    }

    /// Decodes a wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Static),
            1 => Some(Self::Instance),
            2 => Some(Self::Overpass),
            _ => None,
        }
    }
}

/// `Code` exception table row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Start pc, inclusive.
    pub start_pc: u16,
    /// End pc, exclusive.
    pub end_pc: u16,
    /// Handler pc.
    pub handler_pc: u16,
    /// Catch type pool index; 0 catches everything.
    pub catch_type: u16,
}

/// `LineNumberTable` row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LineNumber {
    /// First pc of the line.
    pub start_pc: u16,
    /// Source line.
    pub line: u16,
}

/// `LocalVariableTable` row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalVariable {
    /// First pc where the variable is live.
    pub start_pc: u16,
    /// Live range length.
    pub length: u16,
    /// Name.
    pub name: String,
    /// Descriptor.
    pub signature: String,
    /// Local slot.
    pub slot: u16,
}

/// `MethodParameters` row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MethodParameter {
    /// Name, if recorded.
    pub name: Option<String>,
    /// Parameter flags.
    pub access_flags: u16,
}

/// A declared method.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MethodInfo {
    /// Name.
    pub name: String,
    /// Descriptor.
    pub signature: String,
    /// [`access`] flags.
    pub access_flags: u16,
    /// [`method_flags`].
    pub internal_flags: u8,
    /// Operand stack bound.
    pub max_stack: u16,
    /// Local slot count.
    pub max_locals: u16,
    /// Bytecode; absent for abstract and native methods.
    pub code: Option<Bytes>,
    /// Exception handlers.
    pub exception_table: Vec<ExceptionHandler>,
    /// Line numbers.
    pub line_numbers: Option<Vec<LineNumber>>,
    /// Local variables.
    pub local_variables: Option<Vec<LocalVariable>>,
    /// Declared checked exceptions, as class pool indices.
    pub checked_exceptions: Vec<u16>,
    /// Parameter metadata.
    pub parameters: Option<Vec<MethodParameter>>,
    /// Declaration annotations.
    pub annotations: AnnotationSet,
    /// Parameter annotations.
    pub parameter_annotations: AnnotationSet,
    /// `AnnotationDefault`, raw.
    pub annotation_default: Option<Bytes>,
    /// Type annotations.
    pub type_annotations: AnnotationSet,
}

impl MethodInfo {
    /// A method with the given body.
    #[must_use]
    pub fn new(name: &str, signature: &str, access_flags: u16, code: Option<Bytes>) -> Self {
        Self {
            name: name.to_owned(),
            signature: signature.to_owned(),
            access_flags,
            code,
            ..Self::default()
        }
    }

    /// Returns `true` for static methods.
    #[must_use]
    pub const fn is_static(&self) -> bool {
        self.access_flags & access::STATIC != 0
    }

    /// Returns `true` for abstract methods.
    #[must_use]
    pub const fn is_abstract(&self) -> bool {
        self.access_flags & access::ABSTRACT != 0
    }

    /// Returns `true` for runtime-synthesized methods.
    #[must_use]
    pub const fn is_overpass(&self) -> bool {
        self.internal_flags & method_flags::OVERPASS != 0
    }

    /// Invocation kind.
    #[must_use]
    pub const fn kind(&self) -> MethodKind {
        if self.is_static() {
            MethodKind::Static
        } else if self.is_overpass() {
            MethodKind::Overpass
        } else {
            MethodKind::Instance
        }
    }

    /// Returns `true` for constructors and class initializers.
    #[must_use]
    pub fn is_initializer(&self) -> bool {
        self.name == "<init>" || self.name == "<clinit>"
    }

    /// Returns `true` if this method takes part in virtual dispatch.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        !self.is_static() && !self.is_initializer() && self.access_flags & access::PRIVATE == 0
    }
}

/// `InnerClasses` row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InnerClass {
    /// Inner class pool index.
    pub inner_class_index: u16,
    /// Outer class pool index.
    pub outer_class_index: u16,
    /// Simple name pool index.
    pub inner_name_index: u16,
    /// Inner class flags.
    pub access_flags: u16,
}

/// `EnclosingMethod` attribute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnclosingMethod {
    /// Enclosing class pool index.
    pub class_index: u16,
    /// Enclosing method name-and-type index, 0 if none.
    pub method_index: u16,
}

/// `BootstrapMethods` row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootstrapMethod {
    /// Method-handle pool index.
    pub method_ref: u16,
    /// Static argument pool indices.
    pub arguments: Vec<u16>,
}

/// `Record` component.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordComponent {
    /// Name.
    pub name: String,
    /// Descriptor.
    pub signature: String,
    /// Generic signature.
    pub generic_signature: Option<String>,
    /// Declaration annotations.
    pub annotations: AnnotationSet,
    /// Type annotations.
    pub type_annotations: AnnotationSet,
}

/// Class-level attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassAttributes {
    /// `SourceFile`.
    pub source_file: Option<String>,
    /// `Signature`.
    pub generic_signature: Option<String>,
    /// `SourceDebugExtension`, raw.
    pub source_debug_extension: Option<Bytes>,
    /// `NestHost` class index.
    pub nest_host_index: Option<u16>,
    /// `NestMembers` class indices.
    pub nest_members: Option<Vec<u16>>,
    /// `InnerClasses`.
    pub inner_classes: Option<Vec<InnerClass>>,
    /// `EnclosingMethod`.
    pub enclosing_method: Option<EnclosingMethod>,
    /// `PermittedSubclasses` class indices.
    pub permitted_subclasses: Option<Vec<u16>>,
    /// Declaration annotations.
    pub annotations: AnnotationSet,
    /// Type annotations.
    pub type_annotations: AnnotationSet,
    /// `BootstrapMethods`.
    pub bootstrap_methods: Option<Vec<BootstrapMethod>>,
    /// `Record` components.
    pub record_components: Option<Vec<RecordComponent>>,
}
