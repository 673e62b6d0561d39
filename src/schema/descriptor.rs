//! Message and method descriptors.
//!
//! Descriptors are immutable once built. Lookup tables (tag → field,
//! host name → field) are computed when the registry is frozen so the
//! marshaller never scans field lists on the hot path.

use std::collections::HashMap;

use prost::encoding::WireType;

/// Scalar and composite field types, named after their wire encodings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    Int32,
    Int64,
    UInt32,
    UInt64,
    SInt32,
    SInt64,
    Fixed32,
    Fixed64,
    SFixed32,
    SFixed64,
    Float,
    Double,
    String,
    Bytes,
    /// Open enum carried as int32 on the wire.
    Enum,
    /// Nested message, by full name.
    Message(String),
    /// `map<key, value>`, carried as repeated entry messages with the key
    /// at tag 1 and the value at tag 2.
    Map(Box<FieldType>, Box<FieldType>),
}

impl FieldType {
    /// Wire type used for a single (unpacked) value.
    pub fn wire_type(&self) -> WireType {
        match self {
            Self::Bool
            | Self::Int32
            | Self::Int64
            | Self::UInt32
            | Self::UInt64
            | Self::SInt32
            | Self::SInt64
            | Self::Enum => WireType::Varint,
            Self::Fixed32 | Self::SFixed32 | Self::Float => WireType::ThirtyTwoBit,
            Self::Fixed64 | Self::SFixed64 | Self::Double => WireType::SixtyFourBit,
            Self::String | Self::Bytes | Self::Message(_) | Self::Map(..) => {
                WireType::LengthDelimited
            }
        }
    }

    pub fn map(key: FieldType, value: FieldType) -> Self {
        Self::Map(Box::new(key), Box::new(value))
    }

    /// Integral, bool and string types may key a map.
    pub fn is_valid_map_key(&self) -> bool {
        !matches!(
            self,
            Self::Float | Self::Double | Self::Bytes | Self::Enum | Self::Message(_) | Self::Map(..)
        )
    }

    /// Numeric scalars may be packed when repeated.
    pub fn is_packable(&self) -> bool {
        self.wire_type() != WireType::LengthDelimited
    }

    pub fn message_name(&self) -> Option<&str> {
        match self {
            Self::Message(name) => Some(name),
            _ => None,
        }
    }

    /// Message this type refers to, directly or as a map value.
    pub fn referenced_message(&self) -> Option<&str> {
        match self {
            Self::Map(_, value) => value.message_name(),
            other => other.message_name(),
        }
    }
}

/// Field cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    /// Implicit presence: absent decodes to the zero value.
    Singular,
    /// Explicit presence: absent decodes to `Null`.
    Optional,
    Repeated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Schema field name.
    pub name: String,
    /// Host property name when it differs from `name`.
    pub host_name: Option<String>,
    pub tag: u32,
    pub ty: FieldType,
    pub label: Label,
}

impl FieldDescriptor {
    pub fn new(name: &str, tag: u32, ty: FieldType) -> Self {
        Self {
            name: name.to_owned(),
            host_name: None,
            tag,
            ty,
            label: Label::Singular,
        }
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.label = Label::Optional;
        self
    }

    #[must_use]
    pub fn repeated(mut self) -> Self {
        self.label = Label::Repeated;
        self
    }

    /// Map this field to a differently named host property.
    #[must_use]
    pub fn host_alias(mut self, alias: &str) -> Self {
        self.host_name = Some(alias.to_owned());
        self
    }

    /// The property name used on the host side.
    pub fn host_key(&self) -> &str {
        self.host_name.as_deref().unwrap_or(&self.name)
    }
}

/// A message schema.
#[derive(Debug, Clone)]
pub struct MessageDescriptor {
    name: String,
    fields: Vec<FieldDescriptor>,
    by_tag: HashMap<u32, usize>,
    by_host_name: HashMap<String, usize>,
}

impl MessageDescriptor {
    pub fn new(name: &str, fields: Vec<FieldDescriptor>) -> Self {
        let mut d = Self {
            name: name.to_owned(),
            fields,
            by_tag: HashMap::new(),
            by_host_name: HashMap::new(),
        };
        d.fields.sort_by_key(|f| f.tag);
        d
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in ascending tag order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field_by_tag(&self, tag: u32) -> Option<&FieldDescriptor> {
        self.by_tag.get(&tag).map(|&i| &self.fields[i])
    }

    pub fn field_by_host_name(&self, name: &str) -> Option<&FieldDescriptor> {
        self.by_host_name.get(name).map(|&i| &self.fields[i])
    }

    pub(crate) fn build_index(&mut self) {
        self.by_tag = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.tag, i))
            .collect();
        self.by_host_name = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.host_key().to_owned(), i))
            .collect();
    }
}

impl PartialEq for MessageDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.fields == other.fields
    }
}

impl Eq for MessageDescriptor {}

/// Call shape of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Unary,
    ServerStreaming,
    BidiStreaming,
}

impl MethodKind {
    pub const fn is_streaming(self) -> bool {
        !matches!(self, Self::Unary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Full path, `/package.Service/Method`.
    pub path: String,
    pub kind: MethodKind,
    pub input: String,
    pub output: String,
}

impl MethodDescriptor {
    pub fn new(path: &str, kind: MethodKind, input: &str, output: &str) -> Self {
        Self {
            path: path.to_owned(),
            kind,
            input: input.to_owned(),
            output: output.to_owned(),
        }
    }
}
