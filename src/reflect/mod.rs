//! Host reflection boundary.
//!
//! The host engine exposes its data objects through [`Reflected`]. The
//! marshaller reads properties by name on encode and produces a
//! [`HostObject`] on decode, which the host then copies into its own
//! object model.

pub mod json;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// A dynamically typed host property value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HostValue {
    /// Unset. Treated as "field absent" on encode.
    #[default]
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Object(HostObject),
    List(Vec<HostValue>),
    Map(BTreeMap<MapKey, HostValue>),
}

/// Key of a host map. Only scalars the wire format allows as map keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MapKey {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    Str(String),
}

impl MapKey {
    /// Key as a plain value, for coercion against the schema key type.
    pub fn to_value(&self) -> HostValue {
        match self {
            Self::Bool(b) => HostValue::Bool(*b),
            Self::I32(n) => HostValue::I32(*n),
            Self::I64(n) => HostValue::I64(*n),
            Self::U32(n) => HostValue::U32(*n),
            Self::U64(n) => HostValue::U64(*n),
            Self::Str(s) => HostValue::Str(s.clone()),
        }
    }

    /// The key form of `value`, if it can be one.
    pub fn from_value(value: HostValue) -> Option<Self> {
        Some(match value {
            HostValue::Bool(b) => Self::Bool(b),
            HostValue::I32(n) => Self::I32(n),
            HostValue::I64(n) => Self::I64(n),
            HostValue::U32(n) => Self::U32(n),
            HostValue::U64(n) => Self::U64(n),
            HostValue::Str(s) => Self::Str(s),
            _ => return None,
        })
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::I32(n) => write!(f, "{n}"),
            Self::I64(n) => write!(f, "{n}"),
            Self::U32(n) => write!(f, "{n}"),
            Self::U64(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MapKey {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<i32> for MapKey {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl HostValue {
    /// Short type label used in mismatch diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::U32(_) => "u32",
            Self::U64(_) => "u64",
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
            Self::Str(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Object(_) => "object",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    pub fn as_list(&self) -> Option<&[HostValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<MapKey, HostValue>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<u32> for HostValue {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<u64> for HostValue {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

impl From<f32> for HostValue {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<HostObject> for HostValue {
    fn from(v: HostObject) -> Self {
        Self::Object(v)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(v: Vec<HostValue>) -> Self {
        Self::List(v)
    }
}

impl From<BTreeMap<MapKey, HostValue>> for HostValue {
    fn from(v: BTreeMap<MapKey, HostValue>) -> Self {
        Self::Map(v)
    }
}

/// Anything the marshaller can read properties from.
pub trait Reflected {
    /// Full message name this object claims to be, or "" if untyped.
    fn type_name(&self) -> &str;

    /// Property by host name. `None` means the property does not exist.
    fn property(&self, name: &str) -> Option<Cow<'_, HostValue>>;

    /// Opaque unknown-field bytes retained from a previous decode.
    fn unknown_fields(&self) -> &[u8] {
        &[]
    }
}

/// The crate's concrete reflected object: an ordered property bag.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HostObject {
    pub type_name: String,
    pub fields: BTreeMap<String, HostValue>,
    /// Wire bytes of fields the schema does not know, re-emitted on encode.
    pub unknown_fields: Vec<u8>,
}

impl HostObject {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_owned(),
            ..Self::default()
        }
    }

    /// Builder-style setter.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<HostValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<HostValue>) {
        self.fields.insert(name.to_owned(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&HostValue> {
        self.fields.get(name)
    }
}

impl Reflected for HostObject {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn property(&self, name: &str) -> Option<Cow<'_, HostValue>> {
        self.fields.get(name).map(Cow::Borrowed)
    }

    fn unknown_fields(&self) -> &[u8] {
        &self.unknown_fields
    }
}
