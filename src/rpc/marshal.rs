//! Message marshaller: reflected host objects ⇄ schema-defined wire bytes.
//!
//! Pure and side-effect free. Field keys and varints go through
//! `prost::encoding`; everything schema-driven (coercion, defaults, packed
//! repeated scalars, unknown-field retention) lives here.
//!
//! Coercion on encode:
//!
//! | schema type                      | accepted host values       |
//! |----------------------------------|----------------------------|
//! | int32 / sint32 / sfixed32 / enum | `I32`                      |
//! | int64 / sint64 / sfixed64        | `I32`, `I64`, `U32`        |
//! | uint32 / fixed32                 | `U32`                      |
//! | uint64 / fixed64                 | `U32`, `U64`               |
//! | float                            | `F32`                      |
//! | double                           | `F32`, `F64`, `I32`, `U32` |
//! | string                           | `Str`, UTF-8 `Bytes`       |
//! | bytes                            | `Bytes`, `Str`             |
//! | message                          | `Object`                   |
//! | map                              | `Map`                      |
//!
//! Map keys and values follow the same table for their own types; entries
//! are written in key order. `Null` means "absent" and is skipped (inside
//! a map only message values may be `Null`). Anything else is
//! `SchemaMismatch`.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use prost::bytes::BufMut;
use prost::encoding::{WireType, decode_key, decode_varint, encode_key, encode_varint};

use crate::error::{BridgeError, Result};
use crate::reflect::{HostObject, HostValue, MapKey, Reflected};
use crate::schema::{DescriptorRegistry, FieldDescriptor, FieldType, Label, MessageDescriptor};

/// Bounds enforced while encoding and decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarshalLimits {
    /// Maximum nested message depth (top level is depth 0).
    pub max_depth: u32,
    /// Maximum size of a single length-delimited field.
    pub max_field_bytes: usize,
}

impl Default for MarshalLimits {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_field_bytes: 64 * 1024 * 1024,
        }
    }
}

/// A single value ready to be written under a field key.
enum WireValue<'a> {
    Varint(u64),
    Bits32(u32),
    Bits64(u64),
    Len(Cow<'a, [u8]>),
}

impl WireValue<'_> {
    fn is_zero(&self) -> bool {
        match self {
            Self::Varint(v) | Self::Bits64(v) => *v == 0,
            Self::Bits32(v) => *v == 0,
            Self::Len(b) => b.is_empty(),
        }
    }

    fn put_key(&self, tag: u32, buf: &mut Vec<u8>) {
        let wt = match self {
            Self::Varint(_) => WireType::Varint,
            Self::Bits32(_) => WireType::ThirtyTwoBit,
            Self::Bits64(_) => WireType::SixtyFourBit,
            Self::Len(_) => WireType::LengthDelimited,
        };
        encode_key(tag, wt, buf);
    }

    fn put_value(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Varint(v) => encode_varint(*v, buf),
            Self::Bits32(v) => buf.put_u32_le(*v),
            Self::Bits64(v) => buf.put_u64_le(*v),
            Self::Len(b) => {
                encode_varint(b.len() as u64, buf);
                buf.put_slice(b);
            }
        }
    }
}

fn zigzag32(n: i32) -> u64 {
    u64::from(((n << 1) ^ (n >> 31)) as u32)
}

fn zigzag64(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

fn unzigzag32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

fn unzigzag64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// Schema-driven encoder/decoder bound to one frozen registry.
#[derive(Debug, Clone)]
pub struct Marshaller {
    registry: Arc<DescriptorRegistry>,
    limits: MarshalLimits,
}

impl Marshaller {
    pub fn new(registry: Arc<DescriptorRegistry>, limits: MarshalLimits) -> Self {
        Self { registry, limits }
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    pub fn limits(&self) -> MarshalLimits {
        self.limits
    }

    /// Encode `obj` as message `message`.
    pub fn encode(&self, obj: &dyn Reflected, message: &str) -> Result<Vec<u8>> {
        let desc = self.registry.message(message)?;
        let mut buf = Vec::new();
        self.encode_message(obj, desc, &mut buf, 0)?;
        Ok(buf)
    }

    /// Decode `bytes` as message `message`, dropping unknown fields.
    pub fn decode(&self, bytes: &[u8], message: &str) -> Result<HostObject> {
        let desc = self.registry.message(message)?;
        self.decode_message(bytes, desc, false, 0)
    }

    /// Decode keeping unknown fields on the object so `encode` re-emits them.
    pub fn decode_preserving(&self, bytes: &[u8], message: &str) -> Result<HostObject> {
        let desc = self.registry.message(message)?;
        self.decode_message(bytes, desc, true, 0)
    }

    // ── Encode ──────────────────────────────────────────────────

    fn encode_message(
        &self,
        obj: &dyn Reflected,
        desc: &MessageDescriptor,
        buf: &mut Vec<u8>,
        depth: u32,
    ) -> Result<()> {
        if depth >= self.limits.max_depth {
            return Err(BridgeError::mismatch(
                desc.name(),
                "",
                format!("nesting deeper than {}", self.limits.max_depth),
            ));
        }
        let type_name = obj.type_name();
        if !type_name.is_empty() && type_name != desc.name() {
            return Err(BridgeError::mismatch(
                desc.name(),
                "",
                format!("object is a {type_name}"),
            ));
        }

        for field in desc.fields() {
            // Unmapped host properties are never looked at.
            let Some(value) = obj.property(field.host_key()) else {
                continue;
            };
            self.encode_field(desc, field, &value, buf, depth)?;
        }
        buf.put_slice(obj.unknown_fields());
        Ok(())
    }

    fn encode_field(
        &self,
        desc: &MessageDescriptor,
        field: &FieldDescriptor,
        value: &HostValue,
        buf: &mut Vec<u8>,
        depth: u32,
    ) -> Result<()> {
        if matches!(value, HostValue::Null) {
            return Ok(());
        }
        if let FieldType::Map(key_ty, value_ty) = &field.ty {
            return self.encode_map(desc, field, key_ty, value_ty, value, buf, depth);
        }

        if field.label != Label::Repeated {
            let wv = self.to_wire(desc, field, value, depth)?;
            let has_presence = field.label == Label::Optional || field.ty.message_name().is_some();
            if has_presence || !wv.is_zero() {
                wv.put_key(field.tag, buf);
                wv.put_value(buf);
            }
            return Ok(());
        }

        let Some(items) = value.as_list() else {
            return Err(BridgeError::mismatch(
                desc.name(),
                &field.name,
                format!("repeated field needs a list, got {}", value.kind()),
            ));
        };
        if items.iter().any(|v| matches!(v, HostValue::Null)) {
            return Err(BridgeError::mismatch(
                desc.name(),
                &field.name,
                "null list element",
            ));
        }

        if field.ty.is_packable() {
            if items.is_empty() {
                return Ok(());
            }
            let mut packed = Vec::new();
            for item in items {
                self.to_wire(desc, field, item, depth)?.put_value(&mut packed);
            }
            self.check_len(desc, field, packed.len())?;
            let packed = WireValue::Len(Cow::Owned(packed));
            packed.put_key(field.tag, buf);
            packed.put_value(buf);
        } else {
            for item in items {
                let wv = self.to_wire(desc, field, item, depth)?;
                wv.put_key(field.tag, buf);
                wv.put_value(buf);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_map(
        &self,
        desc: &MessageDescriptor,
        field: &FieldDescriptor,
        key_ty: &FieldType,
        value_ty: &FieldType,
        value: &HostValue,
        buf: &mut Vec<u8>,
        depth: u32,
    ) -> Result<()> {
        let Some(entries) = value.as_map() else {
            return Err(BridgeError::mismatch(
                desc.name(),
                &field.name,
                format!("map field needs a map, got {}", value.kind()),
            ));
        };
        let (key_field, value_field) = map_entry_fields(field, key_ty, value_ty);
        for (key, item) in entries {
            if matches!(item, HostValue::Null) && value_ty.message_name().is_none() {
                return Err(BridgeError::mismatch(
                    desc.name(),
                    &field.name,
                    format!("null value for key {key}"),
                ));
            }
            let mut entry = Vec::new();
            self.encode_field(desc, &key_field, &key.to_value(), &mut entry, depth + 1)?;
            self.encode_field(desc, &value_field, item, &mut entry, depth + 1)?;
            self.check_len(desc, field, entry.len())?;
            encode_key(field.tag, WireType::LengthDelimited, buf);
            encode_varint(entry.len() as u64, buf);
            buf.put_slice(&entry);
        }
        Ok(())
    }

    fn to_wire<'v>(
        &self,
        desc: &MessageDescriptor,
        field: &FieldDescriptor,
        value: &'v HostValue,
        depth: u32,
    ) -> Result<WireValue<'v>> {
        use HostValue as V;

        let as_i64 = || match value {
            V::I32(n) => Some(i64::from(*n)),
            V::I64(n) => Some(*n),
            V::U32(n) => Some(i64::from(*n)),
            _ => None,
        };
        let as_u64 = || match value {
            V::U32(n) => Some(u64::from(*n)),
            V::U64(n) => Some(*n),
            _ => None,
        };
        let as_f64 = || match value {
            V::F32(f) => Some(f64::from(*f)),
            V::F64(f) => Some(*f),
            V::I32(n) => Some(f64::from(*n)),
            V::U32(n) => Some(f64::from(*n)),
            _ => None,
        };

        let wv = match (&field.ty, value) {
            (FieldType::Bool, V::Bool(b)) => Some(WireValue::Varint(u64::from(*b))),
            (FieldType::Int32 | FieldType::Enum, V::I32(n)) => {
                Some(WireValue::Varint(i64::from(*n) as u64))
            }
            (FieldType::SInt32, V::I32(n)) => Some(WireValue::Varint(zigzag32(*n))),
            (FieldType::SFixed32, V::I32(n)) => Some(WireValue::Bits32(*n as u32)),
            (FieldType::Int64, _) => as_i64().map(|n| WireValue::Varint(n as u64)),
            (FieldType::SInt64, _) => as_i64().map(|n| WireValue::Varint(zigzag64(n))),
            (FieldType::SFixed64, _) => as_i64().map(|n| WireValue::Bits64(n as u64)),
            (FieldType::UInt32, V::U32(n)) => Some(WireValue::Varint(u64::from(*n))),
            (FieldType::Fixed32, V::U32(n)) => Some(WireValue::Bits32(*n)),
            (FieldType::UInt64, _) => as_u64().map(WireValue::Varint),
            (FieldType::Fixed64, _) => as_u64().map(WireValue::Bits64),
            (FieldType::Float, V::F32(f)) => Some(WireValue::Bits32(f.to_bits())),
            (FieldType::Double, _) => as_f64().map(|f| WireValue::Bits64(f.to_bits())),
            (FieldType::String, V::Str(s)) => Some(WireValue::Len(Cow::Borrowed(s.as_bytes()))),
            (FieldType::String, V::Bytes(b)) => {
                if core::str::from_utf8(b).is_err() {
                    return Err(BridgeError::mismatch(
                        desc.name(),
                        &field.name,
                        "bytes are not valid UTF-8",
                    ));
                }
                Some(WireValue::Len(Cow::Borrowed(b)))
            }
            (FieldType::Bytes, V::Bytes(b)) => Some(WireValue::Len(Cow::Borrowed(b))),
            (FieldType::Bytes, V::Str(s)) => Some(WireValue::Len(Cow::Borrowed(s.as_bytes()))),
            (FieldType::Message(name), V::Object(obj)) => {
                let nested = self.registry.message(name)?;
                let mut inner = Vec::new();
                self.encode_message(obj, nested, &mut inner, depth + 1)?;
                Some(WireValue::Len(Cow::Owned(inner)))
            }
            _ => None,
        };

        let wv = wv.ok_or_else(|| {
            BridgeError::mismatch(
                desc.name(),
                &field.name,
                format!("{} cannot be written as {:?}", value.kind(), field.ty),
            )
        })?;
        if let WireValue::Len(b) = &wv {
            self.check_len(desc, field, b.len())?;
        }
        Ok(wv)
    }

    /// Length-delimited values must stay decodable under the same limits.
    fn check_len(
        &self,
        desc: &MessageDescriptor,
        field: &FieldDescriptor,
        len: usize,
    ) -> Result<()> {
        if len > self.limits.max_field_bytes {
            return Err(BridgeError::mismatch(
                desc.name(),
                &field.name,
                format!("{len} bytes exceeds field limit {}", self.limits.max_field_bytes),
            ));
        }
        Ok(())
    }

    // ── Decode ──────────────────────────────────────────────────

    fn decode_message(
        &self,
        bytes: &[u8],
        desc: &MessageDescriptor,
        preserve: bool,
        depth: u32,
    ) -> Result<HostObject> {
        if depth >= self.limits.max_depth {
            return Err(BridgeError::malformed(format!(
                "{}: nesting deeper than {}",
                desc.name(),
                self.limits.max_depth
            )));
        }

        let mut obj = HostObject::new(desc.name());
        for field in desc.fields() {
            obj.fields
                .insert(field.host_key().to_owned(), default_value(field));
        }

        let mut buf = bytes;
        while !buf.is_empty() {
            let field_start = buf;
            let (tag, wire_type) = decode_key(&mut buf)?;
            match desc.field_by_tag(tag) {
                Some(field) => {
                    self.decode_field(desc, field, wire_type, &mut buf, &mut obj, preserve, depth)?;
                }
                None => {
                    self.skip_value(wire_type, &mut buf)?;
                    if preserve {
                        let consumed = field_start.len() - buf.len();
                        obj.unknown_fields
                            .extend_from_slice(&field_start[..consumed]);
                    }
                }
            }
        }
        Ok(obj)
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_field(
        &self,
        desc: &MessageDescriptor,
        field: &FieldDescriptor,
        wire_type: WireType,
        buf: &mut &[u8],
        obj: &mut HostObject,
        preserve: bool,
        depth: u32,
    ) -> Result<()> {
        let expected = field.ty.wire_type();
        let key = field.host_key();

        if let FieldType::Map(key_ty, value_ty) = &field.ty {
            if wire_type != expected {
                return Err(BridgeError::malformed(format!(
                    "{}.{}: map entry with wire type {:?}",
                    desc.name(),
                    field.name,
                    wire_type
                )));
            }
            let entry = self.read_len(buf)?;
            let (k, v) = self.decode_map_entry(field, key_ty, value_ty, entry, preserve, depth)?;
            let slot = obj
                .fields
                .entry(key.to_owned())
                .or_insert_with(|| HostValue::Map(BTreeMap::new()));
            match slot {
                // Last occurrence of a key wins.
                HostValue::Map(entries) => {
                    entries.insert(k, v);
                }
                other => *other = HostValue::Map(BTreeMap::from([(k, v)])),
            }
            return Ok(());
        }

        if field.label == Label::Repeated
            && field.ty.is_packable()
            && wire_type == WireType::LengthDelimited
        {
            let mut packed = self.read_len(buf)?;
            let mut items = Vec::new();
            while !packed.is_empty() {
                items.push(self.read_value(field, &mut packed, preserve, depth)?);
            }
            push_items(obj, key, items);
            return Ok(());
        }

        if wire_type != expected {
            return Err(BridgeError::malformed(format!(
                "{}.{}: wire type {:?}, expected {:?}",
                desc.name(),
                field.name,
                wire_type,
                expected
            )));
        }

        let value = self.read_value(field, buf, preserve, depth)?;
        if field.label == Label::Repeated {
            push_items(obj, key, vec![value]);
        } else {
            // Last occurrence wins.
            obj.fields.insert(key.to_owned(), value);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_map_entry(
        &self,
        field: &FieldDescriptor,
        key_ty: &FieldType,
        value_ty: &FieldType,
        mut entry: &[u8],
        preserve: bool,
        depth: u32,
    ) -> Result<(MapKey, HostValue)> {
        let (key_field, value_field) = map_entry_fields(field, key_ty, value_ty);
        let mut key = default_value(&key_field);
        let mut value = default_value(&value_field);
        while !entry.is_empty() {
            let (tag, wire_type) = decode_key(&mut entry)?;
            let target = match tag {
                1 => Some((&key_field, &mut key)),
                2 => Some((&value_field, &mut value)),
                _ => None,
            };
            let Some((f, slot)) = target else {
                self.skip_value(wire_type, &mut entry)?;
                continue;
            };
            if wire_type != f.ty.wire_type() {
                return Err(BridgeError::malformed(format!(
                    "{}: wire type {:?}, expected {:?}",
                    f.name,
                    wire_type,
                    f.ty.wire_type()
                )));
            }
            *slot = self.read_value(f, &mut entry, preserve, depth + 1)?;
        }
        let key = MapKey::from_value(key).ok_or_else(|| {
            BridgeError::malformed(format!("{}: unusable map key", field.name))
        })?;
        Ok((key, value))
    }

    fn read_value(
        &self,
        field: &FieldDescriptor,
        buf: &mut &[u8],
        preserve: bool,
        depth: u32,
    ) -> Result<HostValue> {
        Ok(match &field.ty {
            FieldType::Bool => HostValue::Bool(decode_varint(buf)? != 0),
            FieldType::Int32 | FieldType::Enum => HostValue::I32(decode_varint(buf)? as i32),
            FieldType::Int64 => HostValue::I64(decode_varint(buf)? as i64),
            FieldType::UInt32 => HostValue::U32(decode_varint(buf)? as u32),
            FieldType::UInt64 => HostValue::U64(decode_varint(buf)?),
            FieldType::SInt32 => HostValue::I32(unzigzag32(decode_varint(buf)? as u32)),
            FieldType::SInt64 => HostValue::I64(unzigzag64(decode_varint(buf)?)),
            FieldType::Fixed32 => HostValue::U32(read_u32(buf)?),
            FieldType::SFixed32 => HostValue::I32(read_u32(buf)? as i32),
            FieldType::Float => HostValue::F32(f32::from_bits(read_u32(buf)?)),
            FieldType::Fixed64 => HostValue::U64(read_u64(buf)?),
            FieldType::SFixed64 => HostValue::I64(read_u64(buf)? as i64),
            FieldType::Double => HostValue::F64(f64::from_bits(read_u64(buf)?)),
            FieldType::String => {
                let raw = self.read_len(buf)?;
                let text = core::str::from_utf8(raw).map_err(|_| {
                    BridgeError::malformed(format!("{}: invalid UTF-8", field.name))
                })?;
                HostValue::Str(text.to_owned())
            }
            FieldType::Bytes => HostValue::Bytes(self.read_len(buf)?.to_vec()),
            FieldType::Message(name) => {
                let nested = self.registry.message(name)?;
                let raw = self.read_len(buf)?;
                HostValue::Object(self.decode_message(raw, nested, preserve, depth + 1)?)
            }
            FieldType::Map(..) => {
                return Err(BridgeError::malformed(format!(
                    "{}: map nested in a map",
                    field.name
                )));
            }
        })
    }

    fn read_len<'a>(&self, buf: &mut &'a [u8]) -> Result<&'a [u8]> {
        let len = decode_varint(buf)?;
        if len > self.limits.max_field_bytes as u64 {
            return Err(BridgeError::malformed(format!(
                "length-delimited field of {len} bytes exceeds limit {}",
                self.limits.max_field_bytes
            )));
        }
        take(buf, len as usize)
    }

    fn skip_value(&self, wire_type: WireType, buf: &mut &[u8]) -> Result<()> {
        match wire_type {
            WireType::Varint => {
                decode_varint(buf)?;
            }
            WireType::ThirtyTwoBit => {
                take(buf, 4)?;
            }
            WireType::SixtyFourBit => {
                take(buf, 8)?;
            }
            WireType::LengthDelimited => {
                self.read_len(buf)?;
            }
            WireType::StartGroup | WireType::EndGroup => {
                return Err(BridgeError::malformed("groups are not supported"));
            }
        }
        Ok(())
    }
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(BridgeError::malformed(format!(
            "truncated: need {n} bytes, {} left",
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn read_u32(buf: &mut &[u8]) -> Result<u32> {
    let b = take(buf, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(buf: &mut &[u8]) -> Result<u64> {
    let b = take(buf, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Ok(u64::from_le_bytes(raw))
}

/// Synthetic key (tag 1) and value (tag 2) fields of a map entry.
fn map_entry_fields(
    field: &FieldDescriptor,
    key_ty: &FieldType,
    value_ty: &FieldType,
) -> (FieldDescriptor, FieldDescriptor) {
    (
        FieldDescriptor::new(&format!("{}.key", field.name), 1, key_ty.clone()),
        FieldDescriptor::new(&format!("{}.value", field.name), 2, value_ty.clone()),
    )
}

fn push_items(obj: &mut HostObject, key: &str, items: Vec<HostValue>) {
    let slot = obj
        .fields
        .entry(key.to_owned())
        .or_insert_with(|| HostValue::List(Vec::new()));
    match slot {
        HostValue::List(list) => list.extend(items),
        other => *other = HostValue::List(items),
    }
}

/// Value a field takes when it is absent from the wire.
pub fn default_value(field: &FieldDescriptor) -> HostValue {
    match field.label {
        Label::Repeated => HostValue::List(Vec::new()),
        Label::Optional => HostValue::Null,
        Label::Singular => match field.ty {
            FieldType::Bool => HostValue::Bool(false),
            FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 | FieldType::Enum => {
                HostValue::I32(0)
            }
            FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => HostValue::I64(0),
            FieldType::UInt32 | FieldType::Fixed32 => HostValue::U32(0),
            FieldType::UInt64 | FieldType::Fixed64 => HostValue::U64(0),
            FieldType::Float => HostValue::F32(0.0),
            FieldType::Double => HostValue::F64(0.0),
            FieldType::String => HostValue::Str(String::new()),
            FieldType::Bytes => HostValue::Bytes(Vec::new()),
            FieldType::Message(_) => HostValue::Null,
            FieldType::Map(..) => HostValue::Map(BTreeMap::new()),
        },
    }
}

// ── Tests ────────────────────────────────────────────────────
