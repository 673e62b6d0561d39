//! JSON inspection view of decoded host objects.
//!
//! Used for logging and debugging overlays. Not a wire format: bytes render
//! as arrays of numbers and non-finite floats as `null`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use super::{HostObject, HostValue};
use crate::error::{BridgeError, Result};

/// Largest integer a double represents exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

/// Rendering of 64-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Int64Strategy {
    /// Always a JSON string.
    AlwaysString,
    /// Always a JSON number, even if a consumer would lose precision.
    AlwaysNumber,
    /// A number when within ±2^53-1, otherwise an error.
    ErrorOnPrecisionLoss,
}

/// Render `obj` as a JSON object.
pub fn to_json(obj: &HostObject, strategy: Int64Strategy, max_depth: u32) -> Result<Value> {
    object_to_json(obj, strategy, max_depth, 0)
}

fn object_to_json(obj: &HostObject, s: Int64Strategy, max_depth: u32, depth: u32) -> Result<Value> {
    if depth >= max_depth {
        return Err(BridgeError::InvalidState(format!(
            "json nesting exceeds {max_depth} in {}",
            obj.type_name
        )));
    }
    let mut map = Map::new();
    for (name, value) in &obj.fields {
        map.insert(name.clone(), value_to_json(value, s, max_depth, depth + 1)?);
    }
    Ok(Value::Object(map))
}

fn value_to_json(v: &HostValue, s: Int64Strategy, max_depth: u32, depth: u32) -> Result<Value> {
    Ok(match v {
        HostValue::Null => Value::Null,
        HostValue::Bool(b) => Value::Bool(*b),
        HostValue::I32(n) => Value::from(*n),
        HostValue::U32(n) => Value::from(*n),
        HostValue::I64(n) => {
            let safe = n.unsigned_abs() <= MAX_SAFE_INTEGER;
            wide_int(s, safe, || Value::from(*n), || n.to_string())?
        }
        HostValue::U64(n) => {
            let safe = *n <= MAX_SAFE_INTEGER;
            wide_int(s, safe, || Value::from(*n), || n.to_string())?
        }
        HostValue::F32(f) => float(f64::from(*f)),
        HostValue::F64(f) => float(*f),
        HostValue::Str(text) => Value::String(text.clone()),
        HostValue::Bytes(b) => Value::Array(b.iter().map(|&x| Value::from(x)).collect()),
        HostValue::Object(o) => object_to_json(o, s, max_depth, depth)?,
        HostValue::List(items) => Value::Array(
            items
                .iter()
                .map(|i| value_to_json(i, s, max_depth, depth))
                .collect::<Result<_>>()?,
        ),
        // JSON object keys are strings, whatever the key type.
        HostValue::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| value_to_json(v, s, max_depth, depth).map(|j| (k.to_string(), j)))
                .collect::<Result<_>>()?,
        ),
    })
}

fn wide_int(
    s: Int64Strategy,
    safe: bool,
    number: impl FnOnce() -> Value,
    text: impl FnOnce() -> String,
) -> Result<Value> {
    match s {
        Int64Strategy::AlwaysString => Ok(Value::String(text())),
        Int64Strategy::AlwaysNumber => Ok(number()),
        Int64Strategy::ErrorOnPrecisionLoss if safe => Ok(number()),
        Int64Strategy::ErrorOnPrecisionLoss => Err(BridgeError::InvalidState(format!(
            "64-bit value {} exceeds the safe integer range",
            text()
        ))),
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}
