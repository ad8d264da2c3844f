//! # Wire Values
//!
//! The transport-safe representation and the pure transforms between it and
//! the domain [`Value`] model.
//!
//! ## Tagged maps
//!
//! Shapes with no wire-native form are carried as maps with a reserved
//! `$type` key:
//!
//! - `{"$type": "bytes", "data": <hex>}`
//! - `{"$type": "id", "value": <identifier text>}`
//! - `{"$type": "map", "entries": {...}}`, the escape hatch for a plain map
//!   that itself contains a `$type` key.
//!
//! Anything else carrying a `$type` key fails to decode with
//! [`SerializationError::UnknownTag`].

use std::collections::BTreeMap;

use crate::Identifier;
use crate::Result;
use crate::SerializationError;
use crate::Value;

/// The reserved key marking a tagged map.
const TYPE_KEY: &str = "$type";

/// A value a message channel may carry between contexts.
///
/// Structurally a JSON-like tree: primitives, lists, and string-keyed maps.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
}

impl WireValue {
    /// A short name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            WireValue::Null => "null",
            WireValue::Bool(_) => "bool",
            WireValue::Int(_) => "int",
            WireValue::Float(_) => "float",
            WireValue::Text(_) => "text",
            WireValue::List(_) => "list",
            WireValue::Map(_) => "map",
        }
    }
}

/// Encodes a domain value into its wire-safe representation.
pub fn serialize(value: &Value) -> Result<WireValue> {
    match value {
        Value::Null => Ok(WireValue::Null),
        Value::Bool(b) => Ok(WireValue::Bool(*b)),
        Value::Int(i) => Ok(WireValue::Int(*i)),
        Value::Float(x) => Ok(WireValue::Float(*x)),
        Value::Text(t) => Ok(WireValue::Text(t.clone())),
        Value::Bytes(data) => Ok(tagged("bytes", "data", WireValue::Text(hex_encode(data)))),
        Value::Id(id) => Ok(tagged("id", "value", WireValue::Text(id.to_text()))),
        Value::List(items) => {
            let encoded = items.iter().map(serialize).collect::<Result<Vec<_>>>()?;
            Ok(WireValue::List(encoded))
        }
        Value::Map(entries) => {
            let mut encoded = BTreeMap::new();
            for (key, value) in entries {
                encoded.insert(key.clone(), serialize(value)?);
            }
            if entries.contains_key(TYPE_KEY) {
                // Would be mistaken for a tagged map; escape it.
                Ok(tagged("map", "entries", WireValue::Map(encoded)))
            } else {
                Ok(WireValue::Map(encoded))
            }
        }
    }
}

/// Decodes a wire value back into a domain value.
///
/// Exact inverse of [`serialize`] for every value it produces.
pub fn deserialize(wire: &WireValue) -> Result<Value> {
    match wire {
        WireValue::Null => Ok(Value::Null),
        WireValue::Bool(b) => Ok(Value::Bool(*b)),
        WireValue::Int(i) => Ok(Value::Int(*i)),
        WireValue::Float(x) => Ok(Value::Float(*x)),
        WireValue::Text(t) => Ok(Value::Text(t.clone())),
        WireValue::List(items) => {
            let decoded = items.iter().map(deserialize).collect::<Result<Vec<_>>>()?;
            Ok(Value::List(decoded))
        }
        WireValue::Map(entries) => match entries.get(TYPE_KEY) {
            Some(tag) => deserialize_tagged(tag, entries),
            None => deserialize_map(entries),
        },
    }
}

fn deserialize_tagged(tag: &WireValue, entries: &BTreeMap<String, WireValue>) -> Result<Value> {
    let WireValue::Text(tag) = tag else {
        return Err(SerializationError::UnknownTag(tag.kind().to_string()));
    };
    match tag.as_str() {
        "bytes" => {
            let data = expect_text(entries, "data")?;
            Ok(Value::Bytes(hex_decode(data)?))
        }
        "id" => {
            let text = expect_text(entries, "value")?;
            Ok(Value::Id(Identifier::from_text(text)?))
        }
        "map" => {
            let inner = entries
                .get("entries")
                .ok_or(SerializationError::MissingField("entries"))?;
            let WireValue::Map(inner) = inner else {
                return Err(SerializationError::MissingField("entries"));
            };
            deserialize_map(inner)
        }
        other => Err(SerializationError::UnknownTag(other.to_string())),
    }
}

fn deserialize_map(entries: &BTreeMap<String, WireValue>) -> Result<Value> {
    let mut decoded = BTreeMap::new();
    for (key, value) in entries {
        decoded.insert(key.clone(), deserialize(value)?);
    }
    Ok(Value::Map(decoded))
}

fn tagged(tag: &str, field: &str, payload: WireValue) -> WireValue {
    let mut map = BTreeMap::new();
    map.insert(TYPE_KEY.to_string(), WireValue::Text(tag.to_string()));
    map.insert(field.to_string(), payload);
    WireValue::Map(map)
}

fn expect_text<'a>(
    entries: &'a BTreeMap<String, WireValue>,
    field: &'static str,
) -> Result<&'a str> {
    match entries.get(field) {
        Some(WireValue::Text(text)) => Ok(text),
        _ => Err(SerializationError::MissingField(field)),
    }
}

fn hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn hex_decode(text: &str) -> Result<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(SerializationError::BadHex(text.to_string()));
    }
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(text.len() / 2);
    for pair in bytes.chunks(2) {
        let hi = hex_digit(pair[0]).ok_or_else(|| SerializationError::BadHex(text.to_string()))?;
        let lo = hex_digit(pair[1]).ok_or_else(|| SerializationError::BadHex(text.to_string()))?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
