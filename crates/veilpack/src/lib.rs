//! # Veilpack
//!
//! A small, dependency-free value model and wire-safe serializer.
//!
//! ## Philosophy
//!
//! - **Two worlds**: [`Value`] is what services traffic in, including
//!   strongly typed domain identifiers. [`WireValue`] is the transport-safe
//!   subset a message channel may carry: primitives, lists, and string-keyed
//!   maps, nothing else.
//! - **Exact inverse**: `deserialize(serialize(v)) == v` for every supported
//!   value. Shapes with no wire-native form (bytes, identifiers) travel as
//!   `$type`-tagged maps, and plain maps that would collide with the tag are
//!   escaped, so the law holds even for adversarial keys.
//! - **Pure**: serialization never mutates and never touches I/O.

mod ident;
mod wire;

#[cfg(test)]
mod tests;

pub use ident::GroupIdentifier;
pub use ident::Identifier;
pub use ident::KeyIdentifier;
pub use ident::PostIdentifier;
pub use ident::PostIvIdentifier;
pub use ident::ProfileIdentifier;
pub use wire::WireValue;
pub use wire::deserialize;
pub use wire::serialize;

use std::collections::BTreeMap;

/// Failures while encoding or decoding values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializationError {
    /// A `$type`-tagged map carried a tag the serializer does not recognize.
    UnknownTag(String),
    /// A `$type`-tagged map was missing a required field.
    MissingField(&'static str),
    /// Identifier text did not parse back into an identifier.
    BadIdentifier(String),
    /// The hex payload of a bytes value was malformed.
    BadHex(String),
}

impl std::fmt::Display for SerializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTag(tag) => write!(f, "Unknown wire tag: {:?}", tag),
            Self::MissingField(field) => write!(f, "Tagged map missing field: {:?}", field),
            Self::BadIdentifier(text) => write!(f, "Malformed identifier text: {:?}", text),
            Self::BadHex(text) => write!(f, "Malformed hex payload: {:?}", text),
        }
    }
}

impl std::error::Error for SerializationError {}

/// Specialized `Result` for serialization operations.
pub type Result<T> = std::result::Result<T, SerializationError>;

/// A domain value crossing the RPC boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Id(Identifier),
}

impl Value {
    /// A short name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Id(_) => "id",
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Value::Text(text.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Identifier> for Value {
    fn from(v: Identifier) -> Self {
        Value::Id(v)
    }
}

/// Renders a compact literal, used by call logging to show argument lists.
impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(t) => write!(f, "{:?}", t),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            Value::Id(id) => write!(f, "{}", id),
        }
    }
}
