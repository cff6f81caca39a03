//! The runtime value tree.
//!
//! `Value` is an explicit tagged union covering JSON shapes plus the
//! non-JSON leaves the serializer registry exists for (`Timestamp`,
//! `Regex`) and the virtual placeholder variant (`Virtual`).

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Number;
use time::OffsetDateTime;

use super::VirtualNode;

/// A runtime value, possibly containing virtual placeholders.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The "no value yet" sentinel. Dropped from objects when serialized.
    Undefined,
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    /// A wall-clock instant. Not JSON-representable; tagged by the
    /// built-in `date` serializer when persisted.
    Timestamp(OffsetDateTime),
    /// A regular expression pattern. Tagged by the built-in `regexp`
    /// serializer when persisted.
    Regex(String),
    /// A virtual placeholder standing in for a not-yet-known value.
    Virtual(Box<VirtualNode>),
}

/// The primitive shape a value (or a virtual placeholder) presents as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Undefined,
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
    Timestamp,
    Regex,
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Undefined => Kind::Undefined,
            Value::Null => Kind::Null,
            Value::Bool(_) => Kind::Bool,
            Value::Number(_) => Kind::Number,
            Value::String(_) => Kind::String,
            Value::Array(_) => Kind::Array,
            Value::Object(_) => Kind::Object,
            Value::Timestamp(_) => Kind::Timestamp,
            Value::Regex(_) => Kind::Regex,
            Value::Virtual(node) => node.kind(),
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Value::Virtual(_))
    }

    pub fn object(entries: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
        Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn array(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Array(items.into_iter().collect())
    }

    /// Field lookup on plain objects and virtual nodes. Read-only; no
    /// wrapping side effects.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            Value::Virtual(node) => node.child(key),
            _ => None,
        }
    }

    /// Index lookup on plain arrays and array-kind virtual nodes.
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        match self {
            Value::Array(items) => items.get(index),
            Value::Virtual(node) => node.child(&index.to_string()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Undefined
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(Number::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Number::from_f64(v).map_or(Value::Null, Value::Number)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<OffsetDateTime> for Value {
    fn from(v: OffsetDateTime) -> Self {
        Value::Timestamp(v)
    }
}

/// Display never panics: virtual placeholders fall back to their primitive
/// snapshot, container kinds render a stable placeholder string. This is
/// what lets a virtual value appear embedded in request bodies or log
/// output without crashing caller code.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Object(_) => write!(f, "[object]"),
            Value::Timestamp(ts) => write!(f, "{ts}"),
            Value::Regex(p) => write!(f, "/{p}/"),
            Value::Virtual(node) => node.fmt(f),
        }
    }
}
