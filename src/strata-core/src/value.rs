//! Runtime value representation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A lazily constructed builtin namespace instance.
///
/// Namespaces are memoized into the variable scope that first referenced
/// them, so repeated look-ups observe the same instance. They are bound to
/// a runtime and are never wire-safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    /// Registered builtin name (e.g. `lib`).
    pub name: String,
    /// Iden of the runtime the instance was constructed for.
    pub runtime: u64,
}

impl Namespace {
    /// Create a namespace instance bound to a runtime.
    pub fn new(name: impl Into<String>, runtime: u64) -> Self {
        Self {
            name: name.into(),
            runtime,
        }
    }
}

/// Runtime value in Strata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Binary data.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    List(Vec<Value>),
    /// Map of string keys to values.
    Map(BTreeMap<String, Value>),
    /// Builtin namespace instance bound to a runtime.
    Namespace(Namespace),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to get as boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as i64.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to get as f64.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get as string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as list reference.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Try to get as map reference.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Get the type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Bool(_) => "Bool",
            Self::Int(_) => "Int",
            Self::Float(_) => "Float",
            Self::Str(_) => "Str",
            Self::Bytes(_) => "Bytes",
            Self::List(_) => "List",
            Self::Map(_) => "Map",
            Self::Namespace(_) => "Namespace",
        }
    }

    /// True when the value survives the platform's wire-safe encoding.
    ///
    /// Namespace instances are runtime-bound and never cross a wire
    /// boundary; containers are wire-safe only when every element is.
    pub fn is_wire_safe(&self) -> bool {
        match self {
            Self::Namespace(_) => false,
            Self::List(items) => items.iter().all(Value::is_wire_safe),
            Self::Map(map) => map.values().all(Value::is_wire_safe),
            _ => true,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "bytes({})", b.len()),
            Self::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(map) => {
                write!(f, "{{")?;
                for (idx, (key, item)) in map.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {item}")?;
                }
                write!(f, "}}")
            }
            Self::Namespace(ns) => write!(f, "${}", ns.name),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self::Map(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Int(3).as_int(), Some(3));
        assert_eq!(Value::Int(3).as_float(), Some(3.0));
        assert_eq!(Value::Str("x".into()).as_str(), Some("x"));
        assert!(Value::Null.is_null());
        assert_eq!(Value::Bool(true).as_int(), None);
    }

    #[test]
    fn test_wire_safety() {
        assert!(Value::Int(1).is_wire_safe());
        assert!(Value::List(vec![Value::Int(1), Value::Str("a".into())]).is_wire_safe());

        let ns = Value::Namespace(Namespace::new("lib", 7));
        assert!(!ns.is_wire_safe());
        assert!(!Value::List(vec![Value::Int(1), ns]).is_wire_safe());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Str("hello".into()).to_string(), "hello");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Int(2)]).to_string(),
            "[1, 2]"
        );
        assert_eq!(
            Value::Namespace(Namespace::new("lib", 1)).to_string(),
            "$lib"
        );
    }

    #[test]
    fn test_serde_roundtrip() {
        let valu = Value::Map(BTreeMap::from([
            ("degrees".to_string(), Value::Int(3)),
            ("query".to_string(), Value::Str("hello".into())),
        ]));
        let text = serde_json::to_string(&valu).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, valu);
    }
}
