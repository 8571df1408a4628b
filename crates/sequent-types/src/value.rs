//! The value model carried inside event state mappings.
//!
//! The base set is closed: null, bool, integer, float, string, ordered
//! sequence, and mapping with string keys. Everything else enters the tree
//! as a [`Value::Custom`] node holding an [`Extension`] value; the codec
//! layer's transcoding registry is responsible for turning custom nodes
//! into base-representable form on the wire and back.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Attribute mapping of a domain event.
pub type StateMap = BTreeMap<String, Value>;

/// A value that can ride inside a state mapping without being part of the
/// closed base set.
///
/// Implemented automatically for any `'static` type that is `Debug`,
/// `PartialEq`, `Send` and `Sync`; equality between custom nodes is
/// type-checked downcast equality.
pub trait Extension: Any + Debug + Send + Sync {
    /// Upcast for downcasting in comparisons and transcodings.
    fn as_any(&self) -> &dyn Any;

    /// Type-checked equality against another extension value.
    fn eq_extension(&self, other: &dyn Extension) -> bool;
}

impl<T> Extension for T
where
    T: Any + Debug + Send + Sync + PartialEq,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_extension(&self, other: &dyn Extension) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| self == other)
    }
}

/// A node of the value tree.
#[derive(Debug, Clone)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float. NaN is not a supported payload value.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Ordered sequence; element order is significant and preserved.
    Seq(Vec<Value>),
    /// Mapping with string keys; key order is not semantically significant.
    Map(StateMap),
    /// Registry-extended value, resolved by a named transcoding.
    Custom(Arc<dyn Extension>),
}

impl Value {
    /// Wrap a custom value.
    pub fn custom<T: Extension>(value: T) -> Self {
        Value::Custom(Arc::new(value))
    }

    /// Borrow as a string, if this is a string node.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Read as an integer, if this is an integer node.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Read as a bool, if this is a bool node.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Read as a float, if this is a float node.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Borrow as a sequence, if this is a sequence node.
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow as a mapping, if this is a mapping node.
    pub fn as_map(&self) -> Option<&StateMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Downcast a custom node to a concrete extension type.
    pub fn as_custom<T: Extension>(&self) -> Option<&T> {
        match self {
            Value::Custom(ext) => ext.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            // Bitwise float equality: round-trip identity, not numeric laws.
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Custom(a), Value::Custom(b)) => a.eq_extension(b.as_ref()),
            _ => false,
        }
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

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Seq(v)
    }
}

impl From<StateMap> for Value {
    fn from(v: StateMap) -> Self {
        Value::Map(v)
    }
}
