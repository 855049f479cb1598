//! Dynamically-typed property values.
//!
//! D-Bus properties are variants; the cache carries them as [`Value`], a sum
//! type over the wire types the cache handles. A missing or not-yet-loaded
//! property is represented as the *absence* of a `Value` (`Option::None`),
//! never as a sentinel variant.

use std::collections::BTreeMap;
use std::fmt;

/// The property map of one interface: property name to value.
///
/// Ordered so that iteration (and therefore signal emission order) is
/// deterministic.
pub type PropertyMap = BTreeMap<String, Value>;

/// A dynamically-typed D-Bus value.
///
/// Carries the subset of D-Bus types the cache handles, with structural
/// equality. Container values hold their elements untyped; the wire signature
/// is reconstructed by the transport when a value is sent back out.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Array(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Struct(Vec<Value>),
    Variant(Box<Value>),
}

impl Value {
    /// Unwrap nested variant layers, returning the innermost value.
    pub fn flatten(&self) -> &Value {
        let mut value = self;
        while let Value::Variant(inner) = value {
            value = inner;
        }
        value
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v:?}"),
            Value::ObjectPath(v) => write!(f, "{v}"),
            Value::Signature(v) => write!(f, "{v}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Struct(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, ")")
            }
            Value::Variant(inner) => write!(f, "{inner}"),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        })*
    };
}

impl_from! {
    bool => Bool,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f64 => F64,
    String => Str,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

/// Conversion out of a cached [`Value`], used by
/// [`PropertyCache::get_as`](crate::PropertyCache::get_as).
///
/// Integer targets accept any integer variant that fits; nested variants are
/// unwrapped first. Returns `None` when the value cannot represent the target
/// type, in which case `get_as` falls back to `T::default()`.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

fn as_i64(value: &Value) -> Option<i64> {
    match value.flatten() {
        Value::U8(v) => Some(i64::from(*v)),
        Value::I16(v) => Some(i64::from(*v)),
        Value::U16(v) => Some(i64::from(*v)),
        Value::I32(v) => Some(i64::from(*v)),
        Value::U32(v) => Some(i64::from(*v)),
        Value::I64(v) => Some(*v),
        Value::U64(v) => i64::try_from(*v).ok(),
        _ => None,
    }
}

macro_rules! impl_from_value_int {
    ($($ty:ty),* $(,)?) => {
        $(impl FromValue for $ty {
            fn from_value(value: &Value) -> Option<Self> {
                as_i64(value).and_then(|v| <$ty>::try_from(v).ok())
            }
        })*
    };
}

impl_from_value_int!(u8, i16, u16, i32, u32, i64);

impl FromValue for u64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value.flatten() {
            Value::U64(v) => Some(*v),
            other => as_i64(other).and_then(|v| u64::try_from(v).ok()),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        match value.flatten() {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value.flatten() {
            Value::F64(v) => Some(*v),
            other => as_i64(other).map(|v| v as f64),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value.flatten() {
            Value::Str(v) | Value::ObjectPath(v) => Some(v.clone()),
            _ => None,
        }
    }
}
