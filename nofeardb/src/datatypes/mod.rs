//! Primitive datatype converters.
//!
//! Each converter knows how to coerce loosely-typed JSON input into its Rust
//! type (`cast`), and how to move that type to and from the string form that
//! is stored in document files (`serialize` / `deserialize`).

use crate::error::{NoFearDbError, Result};
use chrono::NaiveDateTime;
use std::cmp::Ordering;
use std::fmt;

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Dynamically typed field value, used by expressions and generic field access.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    DateTime(NaiveDateTime),
    Uuid(uuid::Uuid),
    Boolean(bool),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Order two values of compatible kinds. Integers and floats compare numerically;
    /// any other mix of kinds is unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// Equality that treats Integer(2) and Float(2.0) as the same value.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::DateTime(v) => write!(f, "{}", v.format(DATETIME_FORMAT)),
            Value::Uuid(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
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

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<uuid::Uuid> for Value {
    fn from(v: uuid::Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

/// A primitive type that can be stored in a document field.
pub trait DataType: Send + 'static {
    type Value: Clone + PartialEq + fmt::Debug + Send;

    /// Short type name used in error messages and schema validation.
    const NAME: &'static str;

    /// Coerce an arbitrary JSON scalar into this type.
    fn cast(raw: &serde_json::Value) -> Result<Self::Value>;

    fn serialize(value: &Self::Value) -> String;

    fn deserialize(raw: &str) -> Result<Self::Value>;

    fn to_value(value: &Self::Value) -> Value;
}

fn conversion_error(type_name: &str, raw: impl fmt::Display) -> NoFearDbError {
    NoFearDbError::Conversion(format!("cannot convert '{raw}' to {type_name}"))
}

fn parse_hex(raw: &str) -> Option<i64> {
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))?;
    let parsed = i64::from_str_radix(digits, 16).ok()?;
    Some(if negative { -parsed } else { parsed })
}

#[derive(Debug, Clone, Copy)]
pub struct Integer;

impl DataType for Integer {
    type Value = i64;
    const NAME: &'static str = "integer";

    fn cast(raw: &serde_json::Value) -> Result<i64> {
        match raw {
            serde_json::Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                .ok_or_else(|| conversion_error(Self::NAME, n)),
            serde_json::Value::String(s) => Self::deserialize(s),
            other => Err(conversion_error(Self::NAME, other)),
        }
    }

    fn serialize(value: &i64) -> String {
        value.to_string()
    }

    fn deserialize(raw: &str) -> Result<i64> {
        let raw = raw.trim();
        if let Some(hex) = parse_hex(raw) {
            return Ok(hex);
        }
        if raw.contains('.') {
            return raw
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(|f| f.trunc() as i64)
                .ok_or_else(|| conversion_error(Self::NAME, raw));
        }
        raw.parse::<i64>()
            .map_err(|_| conversion_error(Self::NAME, raw))
    }

    fn to_value(value: &i64) -> Value {
        Value::Integer(*value)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Float;

impl DataType for Float {
    type Value = f64;
    const NAME: &'static str = "float";

    fn cast(raw: &serde_json::Value) -> Result<f64> {
        match raw {
            serde_json::Value::Number(n) => {
                n.as_f64().ok_or_else(|| conversion_error(Self::NAME, n))
            }
            serde_json::Value::String(s) => Self::deserialize(s),
            other => Err(conversion_error(Self::NAME, other)),
        }
    }

    fn serialize(value: &f64) -> String {
        // Keep a decimal point on whole numbers so the stored form reads as a float.
        if value.is_finite() && value.fract() == 0.0 {
            format!("{value:.1}")
        } else {
            value.to_string()
        }
    }

    fn deserialize(raw: &str) -> Result<f64> {
        let raw = raw.trim();
        if let Some(hex) = parse_hex(raw) {
            return Ok(hex as f64);
        }
        raw.parse::<f64>()
            .map_err(|_| conversion_error(Self::NAME, raw))
    }

    fn to_value(value: &f64) -> Value {
        Value::Float(*value)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Text;

impl DataType for Text {
    type Value = String;
    const NAME: &'static str = "string";

    fn cast(raw: &serde_json::Value) -> Result<String> {
        match raw {
            serde_json::Value::String(s) => Ok(s.clone()),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            serde_json::Value::Bool(b) => Ok(b.to_string()),
            other => Err(conversion_error(Self::NAME, other)),
        }
    }

    fn serialize(value: &String) -> String {
        value.clone()
    }

    fn deserialize(raw: &str) -> Result<String> {
        Ok(raw.to_string())
    }

    fn to_value(value: &String) -> Value {
        Value::String(value.clone())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DateTime;

impl DataType for DateTime {
    type Value = NaiveDateTime;
    const NAME: &'static str = "datetime";

    fn cast(raw: &serde_json::Value) -> Result<NaiveDateTime> {
        match raw {
            serde_json::Value::String(s) => Self::deserialize(s),
            other => Err(conversion_error(Self::NAME, other)),
        }
    }

    fn serialize(value: &NaiveDateTime) -> String {
        value.format(DATETIME_FORMAT).to_string()
    }

    fn deserialize(raw: &str) -> Result<NaiveDateTime> {
        let trimmed = raw.trim().trim_end_matches('Z');
        NaiveDateTime::parse_from_str(trimmed, DATETIME_FORMAT)
            .map_err(|_| conversion_error(Self::NAME, raw))
    }

    fn to_value(value: &NaiveDateTime) -> Value {
        Value::DateTime(*value)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Uuid;

impl DataType for Uuid {
    type Value = uuid::Uuid;
    const NAME: &'static str = "uuid";

    fn cast(raw: &serde_json::Value) -> Result<uuid::Uuid> {
        match raw {
            serde_json::Value::String(s) => Self::deserialize(s),
            other => Err(conversion_error(Self::NAME, other)),
        }
    }

    fn serialize(value: &uuid::Uuid) -> String {
        value.to_string()
    }

    fn deserialize(raw: &str) -> Result<uuid::Uuid> {
        uuid::Uuid::parse_str(raw.trim()).map_err(|_| conversion_error(Self::NAME, raw))
    }

    fn to_value(value: &uuid::Uuid) -> Value {
        Value::Uuid(*value)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Boolean;

impl DataType for Boolean {
    type Value = bool;
    const NAME: &'static str = "boolean";

    fn cast(raw: &serde_json::Value) -> Result<bool> {
        match raw {
            serde_json::Value::Bool(b) => Ok(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(false),
                Some(1) => Ok(true),
                _ => Err(conversion_error(Self::NAME, n)),
            },
            serde_json::Value::String(s) => Self::deserialize(s),
            other => Err(conversion_error(Self::NAME, other)),
        }
    }

    fn serialize(value: &bool) -> String {
        value.to_string()
    }

    fn deserialize(raw: &str) -> Result<bool> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(conversion_error(Self::NAME, raw)),
        }
    }

    fn to_value(value: &bool) -> Value {
        Value::Boolean(*value)
    }
}
