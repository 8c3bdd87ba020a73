//! Typed column values.
//!
//! Rows are dynamic (their shape comes from a registered [`TableSchema`]), so
//! every cell is a [`Value`] tagged with its runtime type. Values are totally
//! ordered and hashable because they double as primary-key components.
//!
//! [`TableSchema`]: crate::TableSchema

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Column type declared in a table schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    Int,
    /// Arbitrary precision decimal, used for 256-bit chain integers.
    Numeric,
    Text,
    Bytes,
    Timestamp,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Bool => "bool",
            ColumnType::Int => "int",
            ColumnType::Numeric => "numeric",
            ColumnType::Text => "text",
            ColumnType::Bytes => "bytes",
            ColumnType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    /// Decimal string, e.g. a uint256 balance.
    Numeric(String),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// The runtime column type, or `None` for `Null`.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Bool),
            Value::Int(_) => Some(ColumnType::Int),
            Value::Numeric(_) => Some(ColumnType::Numeric),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Bytes(_) => Some(ColumnType::Bytes),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value may be stored in a column of type `ty`.
    ///
    /// `Null` is accepted here; nullability is checked by the schema.
    /// Integers are accepted by numeric columns.
    pub fn fits(&self, ty: ColumnType) -> bool {
        match (self, ty) {
            (Value::Null, _) => true,
            (Value::Int(_), ColumnType::Numeric) => true,
            (value, ty) => value.column_type() == Some(ty),
        }
    }

    /// Coerce into the canonical representation for `ty`.
    ///
    /// Only widening coercions happen (`Int` into a numeric column), so
    /// keys compare equal regardless of how the caller spelled the value.
    pub fn coerce(self, ty: ColumnType) -> Value {
        match (self, ty) {
            (Value::Int(i), ColumnType::Numeric) => Value::Numeric(i.to_string()),
            (value, _) => value,
        }
    }

    /// Approximate heap + inline footprint in bytes, used for the cache
    /// memory budget.
    pub fn estimated_size(&self) -> usize {
        let inline = std::mem::size_of::<Value>();
        match self {
            Value::Numeric(s) | Value::Text(s) => inline + s.len(),
            Value::Bytes(b) => inline + b.len(),
            _ => inline,
        }
    }

    /// Convert a scalar JSON value. Objects and arrays have no scalar form.
    pub fn from_json(json: &serde_json::Value) -> Option<Value> {
        match json {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => Some(match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Numeric(n.to_string()),
            }),
            serde_json::Value::String(s) => Some(Value::Text(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    /// JSON form used on the wire to external providers.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Numeric(s) | Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(format!("0x{}", hex::encode(b))),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Numeric(s) => f.write_str(s),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
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

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_fits_numeric_and_coerces() {
        let v = Value::Int(42);
        assert!(v.fits(ColumnType::Numeric));
        assert!(!v.fits(ColumnType::Text));
        assert_eq!(v.coerce(ColumnType::Numeric), Value::Numeric("42".to_string()));
    }

    #[test]
    fn test_null_fits_everything() {
        assert!(Value::Null.fits(ColumnType::Bytes));
        assert!(Value::Null.fits(ColumnType::Bool));
    }

    #[test]
    fn test_from_json_scalars() {
        let json = serde_json::json!({
            "n": 7,
            "big": 18446744073709551615u64,
            "s": "0xabc",
            "o": {"x": 1},
        });
        assert_eq!(Value::from_json(&json["n"]), Some(Value::Int(7)));
        assert_eq!(
            Value::from_json(&json["big"]),
            Some(Value::Numeric("18446744073709551615".to_string()))
        );
        assert_eq!(Value::from_json(&json["s"]), Some(Value::from("0xabc")));
        assert_eq!(Value::from_json(&json["o"]), None);
    }

    #[test]
    fn test_bytes_to_json_is_hex() {
        let v = Value::Bytes(vec![0xde, 0xad]);
        assert_eq!(v.to_json(), serde_json::json!("0xdead"));
    }

    #[test]
    fn test_estimated_size_grows_with_payload() {
        let small = Value::Text("a".into());
        let large = Value::Text("a".repeat(100));
        assert!(large.estimated_size() > small.estimated_size());
    }
}
