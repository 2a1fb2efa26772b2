//! Core value types for Tessera
//!
//! Every stored row value is a [`Datum`]. Values are persisted with bincode;
//! a nil value always serializes to the empty byte string so that deletes
//! (tombstones) cost nothing on disk beyond their key.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::{Result, TesseraError};

/// Row sequence number, also used as the segment generation marker
pub type RowId = u64;

/// Basic type tag of a [`Datum`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatumType {
    Nil,
    Bool,
    Int32,
    Int64,
    BigInt,
    Double,
    String,
    DateTime,
    Array,
    Struct,
    Binary,
}

/// A structured value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Datum {
    #[default]
    Nil,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    BigInt(i128),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Array(Vec<Datum>),
    Struct(BTreeMap<String, Datum>),
    Binary(Vec<u8>),
}

/// Numeric view of a value used for cross-type comparison
#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i128),
    Float(f64),
}

impl Number {
    fn compare(self, other: Number) -> Ordering {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.cmp(&b),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }
}

impl Datum {
    /// Create a struct from `(field, value)` pairs
    pub fn structure<K: Into<String>>(fields: impl IntoIterator<Item = (K, Datum)>) -> Self {
        Datum::Struct(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Get the basic type of this value
    pub fn basic_type(&self) -> DatumType {
        match self {
            Datum::Nil => DatumType::Nil,
            Datum::Bool(_) => DatumType::Bool,
            Datum::Int32(_) => DatumType::Int32,
            Datum::Int64(_) => DatumType::Int64,
            Datum::BigInt(_) => DatumType::BigInt,
            Datum::Double(_) => DatumType::Double,
            Datum::String(_) => DatumType::String,
            Datum::DateTime(_) => DatumType::DateTime,
            Datum::Array(_) => DatumType::Array,
            Datum::Struct(_) => DatumType::Struct,
            Datum::Binary(_) => DatumType::Binary,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Datum::Nil)
    }

    /// Number of elements (arrays and structs), 0 for nil, 1 otherwise
    pub fn count(&self) -> usize {
        match self {
            Datum::Nil => 0,
            Datum::Array(items) => items.len(),
            Datum::Struct(fields) => fields.len(),
            _ => 1,
        }
    }

    /// Get the element at `index`. Scalars behave as one-element arrays.
    pub fn element(&self, index: usize) -> Option<&Datum> {
        match self {
            Datum::Nil => None,
            Datum::Array(items) => items.get(index),
            Datum::Struct(fields) => fields.values().nth(index),
            other if index == 0 => Some(other),
            _ => None,
        }
    }

    /// Set the element at `index`, growing the array with nils as needed.
    /// A non-array value is replaced by an array.
    pub fn set_element(&mut self, index: usize, value: Datum) {
        if !matches!(self, Datum::Array(_)) {
            *self = Datum::Array(Vec::new());
        }
        if let Datum::Array(items) = self {
            if items.len() <= index {
                items.resize(index + 1, Datum::Nil);
            }
            items[index] = value;
        }
    }

    /// Get a struct field
    pub fn field(&self, name: &str) -> Option<&Datum> {
        match self {
            Datum::Struct(fields) => fields.get(name),
            _ => None,
        }
    }

    /// Set a struct field. A non-struct value is replaced by a struct.
    pub fn set_field(&mut self, name: impl Into<String>, value: Datum) {
        if !matches!(self, Datum::Struct(_)) {
            *self = Datum::Struct(BTreeMap::new());
        }
        if let Datum::Struct(fields) = self {
            fields.insert(name.into(), value);
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer value, if this is an integer (or an integral string)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            Datum::BigInt(v) => i64::try_from(*v).ok(),
            Datum::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Datum::DateTime(dt) => Some(*dt),
            Datum::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }

    fn is_number(&self) -> bool {
        matches!(
            self,
            Datum::Int32(_) | Datum::Int64(_) | Datum::BigInt(_) | Datum::Double(_)
        )
    }

    fn as_number(&self) -> Option<Number> {
        match self {
            Datum::Int32(v) => Some(Number::Int(*v as i128)),
            Datum::Int64(v) => Some(Number::Int(*v as i128)),
            Datum::BigInt(v) => Some(Number::Int(*v)),
            Datum::Double(v) => Some(Number::Float(*v)),
            Datum::String(s) => {
                let s = s.trim();
                s.parse::<i128>()
                    .map(Number::Int)
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(Number::Float))
            }
            _ => None,
        }
    }

    /// Default ordering of values.
    ///
    /// Values of the same type compare naturally; arrays and structs compare by
    /// count first, then element-wise (structs by field name, then value).
    /// Nil is less than everything except the empty string, empty array and
    /// empty struct, which it equals. When either side is a number both are
    /// compared numerically and a valid number sorts above a non-number.
    /// Anything else is considered equal.
    pub fn compare(&self, other: &Datum) -> Ordering {
        match (self, other) {
            (Datum::Nil, Datum::Nil) => Ordering::Equal,
            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Int32(a), Datum::Int32(b)) => a.cmp(b),
            (Datum::Int64(a), Datum::Int64(b)) => a.cmp(b),
            (Datum::BigInt(a), Datum::BigInt(b)) => a.cmp(b),
            (Datum::Double(a), Datum::Double(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Datum::String(a), Datum::String(b)) => a.cmp(b),
            (Datum::DateTime(a), Datum::DateTime(b)) => a.cmp(b),
            (Datum::Binary(a), Datum::Binary(b)) => a.cmp(b),
            (Datum::Array(a), Datum::Array(b)) => a.len().cmp(&b.len()).then_with(|| {
                a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| x.compare(y))
                    .find(|o| o.is_ne())
                    .unwrap_or(Ordering::Equal)
            }),
            (Datum::Struct(a), Datum::Struct(b)) => a.len().cmp(&b.len()).then_with(|| {
                a.iter()
                    .zip(b.iter())
                    .map(|((ka, va), (kb, vb))| ka.cmp(kb).then_with(|| va.compare(vb)))
                    .find(|o| o.is_ne())
                    .unwrap_or(Ordering::Equal)
            }),
            (Datum::Nil, other) => Self::compare_nil(other),
            (other, Datum::Nil) => Self::compare_nil(other).reverse(),
            (a, b) if a.is_number() || b.is_number() => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => x.compare(y),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            },
            _ => Ordering::Equal,
        }
    }

    /// Ordering of nil relative to a non-nil value
    fn compare_nil(other: &Datum) -> Ordering {
        match other {
            Datum::String(s) if s.is_empty() => Ordering::Equal,
            Datum::Array(items) if items.is_empty() => Ordering::Equal,
            Datum::Struct(fields) if fields.is_empty() => Ordering::Equal,
            _ => Ordering::Less,
        }
    }

    /// Serialize for storage. Nil is the empty byte string.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.is_nil() {
            return Ok(Vec::new());
        }
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a stored value. The empty byte string is nil.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Datum::Nil);
        }
        Ok(bincode::deserialize(data)?)
    }

    /// Convert from JSON. Integers become `Int64` (or `BigInt` when they
    /// overflow), strings in RFC 3339 form stay strings.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Datum::Nil,
            Value::Bool(b) => Datum::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Datum::Int64(i)
                } else if let Some(u) = n.as_u64() {
                    Datum::BigInt(u as i128)
                } else {
                    Datum::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Datum::String(s.clone()),
            Value::Array(items) => Datum::Array(items.iter().map(Datum::from_json).collect()),
            Value::Object(fields) => Datum::Struct(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Datum::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to JSON
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Datum::Nil => Value::Null,
            Datum::Bool(b) => Value::Bool(*b),
            Datum::Int32(v) => Value::from(*v),
            Datum::Int64(v) => Value::from(*v),
            Datum::BigInt(v) => match i64::try_from(*v) {
                Ok(v) => Value::from(v),
                Err(_) => Value::String(v.to_string()),
            },
            Datum::Double(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Datum::String(s) => Value::String(s.clone()),
            Datum::DateTime(dt) => Value::String(dt.to_rfc3339_opts(SecondsFormat::Micros, true)),
            Datum::Array(items) => Value::Array(items.iter().map(Datum::to_json).collect()),
            Datum::Struct(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Datum::Binary(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        }
    }

    /// Approximate in-memory size in bytes
    pub fn size(&self) -> usize {
        match self {
            Datum::Nil | Datum::Bool(_) => 1,
            Datum::Int32(_) => 4,
            Datum::Int64(_) | Datum::Double(_) | Datum::DateTime(_) => 8,
            Datum::BigInt(_) => 16,
            Datum::String(s) => s.len(),
            Datum::Binary(b) => b.len(),
            Datum::Array(items) => items.iter().map(Datum::size).sum(),
            Datum::Struct(fields) => fields.iter().map(|(k, v)| k.len() + v.size()).sum(),
        }
    }
}

/// Microseconds since the Unix epoch to a UTC datetime
pub(crate) fn datetime_from_micros(micros: i64) -> Option<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Nil => write!(f, "nil"),
            Datum::String(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<i32> for Datum {
    fn from(v: i32) -> Self {
        Datum::Int32(v)
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int64(v)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Double(v)
    }
}

impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Datum::Bool(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::String(v.to_string())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Datum::String(v)
    }
}

impl From<DateTime<Utc>> for Datum {
    fn from(v: DateTime<Utc>) -> Self {
        Datum::DateTime(v)
    }
}

impl From<Vec<Datum>> for Datum {
    fn from(v: Vec<Datum>) -> Self {
        Datum::Array(v)
    }
}

impl TryFrom<&Datum> for String {
    type Error = TesseraError;

    fn try_from(value: &Datum) -> Result<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| TesseraError::InvalidFormat(format!("expected string, got {:?}", value.basic_type())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nil_comparison() {
        assert_eq!(Datum::Nil.compare(&Datum::from("")), Ordering::Equal);
        assert_eq!(Datum::Nil.compare(&Datum::Array(vec![])), Ordering::Equal);
        assert_eq!(Datum::Struct(BTreeMap::new()).compare(&Datum::Nil), Ordering::Equal);
        assert_eq!(Datum::Nil.compare(&Datum::from("a")), Ordering::Less);
        assert_eq!(Datum::from(0).compare(&Datum::Nil), Ordering::Greater);
    }

    #[test]
    fn test_numeric_comparison() {
        assert_eq!(Datum::Int32(5).compare(&Datum::Int64(5)), Ordering::Equal);
        assert_eq!(Datum::Int64(5).compare(&Datum::Double(5.5)), Ordering::Less);
        assert_eq!(Datum::BigInt(1 << 80).compare(&Datum::Int64(i64::MAX)), Ordering::Greater);
        assert_eq!(Datum::Int32(10).compare(&Datum::from("9")), Ordering::Greater);
        // valid number sorts above a non-number
        assert_eq!(Datum::Int32(1).compare(&Datum::from("abc")), Ordering::Greater);
        assert_eq!(Datum::from(true).compare(&Datum::from("abc")), Ordering::Equal);
    }

    #[test]
    fn test_array_and_struct_comparison() {
        let short = Datum::Array(vec![Datum::from(9)]);
        let long = Datum::Array(vec![Datum::from(1), Datum::from(2)]);
        assert_eq!(short.compare(&long), Ordering::Less);

        let a = Datum::structure([("a", Datum::from(1))]);
        let b = Datum::structure([("b", Datum::from(0))]);
        assert_eq!(a.compare(&b), Ordering::Less);
    }

    #[test]
    fn test_serialization() {
        assert!(Datum::Nil.to_bytes().unwrap().is_empty());
        assert_eq!(Datum::from_bytes(&[]).unwrap(), Datum::Nil);

        let value = Datum::structure([
            ("name", Datum::from("apple")),
            ("count", Datum::from(3)),
            ("tags", Datum::Array(vec![Datum::from("red"), Datum::from("fruit")])),
        ]);
        let bytes = value.to_bytes().unwrap();
        assert_eq!(Datum::from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn test_json_conversion() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"name":"banana","price":1.5,"stock":[1,2]}"#).unwrap();
        let value = Datum::from_json(&json);
        assert_eq!(value.field("name"), Some(&Datum::from("banana")));
        assert_eq!(value.field("price"), Some(&Datum::Double(1.5)));
        assert_eq!(value.field("stock").map(Datum::count), Some(2));
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_element_access() {
        let mut value = Datum::Nil;
        value.set_element(2, Datum::from("x"));
        assert_eq!(value.count(), 3);
        assert_eq!(value.element(0), Some(&Datum::Nil));
        assert_eq!(value.element(2), Some(&Datum::from("x")));

        let scalar = Datum::from(7);
        assert_eq!(scalar.element(0), Some(&scalar));
        assert_eq!(scalar.element(1), None);

        let mut record = Datum::from(1);
        record.set_field("k", Datum::from(2));
        assert_eq!(record.field("k"), Some(&Datum::from(2)));
    }
}
