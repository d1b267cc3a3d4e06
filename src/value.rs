//! Dynamic values: the payload type of cache entries and wire payloads.
//!
//! [`Value`] is a tagged union over the types the remote's data model knows
//! about. Maps preserve insertion order, which the canonical encoding relies
//! on for round-trip stability. [`Blob`] is a cheap, zero-copy view over
//! shared bytes; slicing a blob never copies.
//!
//! # Examples
//!
//! ```rust
//! use gantry::value::{Blob, Value, ValueMap};
//!
//! let mut map = ValueMap::new();
//! map.insert(Value::from("name"), Value::from("gantry"));
//! map.insert(Value::from("size"), Value::from(3i64));
//!
//! let value = Value::Map(map);
//! assert!(value.deep_size() > 0);
//! ```

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::errors::{labels, Error, ErrorKind, Result};

/// A non-owning byte view plus the token keeping its backing alive.
///
/// Backed by [`Bytes`], so clones and sub-slices share one allocation.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Blob {
    bytes: Bytes,
}

impl Blob {
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Zero-copy sub-slice sharing the same backing memory.
    pub fn slice(&self, range: std::ops::Range<usize>) -> Blob {
        Blob {
            bytes: self.bytes.slice(range),
        }
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Blob::new(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Blob {
    fn from(bytes: &'static [u8]) -> Self {
        Blob::new(Bytes::from_static(bytes))
    }
}

impl From<Bytes> for Blob {
    fn from(bytes: Bytes) -> Self {
        Blob::new(bytes)
    }
}

impl AsRef<[u8]> for Blob {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.bytes.len())
    }
}

/// A map from values to values that preserves insertion order.
///
/// Lookups are linear; the maps this system moves around are small (object
/// metadata, calculation arguments), and order stability is what the
/// canonical encoding needs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValueMap {
    entries: Vec<(Value, Value)>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a key-value pair. An existing key keeps its position and has
    /// its value replaced.
    pub fn insert(&mut self, key: Value, value: Value) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Looks up a string key, the common case for object-shaped maps.
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| matches!(k, Value::Str(s) if s == key))
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

impl FromIterator<(Value, Value)> for ValueMap {
    fn from_iter<T: IntoIterator<Item = (Value, Value)>>(iter: T) -> Self {
        let mut map = ValueMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// A schema-tagged dynamic value.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Str(String),
    Blob(Blob),
    Datetime(DateTime<Utc>),
    List(Vec<Value>),
    Map(ValueMap),
}

impl Value {
    /// The schema tag of this value, used in type-mismatch diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Blob(_) => "blob",
            Value::Datetime(_) => "datetime",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    fn mismatch(&self, expected: &'static str) -> Error {
        Error::new(ErrorKind::TypeMismatch)
            .with_info(labels::EXPECTED_TYPE, expected)
            .with_info(labels::ACTUAL_TYPE, self.type_name())
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.mismatch("boolean")),
        }
    }

    pub fn as_integer(&self) -> Result<i64> {
        match self {
            Value::Integer(i) => Ok(*i),
            other => Err(other.mismatch("integer")),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            Value::Float(f) => Ok(*f),
            other => Err(other.mismatch("float")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn as_blob(&self) -> Result<&Blob> {
        match self {
            Value::Blob(b) => Ok(b),
            other => Err(other.mismatch("blob")),
        }
    }

    pub fn as_list(&self) -> Result<&[Value]> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(other.mismatch("list")),
        }
    }

    pub fn as_map(&self) -> Result<&ValueMap> {
        match self {
            Value::Map(map) => Ok(map),
            other => Err(other.mismatch("map")),
        }
    }

    /// Approximate deep memory footprint, used as the cache entry size.
    pub fn deep_size(&self) -> usize {
        let own = std::mem::size_of::<Value>();
        match self {
            Value::Str(s) => own + s.len(),
            Value::Blob(b) => own + b.len(),
            Value::List(items) => own + items.iter().map(Value::deep_size).sum::<usize>(),
            Value::Map(map) => {
                own + map
                    .iter()
                    .map(|(k, v)| k.deep_size() + v.deep_size())
                    .sum::<usize>()
            }
            _ => own,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Blob> for Value {
    fn from(value: Blob) -> Self {
        Value::Blob(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<ValueMap> for Value {
    fn from(value: ValueMap) -> Self {
        Value::Map(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_preserve_insertion_order() {
        let mut map = ValueMap::new();
        map.insert(Value::from("z"), Value::from(1i64));
        map.insert(Value::from("a"), Value::from(2i64));
        map.insert(Value::from("m"), Value::from(3i64));
        // Replacing a value keeps the key's original position.
        map.insert(Value::from("z"), Value::from(9i64));

        let keys: Vec<_> = map
            .iter()
            .map(|(k, _)| k.as_str().unwrap().to_owned())
            .collect();
        assert_eq!(keys, ["z", "a", "m"]);
        assert_eq!(map.get_str("z"), Some(&Value::from(9i64)));
    }

    #[test]
    fn blob_slicing_shares_backing_memory() {
        let blob = Blob::from(b"hello world".to_vec());
        let hello = blob.slice(0..5);
        assert_eq!(hello.as_slice(), b"hello");
        assert_eq!(blob.len(), 11);
        // Both views point into one allocation.
        assert_eq!(
            blob.as_slice().as_ptr() as usize,
            hello.as_slice().as_ptr() as usize
        );
    }

    #[test]
    fn type_mismatches_attach_both_shapes() {
        let err = Value::from("four").as_integer().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert_eq!(err.info(labels::EXPECTED_TYPE), Some("integer"));
        assert_eq!(err.info(labels::ACTUAL_TYPE), Some("string"));
    }

    #[test]
    fn deep_size_counts_nested_payloads() {
        let flat = Value::from(1i64).deep_size();
        let list = Value::List(vec![Value::from(1i64), Value::from(2i64)]).deep_size();
        assert!(list > 2 * flat);

        let with_blob = Value::Blob(Blob::from(vec![0u8; 1024])).deep_size();
        assert!(with_blob >= 1024);
    }
}
