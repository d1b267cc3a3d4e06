//! Codecs for dynamic values: the canonical native encoding, JSON and
//! MessagePack adapters, and LZ4 block compression.
//!
//! The native encoding is the canonical byte form of a [`Value`]. It is the
//! input to SHA-256 identity composition and doubles as a compact wire
//! format, so it must be round-trip stable: `read(write(v)) == v` for every
//! value, with map entries kept in insertion order and every variant
//! discriminated by a tag byte.
//!
//! The JSON and MessagePack adapters exist for talking to the remote; they
//! follow the remote's conventions (blobs as tagged base64 objects in JSON,
//! raw bin payloads in MessagePack) rather than the native layout.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::errors::{labels, Error, ErrorKind, Result};
use crate::value::{Blob, Value, ValueMap};

// Native encoding tag bytes. The values are part of the format.
const TAG_NIL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INTEGER: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_BLOB: u8 = 5;
const TAG_DATETIME: u8 = 6;
const TAG_LIST: u8 = 7;
const TAG_MAP: u8 = 8;

/// Serializes a value into its canonical native byte form.
pub fn write_natively_encoded_value(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(natively_encoded_size(value));
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Nil => out.push(TAG_NIL),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(*b as u8);
        }
        Value::Integer(i) => {
            out.push(TAG_INTEGER);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Value::Str(s) => {
            out.push(TAG_STRING);
            out.extend_from_slice(&(s.len() as u64).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            out.push(TAG_BLOB);
            out.extend_from_slice(&(b.len() as u64).to_le_bytes());
            out.extend_from_slice(b.as_slice());
        }
        Value::Datetime(t) => {
            out.push(TAG_DATETIME);
            out.extend_from_slice(&t.timestamp_micros().to_le_bytes());
        }
        Value::List(items) => {
            out.push(TAG_LIST);
            out.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                write_value(out, item);
            }
        }
        Value::Map(map) => {
            out.push(TAG_MAP);
            out.extend_from_slice(&(map.len() as u64).to_le_bytes());
            for (key, entry) in map.iter() {
                write_value(out, key);
                write_value(out, entry);
            }
        }
    }
}

/// The exact size of a value's native encoding, without building it.
pub fn natively_encoded_size(value: &Value) -> usize {
    match value {
        Value::Nil => 1,
        Value::Bool(_) => 2,
        Value::Integer(_) | Value::Float(_) => 9,
        Value::Str(s) => 9 + s.len(),
        Value::Blob(b) => 9 + b.len(),
        Value::Datetime(_) => 9,
        Value::List(items) => 9 + items.iter().map(natively_encoded_size).sum::<usize>(),
        Value::Map(map) => {
            9 + map
                .iter()
                .map(|(k, v)| natively_encoded_size(k) + natively_encoded_size(v))
                .sum::<usize>()
        }
    }
}

/// Parses a value from its canonical native byte form.
///
/// Trailing bytes after the value are a parse error.
pub fn read_natively_encoded_value(data: &[u8]) -> Result<Value> {
    let mut reader = Reader { data, offset: 0 };
    let value = read_value(&mut reader)?;
    if reader.offset != reader.data.len() {
        return Err(parse_error("trailing bytes after encoded value"));
    }
    Ok(value)
}

/// The lowercase hex SHA-256 of a value's native encoding.
pub fn natively_encoded_sha256(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(write_natively_encoded_value(value));
    hex::encode(hasher.finalize())
}

fn parse_error(message: &str) -> Error {
    Error::new(ErrorKind::Parse).with_info(labels::INTERNAL_MESSAGE, message)
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.offset < count {
            return Err(parse_error("unexpected end of encoded value"));
        }
        let slice = &self.data[self.offset..self.offset + count];
        self.offset += count;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn read_value(reader: &mut Reader<'_>) -> Result<Value> {
    match reader.u8()? {
        TAG_NIL => Ok(Value::Nil),
        TAG_BOOL => Ok(Value::Bool(reader.u8()? != 0)),
        TAG_INTEGER => Ok(Value::Integer(reader.i64()?)),
        TAG_FLOAT => Ok(Value::Float(f64::from_le_bytes(
            reader.take(8)?.try_into().unwrap(),
        ))),
        TAG_STRING => {
            let len = reader.u64()? as usize;
            let bytes = reader.take(len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| parse_error("string payload is not UTF-8"))?;
            Ok(Value::Str(s.to_owned()))
        }
        TAG_BLOB => {
            let len = reader.u64()? as usize;
            Ok(Value::Blob(Blob::from(reader.take(len)?.to_vec())))
        }
        TAG_DATETIME => {
            let micros = reader.i64()?;
            DateTime::from_timestamp_micros(micros)
                .map(Value::Datetime)
                .ok_or_else(|| parse_error("datetime out of range"))
        }
        TAG_LIST => {
            let count = reader.u64()? as usize;
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(read_value(reader)?);
            }
            Ok(Value::List(items))
        }
        TAG_MAP => {
            let count = reader.u64()? as usize;
            let mut map = ValueMap::new();
            for _ in 0..count {
                let key = read_value(reader)?;
                let value = read_value(reader)?;
                map.insert(key, value);
            }
            Ok(Value::Map(map))
        }
        tag => Err(parse_error(&format!("unknown value tag {tag}"))),
    }
}

// --- JSON adapter ---

const BLOB_TYPE_TAG: &str = "base64-encoded-blob";

/// Converts a value to the remote's JSON representation.
///
/// Blobs become `{"type": "base64-encoded-blob", "blob": "<base64>"}`,
/// datetimes become RFC 3339 strings, and maps become objects when every
/// key is a string (otherwise a list of `{"key", "value"}` pairs).
pub fn value_to_json(value: &Value) -> Result<serde_json::Value> {
    use serde_json::Value as Json;
    Ok(match value {
        Value::Nil => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Integer(i) => Json::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .ok_or_else(|| parse_error("non-finite float has no JSON form"))?,
        Value::Str(s) => Json::String(s.clone()),
        Value::Blob(b) => {
            let mut object = serde_json::Map::new();
            object.insert("type".to_owned(), Json::String(BLOB_TYPE_TAG.to_owned()));
            object.insert(
                "blob".to_owned(),
                Json::String(BASE64.encode(b.as_slice())),
            );
            Json::Object(object)
        }
        Value::Datetime(t) => Json::String(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        Value::List(items) => Json::Array(
            items
                .iter()
                .map(value_to_json)
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Map(map) => {
            if map.iter().all(|(k, _)| matches!(k, Value::Str(_))) {
                let mut object = serde_json::Map::new();
                for (key, entry) in map.iter() {
                    object.insert(key.as_str()?.to_owned(), value_to_json(entry)?);
                }
                Json::Object(object)
            } else {
                let mut pairs = Vec::with_capacity(map.len());
                for (key, entry) in map.iter() {
                    let mut pair = serde_json::Map::new();
                    pair.insert("key".to_owned(), value_to_json(key)?);
                    pair.insert("value".to_owned(), value_to_json(entry)?);
                    pairs.push(Json::Object(pair));
                }
                Json::Array(pairs)
            }
        }
    })
}

/// Converts the remote's JSON representation back to a value.
///
/// Strings that parse as strict RFC 3339 timestamps come back as datetimes,
/// mirroring [`value_to_json`].
pub fn json_to_value(json: &serde_json::Value) -> Result<Value> {
    use serde_json::Value as Json;
    Ok(match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(parse_error("JSON number out of range"));
            }
        }
        Json::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(t) => Value::Datetime(t.with_timezone(&Utc)),
            Err(_) => Value::Str(s.clone()),
        },
        Json::Array(items) => Value::List(
            items
                .iter()
                .map(json_to_value)
                .collect::<Result<Vec<_>>>()?,
        ),
        Json::Object(object) => {
            if object.len() == 2 {
                if let (Some(Json::String(tag)), Some(Json::String(data))) =
                    (object.get("type"), object.get("blob"))
                {
                    if tag == BLOB_TYPE_TAG {
                        let bytes = BASE64
                            .decode(data)
                            .map_err(|_| parse_error("invalid base64 in blob object"))?;
                        return Ok(Value::Blob(Blob::from(bytes)));
                    }
                }
            }
            let mut map = ValueMap::new();
            for (key, entry) in object {
                map.insert(Value::Str(key.clone()), json_to_value(entry)?);
            }
            Value::Map(map)
        }
    })
}

/// Parses a JSON byte payload into a value.
pub fn parse_json_value(data: &[u8]) -> Result<Value> {
    let json: serde_json::Value = serde_json::from_slice(data)
        .map_err(|e| Error::new(ErrorKind::Parse).with_info(labels::INTERNAL_MESSAGE, e))?;
    json_to_value(&json)
}

// --- MessagePack adapter ---

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Nil => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Blob(b) => serializer.serialize_bytes(b.as_slice()),
            Value::Datetime(t) => {
                serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(map) => {
                let mut entries = serializer.serialize_map(Some(map.len()))?;
                for (key, entry) in map.iter() {
                    entries.serialize_entry(key, entry)?;
                }
                entries.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("a dynamic value")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_some<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(Value::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        i64::try_from(v)
            .map(Value::Integer)
            .map_err(|_| E::custom("integer out of range"))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::Str(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::Str(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Value, E> {
        Ok(Value::Blob(Blob::from(v.to_vec())))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<Value, E> {
        Ok(Value::Blob(Blob::from(v)))
    }

    fn visit_seq<A: de::SeqAccess<'de>>(
        self,
        mut seq: A,
    ) -> std::result::Result<Value, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: de::MapAccess<'de>>(
        self,
        mut access: A,
    ) -> std::result::Result<Value, A::Error> {
        let mut map = ValueMap::new();
        while let Some((key, value)) = access.next_entry()? {
            map.insert(key, value);
        }
        Ok(Value::Map(map))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Encodes a value as MessagePack.
pub fn value_to_msgpack(value: &Value) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value)
        .map_err(|e| Error::internal(format!("MessagePack encoding failed: {e}")))
}

/// Decodes a MessagePack payload into a value.
pub fn msgpack_to_value(data: &[u8]) -> Result<Value> {
    rmp_serde::from_slice(data)
        .map_err(|e| Error::new(ErrorKind::Parse).with_info(labels::INTERNAL_MESSAGE, e))
}

// --- LZ4 ---

/// LZ4 block compression and decompression.
///
/// These are thin wrappers that translate library failures into [`Error`]s
/// carrying the library-supplied code.
pub mod lz4 {
    use crate::errors::{labels, Error, ErrorKind, Result};

    /// An upper bound on the compressed size of `original_size` input bytes.
    pub fn max_compressed_size(original_size: usize) -> Result<usize> {
        ::lz4::block::compress_bound(original_size).map_err(|e| lz4_error(&e))
    }

    /// Compresses a block. The original size is not prepended; callers are
    /// expected to track it (the cache stores it alongside the entry).
    pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
        ::lz4::block::compress(data, None, false).map_err(|e| lz4_error(&e))
    }

    /// Decompresses a block produced by [`compress`] back into
    /// `original_size` bytes.
    pub fn decompress(data: &[u8], original_size: usize) -> Result<Vec<u8>> {
        let size = i32::try_from(original_size).map_err(|_| {
            Error::new(ErrorKind::Lz4Error)
                .with_info(labels::INTERNAL_MESSAGE, "original size exceeds block limit")
        })?;
        ::lz4::block::decompress(data, Some(size)).map_err(|e| lz4_error(&e))
    }

    fn lz4_error(error: &std::io::Error) -> Error {
        let err = Error::new(ErrorKind::Lz4Error)
            .with_info(labels::INTERNAL_MESSAGE, error);
        match error.raw_os_error() {
            Some(code) => err.with_info(labels::LZ4_ERROR_CODE, code),
            None => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn composite_value() -> Value {
        let mut map = ValueMap::new();
        map.insert(Value::from("name"), Value::from("gantry"));
        map.insert(Value::from("ratio"), Value::from(0.25f64));
        map.insert(Value::Integer(7), Value::Bool(true));
        Value::List(vec![
            Value::Nil,
            Value::Bool(false),
            Value::Integer(-42),
            Value::Float(1.5),
            Value::from("text"),
            Value::Blob(Blob::from(b"\x00\x01\x02binary".to_vec())),
            Value::Datetime(DateTime::from_timestamp_micros(1_600_000_000_123_000).unwrap()),
            Value::Map(map),
        ])
    }

    #[test]
    fn native_round_trip() {
        let value = composite_value();
        let encoded = write_natively_encoded_value(&value);
        assert_eq!(encoded.len(), natively_encoded_size(&value));
        let decoded = read_natively_encoded_value(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn native_rejects_trailing_and_truncated_input() {
        let mut encoded = write_natively_encoded_value(&Value::from(4i64));
        encoded.push(0);
        assert_eq!(
            read_natively_encoded_value(&encoded).unwrap_err().kind(),
            ErrorKind::Parse
        );

        let encoded = write_natively_encoded_value(&Value::from("hello"));
        assert_eq!(
            read_natively_encoded_value(&encoded[..encoded.len() - 1])
                .unwrap_err()
                .kind(),
            ErrorKind::Parse
        );
    }

    #[test]
    fn sha256_tracks_content() {
        let a = natively_encoded_sha256(&Value::from(4i64));
        let b = natively_encoded_sha256(&Value::from(4i64));
        let c = natively_encoded_sha256(&Value::from(2i64));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn json_round_trip() {
        let value = composite_value();
        let json = value_to_json(&value).unwrap();
        let back = json_to_value(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn json_blob_objects_are_tagged() {
        let json = value_to_json(&Value::Blob(Blob::from(b"payload".to_vec()))).unwrap();
        assert_eq!(json["type"], "base64-encoded-blob");
        assert_eq!(json["blob"], BASE64.encode(b"payload"));
    }

    #[test]
    fn msgpack_round_trip() {
        // Datetimes travel as strings in MessagePack, so test without them.
        let mut map = ValueMap::new();
        map.insert(Value::from("blob"), Value::Blob(Blob::from(b"abc".to_vec())));
        let value = Value::List(vec![
            Value::Nil,
            Value::Integer(99),
            Value::from("str"),
            Value::Map(map),
        ]);
        let encoded = value_to_msgpack(&value).unwrap();
        assert_eq!(msgpack_to_value(&encoded).unwrap(), value);
    }

    #[test]
    fn lz4_round_trip() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = lz4::compress(&data).unwrap();
        assert!(compressed.len() <= lz4::max_compressed_size(data.len()).unwrap());
        let restored = lz4::decompress(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn lz4_reports_corrupt_input() {
        let garbage = vec![0xFFu8; 16];
        let err = lz4::decompress(&garbage, 1 << 20).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lz4Error);
    }
}
