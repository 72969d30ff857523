//! Document values and their CBOR wire form.
//!
//! The storage layer does not interpret documents; it stores an untyped map
//! of string keys to [`Value`]s and hands the same map back. On disk a
//! document is canonical CBOR; `DateTime` round-trips as tag 1 with an
//! epoch-seconds integer.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use ciborium::value::{Integer, Value as Cbor};

use crate::error::{FolioError, Result};

/// A document is an ordered map of field name to value.
pub type Document = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    Array(Vec<Value>),
    Map(Document),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Document> {
        match self {
            Value::Map(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{:?}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Array(v) => write!(f, "[{} items]", v.len()),
            Value::Map(v) => write!(f, "{{{} fields}}", v.len()),
        }
    }
}

/// CBOR tag for an epoch-based date/time (RFC 8949 §3.4.2).
const TAG_EPOCH_DATETIME: u64 = 1;

fn to_cbor(value: &Value) -> Cbor {
    match value {
        Value::Null => Cbor::Null,
        Value::Bool(v) => Cbor::Bool(*v),
        Value::Int(v) => Cbor::Integer(Integer::from(*v)),
        Value::Float(v) => Cbor::Float(*v),
        Value::String(v) => Cbor::Text(v.clone()),
        Value::Bytes(v) => Cbor::Bytes(v.clone()),
        Value::DateTime(v) => Cbor::Tag(
            TAG_EPOCH_DATETIME,
            Box::new(Cbor::Integer(Integer::from(v.timestamp()))),
        ),
        Value::Array(items) => Cbor::Array(items.iter().map(to_cbor).collect()),
        Value::Map(map) => Cbor::Map(
            map.iter()
                .map(|(k, v)| (Cbor::Text(k.clone()), to_cbor(v)))
                .collect(),
        ),
    }
}

fn from_cbor(cbor: Cbor) -> Result<Value> {
    Ok(match cbor {
        Cbor::Null => Value::Null,
        Cbor::Bool(v) => Value::Bool(v),
        Cbor::Integer(v) => Value::Int(
            i64::try_from(v)
                .map_err(|_| FolioError::Corrupted("CBOR integer out of i64 range".into()))?,
        ),
        Cbor::Float(v) => Value::Float(v),
        Cbor::Text(v) => Value::String(v),
        Cbor::Bytes(v) => Value::Bytes(v),
        Cbor::Tag(TAG_EPOCH_DATETIME, inner) => match *inner {
            Cbor::Integer(secs) => {
                let secs = i64::try_from(secs)
                    .map_err(|_| FolioError::Corrupted("CBOR datetime out of range".into()))?;
                let dt = Utc
                    .timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| FolioError::Corrupted("CBOR datetime out of range".into()))?;
                Value::DateTime(dt)
            }
            other => {
                return Err(FolioError::Corrupted(format!(
                    "CBOR tag 1 expects an integer, got {:?}",
                    other
                )))
            }
        },
        Cbor::Tag(tag, _) => {
            return Err(FolioError::Corrupted(format!("unsupported CBOR tag {}", tag)))
        }
        Cbor::Array(items) => Value::Array(
            items
                .into_iter()
                .map(from_cbor)
                .collect::<Result<Vec<_>>>()?,
        ),
        Cbor::Map(entries) => {
            let mut map = Document::new();
            for (k, v) in entries {
                let key = match k {
                    Cbor::Text(s) => s,
                    other => {
                        return Err(FolioError::Corrupted(format!(
                            "CBOR map key must be text, got {:?}",
                            other
                        )))
                    }
                };
                map.insert(key, from_cbor(v)?);
            }
            Value::Map(map)
        }
        other => {
            return Err(FolioError::Corrupted(format!(
                "unsupported CBOR item {:?}",
                other
            )))
        }
    })
}

/// Serialize a document to CBOR bytes.
pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    let cbor = to_cbor(&Value::Map(doc.clone()));
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&cbor, &mut buf)
        .map_err(|e| FolioError::Corrupted(format!("CBOR encode failed: {}", e)))?;
    Ok(buf)
}

/// Deserialize a document from CBOR bytes.
pub fn decode_document(bytes: &[u8]) -> Result<Document> {
    let cbor: Cbor = ciborium::de::from_reader(bytes)
        .map_err(|e| FolioError::Corrupted(format!("CBOR decode failed: {}", e)))?;
    match from_cbor(cbor)? {
        Value::Map(map) => Ok(map),
        other => Err(FolioError::Corrupted(format!(
            "document root must be a map, got {}",
            other
        ))),
    }
}
