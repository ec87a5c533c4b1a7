//! Binary-safe payload encoding for credential records.
//!
//! Key material mixes structured fields with raw byte buffers. `Payload`
//! keeps bytes as a first-class leaf and encodes them as a tagged envelope
//! so that the whole tree survives JSON text storage unchanged:
//!
//! ```json
//! {"noiseKey": {"private": {"$bytes": "q83v"}, "public": {"$bytes": "AQID"}}}
//! ```
//!
//! A single-key object whose key is `$bytes` and whose value is valid
//! standard base64 is always read back as bytes.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Envelope key marking a base64-encoded byte buffer.
pub const BYTES_TAG: &str = "$bytes";

/// Structured credential payload with embedded binary buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Payload {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Payload>),
    Object(BTreeMap<String, Payload>),
}

impl Payload {
    /// Wrap a byte buffer.
    #[must_use]
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(data.into())
    }

    /// Build an object from key/value pairs.
    #[must_use]
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Self)>,
    {
        Self::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Look up a field of an object payload.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Object(fields) => fields.get(key),
            _ => None,
        }
    }

    /// Borrow the buffer of a `Bytes` payload.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(data) => Some(data),
            _ => None,
        }
    }

    /// Borrow the text of a `String` payload.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Encode to JSON text.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from JSON text produced by [`Payload::encode`].
    ///
    /// # Errors
    /// Returns error if the text is not valid JSON.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

fn unwrap_envelope(fields: &Map<String, Value>) -> Option<Vec<u8>> {
    if fields.len() != 1 {
        return None;
    }
    let Value::String(encoded) = fields.get(BYTES_TAG)? else {
        return None;
    };
    BASE64.decode(encoded).ok()
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(fields) => match unwrap_envelope(&fields) {
                Some(data) => Self::Bytes(data),
                None => Self::Object(
                    fields
                        .into_iter()
                        .map(|(k, v)| (k, Self::from(v)))
                        .collect(),
                ),
            },
        }
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Null => Self::Null,
            Payload::Bool(b) => Self::Bool(b),
            Payload::Number(n) => Self::Number(n),
            Payload::String(s) => Self::String(s),
            Payload::Bytes(data) => {
                let mut envelope = Map::with_capacity(1);
                envelope.insert(BYTES_TAG.to_owned(), Self::String(BASE64.encode(data)));
                Self::Object(envelope)
            }
            Payload::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Payload::Object(fields) => Self::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<u64> for Payload {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}
