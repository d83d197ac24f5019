//! Value Codec
//!
//! Converts typed application values to the byte payload + flag word
//! stored by memcached, and back.
//!
//! ## Flags
//! ```text
//! ┌──────────┬────────┬──────────────────────────────┐
//! │ Type     │ Flag   │ Payload                      │
//! ├──────────┼────────┼──────────────────────────────┤
//! │ String   │ 0      │ UTF-8 text                   │
//! │ JSON     │ 1 << 1 │ JSON text                    │
//! │ Binary   │ 1 << 2 │ raw bytes                    │
//! │ Number   │ 1 << 3 │ decimal ASCII                │
//! └──────────┴────────┴──────────────────────────────┘
//! ```
//!
//! The flag alone selects the decoder. A string that happens to contain
//! JSON text stays a string.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Plain UTF-8 string
pub const FLAG_STRING: u32 = 0;

/// JSON encoded structure
pub const FLAG_JSON: u32 = 1 << 1;

/// Opaque binary payload
pub const FLAG_BINARY: u32 = 1 << 2;

/// Decimal number
pub const FLAG_NUMERIC: u32 = 1 << 3;

/// A typed cache value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Number(serde_json::Number),
    Json(serde_json::Value),
    Binary(Bytes),
}

impl Value {
    /// Wrap any serializable structure as a JSON value
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
        Ok(Value::Json(serde_json::to_value(value)?))
    }

    /// Deserialize a JSON value into `T`
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Value::Json(v) => Ok(serde_json::from_value(v.clone())?),
            Value::Number(n) => Ok(serde_json::from_value(serde_json::Value::Number(n.clone()))?),
            Value::Str(s) => Ok(serde_json::from_value(serde_json::Value::String(s.clone()))?),
            Value::Binary(_) => Err(Error::Codec(
                "binary value cannot be deserialized".to_string(),
            )),
        }
    }

    /// Flag word stored alongside this value
    pub fn flags(&self) -> u32 {
        match self {
            Value::Str(_) => FLAG_STRING,
            Value::Number(_) => FLAG_NUMERIC,
            Value::Json(_) => FLAG_JSON,
            Value::Binary(_) => FLAG_BINARY,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }
}

// =============================================================================
// Encoding/Decoding
// =============================================================================

/// Encode a value to its payload and flag word
pub fn encode(value: &Value) -> Result<(Bytes, u32)> {
    let payload = match value {
        Value::Str(s) => Bytes::copy_from_slice(s.as_bytes()),
        Value::Number(n) => Bytes::from(n.to_string()),
        Value::Json(v) => Bytes::from(serde_json::to_vec(v)?),
        Value::Binary(b) => b.clone(),
    };
    Ok((payload, value.flags()))
}

/// Decode a payload back to the value type named by `flags`
pub fn decode(payload: Bytes, flags: u32) -> Result<Value> {
    if flags & FLAG_BINARY != 0 {
        return Ok(Value::Binary(payload));
    }

    if flags & FLAG_NUMERIC != 0 {
        let text = std::str::from_utf8(&payload)
            .map_err(|e| Error::Codec(format!("numeric payload is not UTF-8: {}", e)))?;
        let number: serde_json::Number = text
            .trim()
            .parse()
            .map_err(|e| Error::Codec(format!("invalid number '{}': {}", text, e)))?;
        return Ok(Value::Number(number));
    }

    if flags & FLAG_JSON != 0 {
        return Ok(Value::Json(serde_json::from_slice(&payload)?));
    }

    match String::from_utf8(payload.to_vec()) {
        Ok(s) => Ok(Value::Str(s)),
        Err(e) => Err(Error::Codec(format!(
            "string payload (flags {}) is not UTF-8: {}",
            flags, e
        ))),
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
    }
}

/// Non-finite floats have no decimal form and become JSON `null`
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        match serde_json::Number::from_f64(n) {
            Some(n) => Value::Number(n),
            None => Value::Json(serde_json::Value::Null),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Binary(Bytes::from(b))
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Binary(Bytes::copy_from_slice(b))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Binary(b)
    }
}
