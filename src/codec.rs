//! Type-preserving value envelope.
//!
//! Values cross the store as the JSON text `{"value": <raw>, "type": "<tag>"}`
//! so that a reader can rebuild the exact shape a writer stored. Payloads
//! that do not parse as an envelope (written before the envelope existed, or
//! by another writer) are handed back as their raw text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// A value the cache can store and rebuild exactly.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// Absent value.
    None,
    /// Immutable byte sequence. Must be valid UTF-8 to be stored.
    Bytes(Vec<u8>),
    /// Mutable byte buffer. Must be valid UTF-8 to be stored.
    ByteArray(Vec<u8>),
    /// Ordered fixed-size tuple.
    Tuple(Vec<Value>),
    /// Anything else JSON can carry: numbers, strings, bools, lists, maps.
    Plain(PlainValue),
}

/// A non-null JSON value.
///
/// Null is only ever [`CacheValue::None`], so a plain value always rebuilds
/// to the same variant it was written from.
#[derive(Debug, Clone, PartialEq)]
pub struct PlainValue(Value);

impl PlainValue {
    /// `None` for JSON null.
    pub fn new(value: Value) -> Option<Self> {
        match value {
            Value::Null => None,
            other => Some(Self(other)),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    fn shape_name(&self) -> &'static str {
        match &self.0 {
            Value::Null => "none",
            Value::Bool(_) => "bool",
            Value::Number(n) if n.is_f64() => "float",
            Value::Number(_) => "int",
            Value::String(_) => "str",
            Value::Array(_) => "list",
            Value::Object(_) => "dict",
        }
    }
}

impl CacheValue {
    /// Wrap any serializable value; a value serializing to null becomes
    /// [`CacheValue::None`].
    pub fn plain<T: Serialize>(value: T) -> Result<Self, CodecError> {
        Ok(Self::from(serde_json::to_value(value)?))
    }

    /// Byte payload of this value, if it is bytes or text.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            CacheValue::Bytes(b) | CacheValue::ByteArray(b) => Some(b),
            CacheValue::Plain(PlainValue(Value::String(s))) => Some(s.into_bytes()),
            _ => None,
        }
    }

    fn tag(&self) -> TypeTag {
        match self {
            CacheValue::None => TypeTag::None,
            CacheValue::Bytes(_) => TypeTag::Bytes,
            CacheValue::ByteArray(_) => TypeTag::ByteArray,
            CacheValue::Tuple(_) => TypeTag::Tuple,
            CacheValue::Plain(v) => TypeTag::Plain(v.shape_name().to_string()),
        }
    }
}

impl From<Value> for CacheValue {
    fn from(value: Value) -> Self {
        PlainValue::new(value).map_or(CacheValue::None, CacheValue::Plain)
    }
}

impl From<&str> for CacheValue {
    fn from(s: &str) -> Self {
        CacheValue::Plain(PlainValue(Value::String(s.to_string())))
    }
}

impl From<String> for CacheValue {
    fn from(s: String) -> Self {
        CacheValue::Plain(PlainValue(Value::String(s)))
    }
}

impl From<i64> for CacheValue {
    fn from(n: i64) -> Self {
        CacheValue::Plain(PlainValue(Value::from(n)))
    }
}

/// Fails for NaN and infinities, which JSON cannot carry.
impl TryFrom<f64> for CacheValue {
    type Error = CodecError;

    fn try_from(n: f64) -> Result<Self, CodecError> {
        serde_json::Number::from_f64(n)
            .map(|n| CacheValue::Plain(PlainValue(Value::Number(n))))
            .ok_or(CodecError::NonFiniteFloat(n))
    }
}

impl From<bool> for CacheValue {
    fn from(b: bool) -> Self {
        CacheValue::Plain(PlainValue(Value::Bool(b)))
    }
}

/// Tag stored next to a value describing its original shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TypeTag {
    None,
    Bytes,
    ByteArray,
    Tuple,
    /// Plain value; carries the shape name (`int`, `str`, `dict`, ...), or
    /// whatever another writer put there.
    Plain(String),
}

impl From<String> for TypeTag {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "none" => TypeTag::None,
            "bytes" => TypeTag::Bytes,
            "bytearray" => TypeTag::ByteArray,
            "tuple" => TypeTag::Tuple,
            _ => TypeTag::Plain(tag),
        }
    }
}

impl From<TypeTag> for String {
    fn from(tag: TypeTag) -> Self {
        match tag {
            TypeTag::None => "none".to_string(),
            TypeTag::Bytes => "bytes".to_string(),
            TypeTag::ByteArray => "bytearray".to_string(),
            TypeTag::Tuple => "tuple".to_string(),
            TypeTag::Plain(name) => name,
        }
    }
}

/// A value plus its shape tag, in transport-safe form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueEnvelope {
    #[serde(rename = "value")]
    pub raw_value: Value,
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
}

impl ValueEnvelope {
    /// Serialize to the bytes written to the store.
    pub fn to_payload(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{0} payload is not valid UTF-8 and cannot be stored as text")]
    NotUtf8(&'static str),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Float {0} has no JSON representation")]
    NonFiniteFloat(f64),
}

/// Wrap a value in its envelope.
pub fn encode(value: &CacheValue) -> Result<ValueEnvelope, CodecError> {
    let raw_value = match value {
        CacheValue::None => Value::Null,
        CacheValue::Bytes(b) => Value::String(utf8_text(b, "bytes")?),
        CacheValue::ByteArray(b) => Value::String(utf8_text(b, "bytearray")?),
        CacheValue::Tuple(items) => Value::Array(items.clone()),
        CacheValue::Plain(v) => v.as_value().clone(),
    };

    Ok(ValueEnvelope {
        raw_value,
        type_tag: value.tag(),
    })
}

fn utf8_text(bytes: &[u8], kind: &'static str) -> Result<String, CodecError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::NotUtf8(kind))
}

/// Rebuild a value from its envelope, dispatching on the tag.
///
/// A raw value whose JSON shape contradicts its tag is returned as a plain
/// value.
pub fn decode(envelope: ValueEnvelope) -> CacheValue {
    let ValueEnvelope {
        raw_value,
        type_tag,
    } = envelope;

    match (type_tag, raw_value) {
        (TypeTag::None, _) => CacheValue::None,
        (TypeTag::Tuple, Value::Array(items)) => CacheValue::Tuple(items),
        (TypeTag::Bytes, Value::String(s)) => CacheValue::Bytes(s.into_bytes()),
        (TypeTag::ByteArray, Value::String(s)) => CacheValue::ByteArray(s.into_bytes()),
        (TypeTag::Plain(_), raw) => CacheValue::from(raw),
        (tag, raw) => {
            debug!(?tag, "Envelope value does not match its tag; returning it unchanged");
            CacheValue::from(raw)
        }
    }
}

/// What a stored payload turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredPayload {
    /// A well-formed envelope.
    Envelope(ValueEnvelope),
    /// Anything else; kept as its raw text.
    Foreign(String),
}

impl StoredPayload {
    /// Classify raw store bytes.
    ///
    /// An envelope is a JSON object with a `value` key and a string `type`
    /// key. Everything else is foreign.
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map))
                if map.contains_key("value") && map.get("type").is_some_and(Value::is_string) =>
            {
                match serde_json::from_value::<ValueEnvelope>(Value::Object(map)) {
                    Ok(envelope) => StoredPayload::Envelope(envelope),
                    Err(_) => StoredPayload::Foreign(text.into_owned()),
                }
            }
            _ => StoredPayload::Foreign(text.into_owned()),
        }
    }
}

/// Decode raw store bytes into a value.
pub fn decode_payload(raw: &[u8]) -> CacheValue {
    match StoredPayload::parse(raw) {
        StoredPayload::Envelope(envelope) => decode(envelope),
        StoredPayload::Foreign(text) => {
            debug!("Stored payload is not an envelope; returning raw text");
            CacheValue::from(text)
        }
    }
}
