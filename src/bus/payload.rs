use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

/// Inbound payload, decoded once per frame.
///
/// Not every topic carries JSON, so anything that fails to parse is kept as
/// text instead of being dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Payload is not JSON: {0:?}")]
    NotJson(String),

    #[error("Unexpected payload shape: {0}")]
    Shape(#[from] serde_json::Error),
}

impl Payload {
    pub fn decode(raw: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(raw) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(String::from_utf8_lossy(raw).into_owned()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Text(_) => None,
        }
    }

    /// Raw text, or the content of a bare JSON string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Json(Value::String(text)) => Some(text),
            Payload::Json(_) => None,
        }
    }

    /// Reads a field of a JSON object payload.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.as_json().and_then(|value| value.get(name))
    }

    /// Deserializes a JSON payload into a typed report.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        match self {
            Payload::Json(value) => Ok(T::deserialize(value)?),
            Payload::Text(text) => Err(PayloadError::NotJson(text.clone())),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Payload::Json(value) => write!(f, "{}", value),
            Payload::Text(text) => write!(f, "{}", text),
        }
    }
}

/// Serializes an outbound payload to its wire text.
///
/// Everything goes out as JSON except a JSON string, which is sent as-is.
pub fn to_wire(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
