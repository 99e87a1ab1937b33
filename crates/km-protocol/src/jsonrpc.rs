//! JSON-RPC 2.0 envelope classification.
//!
//! Intentionally independent of any transport; callers hand in one wire line
//! and get back a discriminated envelope. Invalid JSON is reported as an
//! error but must never stop a caller from forwarding the raw bytes.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON on the wire: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("unsupported jsonrpc version: {0:?}")]
    UnsupportedVersion(Option<String>),

    #[error("message has none of method/result/error with a usable id")]
    Unclassifiable,

    #[error("line of {len} bytes exceeds the {limit} byte frame limit")]
    LineTooLong { len: usize, limit: usize },
}

/// Raw decode target; every field optional so classification can inspect
/// what is actually present.
#[derive(Debug, Deserialize)]
struct RawMessage {
    jsonrpc: Option<String>,
    method: Option<String>,
    id: Option<Value>,
    // `result: null` is a legal success response; keep the presence of the
    // key distinguishable from its absence.
    #[serde(default, deserialize_with = "some_even_if_null")]
    result: Option<Value>,
    error: Option<RawError>,
}

fn some_even_if_null<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
struct RawError {
    code: Option<i64>,
    message: Option<String>,
}

/// Discriminated JSON-RPC 2.0 message envelope.
///
/// The `id` is preserved verbatim as raw JSON since the protocol allows
/// strings, numbers and null.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcEnvelope {
    Request { method: String, id: Value },
    Notification { method: String },
    Response { id: Value },
    Error { id: Value, code: i64, message: String },
}

impl JsonRpcEnvelope {
    /// Classify one wire line per the JSON-RPC 2.0 rules.
    ///
    /// method + id => Request; method without id => Notification;
    /// result/error with id => Response/Error; anything else is a frame
    /// error against this line only.
    pub fn classify(bytes: &[u8]) -> Result<Self, FrameError> {
        let raw: RawMessage = serde_json::from_slice(bytes)?;

        if raw.jsonrpc.as_deref() != Some("2.0") {
            return Err(FrameError::UnsupportedVersion(raw.jsonrpc));
        }

        if let Some(method) = raw.method {
            return Ok(match raw.id {
                Some(id) => JsonRpcEnvelope::Request { method, id },
                None => JsonRpcEnvelope::Notification { method },
            });
        }

        if let Some(error) = raw.error {
            if let Some(id) = raw.id {
                return Ok(JsonRpcEnvelope::Error {
                    id,
                    code: error.code.unwrap_or(0),
                    message: error.message.unwrap_or_default(),
                });
            }
        } else if raw.result.is_some() {
            if let Some(id) = raw.id {
                return Ok(JsonRpcEnvelope::Response { id });
            }
        }

        Err(FrameError::Unclassifiable)
    }

    /// Method name; empty for responses and errors.
    pub fn method(&self) -> &str {
        match self {
            JsonRpcEnvelope::Request { method, .. } => method,
            JsonRpcEnvelope::Notification { method } => method,
            JsonRpcEnvelope::Response { .. } | JsonRpcEnvelope::Error { .. } => "",
        }
    }

    pub fn id(&self) -> Option<&Value> {
        match self {
            JsonRpcEnvelope::Request { id, .. } => Some(id),
            JsonRpcEnvelope::Response { id } => Some(id),
            JsonRpcEnvelope::Error { id, .. } => Some(id),
            JsonRpcEnvelope::Notification { .. } => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcEnvelope::Request { .. })
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcEnvelope::Notification { .. })
    }
}
