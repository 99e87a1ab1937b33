//! JSON-RPC 2.0 types for the plugin subprocess protocol.
//!
//! Newline-delimited JSON over the plugin's stdin/stdout, one object per
//! line. Intentionally independent of `km-protocol` so the plugin crate does
//! not pull in the proxy's framing stack.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use km_core::{Direction, Event, RiskLevel};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use km_config::Tier;

/// Handshake magic every well-formed plugin must echo back.
pub const PROTOCOL_MAGIC: &str = "km-plugin/1";

// ---------------------------------------------------------------------------
// JSON-RPC envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Capability buckets a plugin may register into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Filter,
    Security,
    Analytics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResult {
    pub magic: String,
    pub name: String,
    pub version: String,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub required_tier: Tier,
    /// Feature flag the plugin requires, if any.
    #[serde(default)]
    pub feature: Option<String>,
}

// ---------------------------------------------------------------------------
// Message view handed to plugins
// ---------------------------------------------------------------------------

/// The plugin-facing view of a captured event. Payload travels as base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub method: String,
    pub payload: String,
    pub size: usize,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
}

impl PluginMessage {
    pub fn from_event(event: &Event) -> Self {
        let risk = event.risk_or_low();
        Self {
            id: event.id().to_string(),
            timestamp: event.timestamp(),
            direction: event.direction(),
            method: event.method().to_string(),
            payload: BASE64.encode(event.payload_view()),
            size: event.size(),
            risk_score: risk.score,
            risk_level: risk.level,
        }
    }

    pub fn decode_payload(&self) -> Option<Vec<u8>> {
        BASE64.decode(&self.payload).ok()
    }
}

// ---------------------------------------------------------------------------
// Typed RPC results
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AuthenticateResult {
    pub ok: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `filter.apply` result. `message` carries the transformed message when the
/// plugin chose to rewrite it; absent means pass-through.
#[derive(Debug, Deserialize)]
pub struct FilterVerdict {
    #[serde(default)]
    pub message: Option<PluginMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityVerdict {
    pub is_secure: bool,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityReport {
    pub total_analyzed: u64,
    pub issues_found: u64,
    #[serde(default)]
    pub risk_distribution: std::collections::HashMap<String, u64>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_without_null_params() {
        let req = RpcRequest::new(1, "handshake", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("params"));
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
    }

    #[test]
    fn handshake_result_defaults() {
        let result: HandshakeResult = serde_json::from_str(
            r#"{"magic":"km-plugin/1","name":"p","version":"1.0.0","capabilities":["filter","security"]}"#,
        )
        .unwrap();
        assert_eq!(result.required_tier, Tier::Free);
        assert_eq!(
            result.capabilities,
            vec![Capability::Filter, Capability::Security]
        );
        assert!(result.feature.is_none());
    }

    #[test]
    fn plugin_message_round_trips_payload() {
        let event = Event::new(
            "evt_1".into(),
            Direction::Outbound,
            "tools/call",
            br#"{"jsonrpc":"2.0","id":1}"#,
        )
        .unwrap();
        let msg = PluginMessage::from_event(&event);
        assert_eq!(msg.decode_payload().unwrap(), event.payload());
        assert_eq!(msg.size, event.size());
        assert_eq!(msg.risk_level, RiskLevel::Low);
    }
}
