//! Serde shapes for the collector wire protocol and the staging store.
//!
//! Kept in one module so a future revision of the collector format only
//! touches this file.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use km_core::{Batch, Direction, Event, RiskLevel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskWire {
    pub score: u8,
    pub level: RiskLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventWire {
    pub id: String,
    /// RFC3339 with nanosecond precision.
    #[serde(
        serialize_with = "serialize_rfc3339_nanos",
        deserialize_with = "deserialize_rfc3339"
    )]
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub method: String,
    /// Base64 of the original payload bytes.
    pub payload: String,
    pub size: usize,
    pub risk: RiskWire,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchUpload {
    pub session_id: String,
    pub batch_id: u64,
    pub events: Vec<EventWire>,
}

impl EventWire {
    pub fn from_event(event: &Event) -> Self {
        let risk = event.risk_or_low();
        Self {
            id: event.id().to_string(),
            timestamp: event.timestamp(),
            direction: event.direction(),
            method: event.method().to_string(),
            payload: BASE64.encode(event.payload_view()),
            size: event.size(),
            risk: RiskWire {
                score: risk.score,
                level: risk.level,
            },
        }
    }
}

impl BatchUpload {
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            session_id: batch.session_id().to_string(),
            batch_id: batch.id(),
            events: batch.events().iter().map(EventWire::from_event).collect(),
        }
    }
}

fn serialize_rfc3339_nanos<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

fn deserialize_rfc3339<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(serde::de::Error::custom)
}
