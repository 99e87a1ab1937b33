use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Direction of a captured message, relative to the child process.
///
/// `Inbound` = host -> child, `Outbound` = child -> host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

/// Risk bucket derived from a 0-100 score: Low < 35 <= Medium < 75 <= High.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=34 => RiskLevel::Low,
            35..=74 => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }

    /// Canonical score for a level, used when reducing sub-scores.
    pub fn score(&self) -> u8 {
        match self {
            RiskLevel::Low => 10,
            RiskLevel::Medium => 35,
            RiskLevel::High => 75,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskScore {
    pub score: u8,
    pub level: RiskLevel,
}

impl RiskScore {
    pub fn new(score: u8) -> Self {
        let score = score.min(100);
        Self {
            score,
            level: RiskLevel::from_score(score),
        }
    }

    pub fn from_level(level: RiskLevel) -> Self {
        Self {
            score: level.score(),
            level,
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event payload must not be empty")]
    EmptyPayload,
}

/// One captured JSON-RPC message.
///
/// Immutable after construction; the only write allowed is the one-shot
/// [`Event::update_risk_score`] performed by the filter chain before any
/// plugin observes the event. The payload is copied in and only handed out
/// as fresh copies so the wire buffer can be reused.
#[derive(Debug)]
pub struct Event {
    id: String,
    timestamp: DateTime<Utc>,
    direction: Direction,
    method: String,
    payload: Vec<u8>,
    risk: OnceLock<RiskScore>,
}

impl Event {
    pub fn new(
        id: String,
        direction: Direction,
        method: impl Into<String>,
        payload: &[u8],
    ) -> Result<Self, EventError> {
        if payload.is_empty() {
            return Err(EventError::EmptyPayload);
        }
        Ok(Self {
            id,
            timestamp: Utc::now(),
            direction,
            method: method.into(),
            payload: payload.to_vec(),
            risk: OnceLock::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Method name; empty for pure responses.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// A defensive copy of the payload bytes.
    pub fn payload(&self) -> Vec<u8> {
        self.payload.clone()
    }

    /// Borrow the payload for read-only inspection on the hot path.
    pub fn payload_view(&self) -> &[u8] {
        &self.payload
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// The risk score, if one has been assigned.
    pub fn risk(&self) -> Option<RiskScore> {
        self.risk.get().copied()
    }

    /// Risk score falling back to Low when scoring never ran.
    pub fn risk_or_low(&self) -> RiskScore {
        self.risk
            .get()
            .copied()
            .unwrap_or_else(|| RiskScore::from_level(RiskLevel::Low))
    }

    /// One-shot risk assignment. A second call is ignored.
    pub fn update_risk_score(&self, score: RiskScore) {
        if self.risk.set(score).is_err() {
            tracing::debug!(event = %self.id, "risk score already set, ignoring update");
        }
    }
}

impl Clone for Event {
    fn clone(&self) -> Self {
        let risk = OnceLock::new();
        if let Some(score) = self.risk.get() {
            let _ = risk.set(*score);
        }
        Self {
            id: self.id.clone(),
            timestamp: self.timestamp,
            direction: self.direction,
            method: self.method.clone(),
            payload: self.payload.clone(),
            risk,
        }
    }
}
