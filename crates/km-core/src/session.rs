use chrono::{DateTime, Utc};

use crate::batch::Batch;
use crate::event::Event;
use crate::id::{self, Prefix};

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Session lifecycle. Transitions are one-way:
/// Pending -> Active -> {Completed, Failed, Cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Pending => write!(f, "pending"),
            SessionState::Active => write!(f, "active"),
            SessionState::Completed => write!(f, "completed"),
            SessionState::Failed => write!(f, "failed"),
            SessionState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("events may only be recorded while the session is active (state: {0})")]
    NotActive(SessionState),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Aggregate for one monitor run.
///
/// Holds only the open batch plus counters; sealed batches are handed off to
/// the uploader and never retained here, keeping memory bounded for long
/// runs. The batched set is always a strict prefix of the events recorded.
#[derive(Debug)]
pub struct Session {
    id: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    state: SessionState,
    open_batch: Vec<Event>,
    next_batch_id: u64,
    event_seq: u64,
    total_events: u64,
    batched_events: u64,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: id::create(Prefix::Session, None),
            started_at: Utc::now(),
            ended_at: None,
            state: SessionState::Pending,
            open_batch: Vec::new(),
            next_batch_id: 1,
            event_seq: 0,
            total_events: 0,
            batched_events: 0,
        }
    }

    // -- Accessors ----------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn total_events(&self) -> u64 {
        self.total_events
    }

    /// Count of event ids ever allocated, including events that were later
    /// filtered out.
    pub fn events_allocated(&self) -> u64 {
        self.event_seq
    }

    pub fn batched_events(&self) -> u64 {
        self.batched_events
    }

    pub fn open_batch_len(&self) -> usize {
        self.open_batch.len()
    }

    // -- Event ids ----------------------------------------------------------

    /// Allocate a process-unique event id for a message captured in this
    /// session.
    pub fn next_event_id(&mut self) -> String {
        self.event_seq += 1;
        id::create(Prefix::Event, None)
    }

    // -- Transitions --------------------------------------------------------

    pub fn activate(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Active)
    }

    pub fn complete(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Completed)
    }

    pub fn fail(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Failed)
    }

    pub fn cancel(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Cancelled)
    }

    fn transition(&mut self, to: SessionState) -> Result<(), SessionError> {
        let valid = matches!(
            (self.state, to),
            (SessionState::Pending, SessionState::Active)
                | (SessionState::Active, SessionState::Completed)
                | (SessionState::Active, SessionState::Failed)
                | (SessionState::Active, SessionState::Cancelled)
                | (SessionState::Pending, SessionState::Cancelled)
        );
        if !valid {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        if matches!(
            to,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        ) {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    // -- Batching -----------------------------------------------------------

    /// Append an event to the open batch. Only legal while Active.
    pub fn record(&mut self, event: Event) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::NotActive(self.state));
        }
        self.open_batch.push(event);
        self.total_events += 1;
        Ok(())
    }

    /// Seal the open batch, if non-empty, assigning the next batch id.
    pub fn seal_open_batch(&mut self) -> Option<Batch> {
        if self.open_batch.is_empty() {
            return None;
        }
        let events = std::mem::take(&mut self.open_batch);
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        self.batched_events += events.len() as u64;
        Some(Batch::seal(id, self.id.clone(), events))
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
