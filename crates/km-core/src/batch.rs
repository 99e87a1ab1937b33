use chrono::{DateTime, Utc};

use crate::event::Event;

/// A sealed, ordered slice of events uploaded atomically to the collector.
///
/// Immutable once sealed; batches of the same session are never re-ordered
/// relative to one another.
#[derive(Debug, Clone)]
pub struct Batch {
    id: u64,
    session_id: String,
    events: Vec<Event>,
    size_bytes: usize,
    sealed_at: DateTime<Utc>,
}

impl Batch {
    pub(crate) fn seal(id: u64, session_id: String, events: Vec<Event>) -> Self {
        let size_bytes = events.iter().map(Event::size).sum();
        Self {
            id,
            session_id,
            events,
            size_bytes,
            sealed_at: Utc::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn sealed_at(&self) -> DateTime<Utc> {
        self.sealed_at
    }
}
