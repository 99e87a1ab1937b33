//! Session aggregator: collects captured events and seals batches when the
//! size or time threshold is met.
//!
//! Time-based flushing is driven by the caller; there is no internal timer.
//! Both proxy pumps call [`SessionAggregator::add_event`] concurrently, so
//! all state sits behind one mutex.

use std::time::{Duration, Instant};

use km_core::{Batch, Event, Session, SessionError, SessionState};
use parking_lot::Mutex;

struct AggState {
    session: Session,
    last_flush: Instant,
}

/// Snapshot of the session counters, taken under the lock.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: SessionState,
    pub total_events: u64,
    pub batched_events: u64,
    pub open_batch_len: usize,
}

pub struct SessionAggregator {
    state: Mutex<AggState>,
    batch_size: usize,
    /// `None` disables time-based flushing.
    flush_interval: Option<Duration>,
}

impl SessionAggregator {
    pub fn new(batch_size: usize, flush_interval: Option<Duration>) -> Self {
        let mut session = Session::new();
        // A freshly constructed aggregator is immediately usable.
        session
            .activate()
            .expect("new session must transition Pending -> Active");
        Self {
            state: Mutex::new(AggState {
                session,
                last_flush: Instant::now(),
            }),
            batch_size: batch_size.max(1),
            flush_interval,
        }
    }

    pub fn session_id(&self) -> String {
        self.state.lock().session.id().to_string()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            session_id: state.session.id().to_string(),
            state: state.session.state(),
            total_events: state.session.total_events(),
            batched_events: state.session.batched_events(),
            open_batch_len: state.session.open_batch_len(),
        }
    }

    /// Allocate an event id from the owning session.
    pub fn next_event_id(&self) -> String {
        self.state.lock().session.next_event_id()
    }

    /// Record an event; returns the sealed batch when a threshold tripped.
    pub fn add_event(&self, event: Event) -> Result<Option<Batch>, SessionError> {
        let mut state = self.state.lock();
        state.session.record(event)?;

        let size_tripped = state.session.open_batch_len() >= self.batch_size;
        let time_tripped = self
            .flush_interval
            .map(|interval| state.last_flush.elapsed() >= interval)
            .unwrap_or(false);

        if size_tripped || time_tripped {
            state.last_flush = Instant::now();
            return Ok(state.session.seal_open_batch());
        }
        Ok(None)
    }

    /// Seal the open batch unconditionally. Only legal while Active.
    pub fn force_flush(&self) -> Result<Option<Batch>, SessionError> {
        let mut state = self.state.lock();
        if state.session.state() != SessionState::Active {
            return Err(SessionError::NotActive(state.session.state()));
        }
        state.last_flush = Instant::now();
        Ok(state.session.seal_open_batch())
    }

    /// Complete the session, returning any remaining open batch.
    pub fn end(&self) -> Result<Option<Batch>, SessionError> {
        let mut state = self.state.lock();
        if state.session.state() != SessionState::Active {
            return Err(SessionError::NotActive(state.session.state()));
        }
        let batch = state.session.seal_open_batch();
        state.session.complete()?;
        Ok(batch)
    }

    /// Mark the session failed (e.g. the child died mid-run). Any open batch
    /// is still sealed and returned for a best-effort upload.
    pub fn fail(&self) -> Result<Option<Batch>, SessionError> {
        let mut state = self.state.lock();
        if state.session.state() != SessionState::Active {
            return Err(SessionError::NotActive(state.session.state()));
        }
        let batch = state.session.seal_open_batch();
        state.session.fail()?;
        Ok(batch)
    }
}
