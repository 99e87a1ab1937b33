//! Core domain model for the kilometers monitor: ids, events, sessions and
//! sealed batches.

pub mod batch;
pub mod event;
pub mod id;
pub mod session;

pub use batch::Batch;
pub use event::{Direction, Event, EventError, RiskLevel, RiskScore};
pub use session::{Session, SessionError, SessionState};
