//! # Shipyard Events
//!
//! Durable history for shipyard: every run transition, approval decision and
//! release is appended to an event log and replayed into a read model.
//!
//! ## Architecture
//!
//! - `types`: event envelopes and the run, approval and release events
//! - `event_store`: the append-only [`EventStore`] contract, an in-memory store
//!   and a JSON-lines file store
//! - `history`: the [`History`] read model
//!
//! ## Example
//!
//! ```rust,ignore
//! use shipyard_events::{FileEventStore, History};
//!
//! let store = FileEventStore::in_dir(".shipyard");
//! let history = History::load(&store).await?;
//! for run in history.runs() {
//!     println!("{} {:?}", run.run_id, run.outcome);
//! }
//! ```

#![warn(missing_docs)]
#![warn(unused)]

pub mod event_store;
pub mod history;
pub mod types;

pub use event_store::{EventStore, EventStoreError, FileEventStore, InMemoryEventStore};
pub use history::History;
pub use types::{AnyEvent, ApprovalEvent, EventEnvelope, EventMetadata, ReleaseEvent, RunEvent};

/// Event errors
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct EventsError(#[from] EventsErrorKind);

/// Specific error kinds
#[derive(Debug, thiserror::Error)]
pub enum EventsErrorKind {
    /// The store failed
    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// An event could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<EventStoreError> for EventsError {
    fn from(e: EventStoreError) -> Self {
        Self(e.into())
    }
}

impl From<serde_json::Error> for EventsError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.into())
    }
}

/// Result type for events operations
pub type EventsResult<T = ()> = Result<T, EventsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_message() {
        let err = EventsError::from(EventStoreError::Corrupt {
            path: "events.jsonl".to_string(),
            line: 3,
            reason: "expected value".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "event store error: corrupt event at events.jsonl:3: expected value"
        );
    }
}
