//! Event store module.
//!
//! An [`EventStore`] is an append-only log of [`EventEnvelope`]s. Reads return
//! events in append order, which is the order [`History`](crate::History)
//! replays them in.

pub mod file;
pub mod in_memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::EventsResult;
use crate::types::EventEnvelope;

pub use file::FileEventStore;
pub use in_memory::InMemoryEventStore;

/// Event store trait
#[async_trait]
pub trait EventStore: Send + Sync + std::fmt::Debug {
    /// Appends events durably, in order
    async fn append(&self, events: &[EventEnvelope]) -> EventsResult;

    /// Every event, in append order
    async fn events(&self) -> EventsResult<Vec<EventEnvelope>>;

    /// Events of one run, in append order
    async fn events_for(&self, aggregate_id: &Uuid) -> EventsResult<Vec<EventEnvelope>> {
        Ok(self
            .events()
            .await?
            .into_iter()
            .filter(|e| e.event.aggregate_id().as_ref() == Some(aggregate_id))
            .collect())
    }

    /// Every run with at least one event
    async fn list_aggregates(&self) -> EventsResult<Vec<Uuid>> {
        let mut ids = Vec::new();
        for envelope in self.events().await? {
            if let Some(id) = envelope.event.aggregate_id()
                && !ids.contains(&id)
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

/// Event store errors
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// Reading or writing the backing file failed
    #[error("storage error at {path}: {reason}")]
    Storage {
        /// Backing file
        path: String,
        /// Underlying error
        reason: String,
    },

    /// A line of the log could not be decoded
    #[error("corrupt event at {path}:{line}: {reason}")]
    Corrupt {
        /// Backing file
        path: String,
        /// 1-based line number
        line: usize,
        /// Decoder error
        reason: String,
    },
}
