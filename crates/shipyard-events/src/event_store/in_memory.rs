//! In-memory event store for tests and dry runs.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use super::EventStore;
use crate::EventsResult;
use crate::types::EventEnvelope;

/// In-memory event store for development and testing
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<Vec<EventEnvelope>>,
    by_run: DashMap<Uuid, Vec<usize>>,
}

impl InMemoryEventStore {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    /// Returns true if nothing was appended yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.read().is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: &[EventEnvelope]) -> EventsResult {
        let mut log = self.log.write();
        for envelope in events {
            if let Some(id) = envelope.event.aggregate_id() {
                self.by_run.entry(id).or_default().push(log.len());
            }
            log.push(envelope.clone());
        }
        Ok(())
    }

    async fn events(&self) -> EventsResult<Vec<EventEnvelope>> {
        Ok(self.log.read().clone())
    }

    async fn events_for(&self, aggregate_id: &Uuid) -> EventsResult<Vec<EventEnvelope>> {
        let log = self.log.read();
        Ok(self
            .by_run
            .get(aggregate_id)
            .map(|indices| indices.iter().map(|&i| log[i].clone()).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ApprovalEvent, EventEnvelope, ReleaseEvent};
    use shipyard_core::{Release, Version};

    fn granted(run_id: Uuid, identity: &str) -> EventEnvelope {
        EventEnvelope::record(
            ApprovalEvent::Granted {
                run_id,
                job: "deploy".to_string(),
                identity: identity.to_string(),
            },
            "test",
        )
    }

    #[tokio::test]
    async fn test_append_and_read_in_order() {
        let store = InMemoryEventStore::new();
        let run = Uuid::new_v4();
        store.append(&[granted(run, "alice")]).await.unwrap();
        store.append(&[granted(run, "bob")]).await.unwrap();

        let events = store.events_for(&run).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1].event,
            crate::AnyEvent::Approval(ApprovalEvent::Granted { identity, .. }) if identity == "bob"
        ));
    }

    #[tokio::test]
    async fn test_get_empty() {
        let store = InMemoryEventStore::new();
        assert!(store.events_for(&Uuid::new_v4()).await.unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_list_aggregates_skips_releases() {
        let store = InMemoryEventStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let release = EventEnvelope::record(
            ReleaseEvent::Created {
                release: Release::new(Version::new(0, 1, 0), "abc", ""),
            },
            "test",
        );
        store
            .append(&[granted(a, "alice"), release, granted(b, "bob"), granted(a, "carol")])
            .await
            .unwrap();

        assert_eq!(store.list_aggregates().await.unwrap(), vec![a, b]);
        assert_eq!(store.len(), 4);
    }
}
