//! Run listeners.
//!
//! The scheduler reports every change to its run record as a [`RunEvent`].
//! Listeners log them, persist them or keep them for inspection.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info, warn};

use shipyard_core::{JobStatus, RunId};
use shipyard_events::{EventEnvelope, EventStore, RunEvent};

/// Observer of run progress
#[async_trait]
pub trait RunListener: Send + Sync {
    /// Called for every run event, in order
    async fn on_event(&self, event: &RunEvent);
}

/// Composite listener that forwards to multiple listeners
#[derive(Default)]
pub struct CompositeRunListener {
    listeners: Vec<Arc<dyn RunListener>>,
}

impl CompositeRunListener {
    /// Creates an empty composite
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener
    #[must_use]
    pub fn add<L: RunListener + 'static>(self, listener: L) -> Self {
        self.add_shared(Arc::new(listener))
    }

    /// Adds a shared listener
    #[must_use]
    pub fn add_shared(mut self, listener: Arc<dyn RunListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

#[async_trait]
impl RunListener for CompositeRunListener {
    async fn on_event(&self, event: &RunEvent) {
        for listener in &self.listeners {
            listener.on_event(event).await;
        }
    }
}

/// Logs run progress through `tracing`
#[derive(Debug, Default)]
pub struct TracingRunListener;

#[async_trait]
impl RunListener for TracingRunListener {
    async fn on_event(&self, event: &RunEvent) {
        match event {
            RunEvent::Started { record } => {
                info!(run_id = %record.run_id, pipeline = %record.pipeline, commit = %record.commit(), jobs = record.jobs.len(), "run started");
            }
            RunEvent::JobTransitioned { run_id, job } => match &job.failure {
                Some(failure) if job.status.is_terminal() => {
                    warn!(run_id = %run_id, job = %job.name, status = %job.status, reason = %failure.message, "job finished");
                }
                _ => info!(run_id = %run_id, job = %job.name, status = %job.status, "job transitioned"),
            },
            RunEvent::Finished { run_id, outcome, .. } => {
                info!(run_id = %run_id, outcome = ?outcome, "run finished");
            }
        }
    }
}

/// Appends run events to an event store
#[derive(Debug)]
pub struct HistoryRecorder {
    store: Arc<dyn EventStore>,
}

impl HistoryRecorder {
    /// Records to `store`
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RunListener for HistoryRecorder {
    async fn on_event(&self, event: &RunEvent) {
        let envelope = EventEnvelope::record(event.clone(), "scheduler");
        if let Err(e) = self.store.append(&[envelope]).await {
            error!(run_id = %event.run_id(), event = event.event_type(), error = %e, "failed to record run event");
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default, Clone)]
pub struct BufferRunListener {
    events: Arc<Mutex<Vec<RunEvent>>>,
}

impl BufferRunListener {
    /// Creates an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far
    #[must_use]
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    /// Run of the first `Started` event
    #[must_use]
    pub fn run_id(&self) -> Option<RunId> {
        self.events.lock().iter().find_map(|e| match e {
            RunEvent::Started { record } => Some(record.run_id),
            _ => None,
        })
    }

    /// Statuses `job` went through, in order
    #[must_use]
    pub fn statuses(&self, job: &str) -> Vec<JobStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RunEvent::JobTransitioned { job: record, .. } if record.name == job => Some(record.status),
                _ => None,
            })
            .collect()
    }

    /// Latest status of `job`
    #[must_use]
    pub fn status_of(&self, job: &str) -> Option<JobStatus> {
        self.statuses(job).last().copied()
    }
}

#[async_trait]
impl RunListener for BufferRunListener {
    async fn on_event(&self, event: &RunEvent) {
        self.events.lock().push(event.clone());
    }
}
