//! Event types for the shipyard history.
//!
//! Everything that must survive a restart is written as an event: run
//! progress, approval decisions and releases. Events carry full record
//! snapshots where that keeps replay trivial.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shipyard_core::{ApprovalRequest, JobRecord, PipelineOutcome, Release, RunId, RunRecord};

/// Event metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event id
    pub event_id: Uuid,
    /// Time the event was recorded
    pub timestamp: DateTime<Utc>,
    /// Run the event belongs to, if any
    pub correlation_id: Option<Uuid>,
    /// Event that caused this one, if any
    pub causation_id: Option<Uuid>,
    /// Process that recorded it, e.g. `scheduler` or `cli`
    pub source: String,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new("shipyard")
    }
}

impl EventMetadata {
    /// Fresh metadata stamped now
    #[must_use]
    pub fn new(source: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            source: source.to_string(),
        }
    }

    /// Sets the correlation id
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the causation id
    #[must_use]
    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }
}

/// All events enum for generic handling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event", rename_all = "camelCase")]
pub enum AnyEvent {
    /// Run progress
    Run(RunEvent),
    /// Approval decisions
    Approval(ApprovalEvent),
    /// Releases
    Release(ReleaseEvent),
}

impl AnyEvent {
    /// Event type name
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Run(e) => e.event_type(),
            Self::Approval(e) => e.event_type(),
            Self::Release(e) => e.event_type(),
        }
    }

    /// Run the event belongs to; releases belong to none
    #[must_use]
    pub fn aggregate_id(&self) -> Option<RunId> {
        match self {
            Self::Run(e) => Some(e.run_id()),
            Self::Approval(e) => Some(e.run_id()),
            Self::Release(_) => None,
        }
    }
}

impl From<RunEvent> for AnyEvent {
    fn from(event: RunEvent) -> Self {
        Self::Run(event)
    }
}

impl From<ApprovalEvent> for AnyEvent {
    fn from(event: ApprovalEvent) -> Self {
        Self::Approval(event)
    }
}

impl From<ReleaseEvent> for AnyEvent {
    fn from(event: ReleaseEvent) -> Self {
        Self::Release(event)
    }
}

/// Base event envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// The event
    pub event: AnyEvent,
    /// Its metadata
    pub metadata: EventMetadata,
}

impl EventEnvelope {
    /// Wraps an event
    #[must_use]
    pub fn new(event: AnyEvent, metadata: EventMetadata) -> Self {
        Self { event, metadata }
    }

    /// Wraps an event with fresh metadata correlated to its run
    pub fn record(event: impl Into<AnyEvent>, source: &str) -> Self {
        let event = event.into();
        let mut metadata = EventMetadata::new(source);
        if let Some(id) = event.aggregate_id() {
            metadata = metadata.with_correlation(id);
        }
        Self { event, metadata }
    }
}

/// Run events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunEvent {
    /// A run started; every job is pending
    Started {
        /// Initial record
        record: RunRecord,
    },
    /// A job changed status
    JobTransitioned {
        /// Owning run
        run_id: RunId,
        /// The job's record after the change
        job: JobRecord,
    },
    /// Every job is terminal
    Finished {
        /// Owning run
        run_id: RunId,
        /// Final outcome
        outcome: PipelineOutcome,
        /// Finish time
        at: DateTime<Utc>,
    },
}

impl RunEvent {
    /// Event type name
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "RunStarted",
            Self::JobTransitioned { .. } => "JobTransitioned",
            Self::Finished { .. } => "RunFinished",
        }
    }

    /// Owning run
    #[must_use]
    pub fn run_id(&self) -> RunId {
        match self {
            Self::Started { record } => record.run_id,
            Self::JobTransitioned { run_id, .. } | Self::Finished { run_id, .. } => *run_id,
        }
    }
}

/// Approval events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ApprovalEvent {
    /// A gated job opened a request
    Requested {
        /// The new request
        request: ApprovalRequest,
    },
    /// An approver granted
    Granted {
        /// Owning run
        run_id: RunId,
        /// Gated job
        job: String,
        /// Approver identity
        identity: String,
    },
    /// An approver rejected
    Rejected {
        /// Owning run
        run_id: RunId,
        /// Gated job
        job: String,
        /// Approver identity
        identity: String,
    },
    /// The approval timeout elapsed
    Expired {
        /// Owning run
        run_id: RunId,
        /// Gated job
        job: String,
    },
}

impl ApprovalEvent {
    /// Event type name
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Requested { .. } => "ApprovalRequested",
            Self::Granted { .. } => "ApprovalGranted",
            Self::Rejected { .. } => "ApprovalRejected",
            Self::Expired { .. } => "ApprovalExpired",
        }
    }

    /// Owning run
    #[must_use]
    pub fn run_id(&self) -> RunId {
        match self {
            Self::Requested { request } => request.run_id,
            Self::Granted { run_id, .. } | Self::Rejected { run_id, .. } | Self::Expired { run_id, .. } => *run_id,
        }
    }

    /// Gated job
    #[must_use]
    pub fn job(&self) -> &str {
        match self {
            Self::Requested { request } => &request.job,
            Self::Granted { job, .. } | Self::Rejected { job, .. } | Self::Expired { job, .. } => job,
        }
    }
}

/// Release events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReleaseEvent {
    /// A release was created
    Created {
        /// The release
        release: Release,
    },
}

impl ReleaseEvent {
    /// Event type name
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "ReleaseCreated",
        }
    }
}
