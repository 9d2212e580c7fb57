//! # Shipyard Worker
//!
//! Drives pipeline runs: the scheduler walks the dependency graph, gates jobs
//! bound to protected environments and hands each job's steps to the step
//! executor.
//!
//! ## Architecture
//!
//! - `scheduler`: the run loop, single writer of the run record
//! - `gate`: approval decisions and the approval book gated jobs wait on
//! - `listener`: run listeners for logging, persistence and tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use shipyard_worker::{ApprovalBook, Scheduler};
//!
//! let scheduler = Scheduler::new(executor, Arc::new(ApprovalBook::new(store)));
//! let record = scheduler.run(&pipeline, trigger, &CancelHandle::new()).await;
//! println!("{:?}", record.outcome);
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod gate;
pub mod listener;
pub mod scheduler;

pub use gate::{ApprovalBook, DEFAULT_POLL_INTERVAL, GateDecision, GateResolution, authorize, missing_secrets};
pub use listener::{BufferRunListener, CompositeRunListener, HistoryRecorder, RunListener, TracingRunListener};
pub use scheduler::{JobOutcome, JobUpdate, Scheduler, SchedulerConfig};

use shipyard_core::RunId;
use shipyard_events::EventsError;

/// Worker error types
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct WorkerError(#[from] WorkerErrorKind);

impl WorkerError {
    /// The specific kind
    #[must_use]
    pub fn kind(&self) -> &WorkerErrorKind {
        &self.0
    }
}

/// Specific error kinds
#[derive(Debug, thiserror::Error)]
pub enum WorkerErrorKind {
    /// No approval request exists for the job
    #[error("no approval request for job '{job}' in run {run_id}")]
    NoApprovalRequest {
        /// Run
        run_id: RunId,
        /// Job
        job: String,
    },

    /// The request was already approved, rejected or expired
    #[error("approval request for job '{job}' in run {run_id} is closed")]
    ApprovalClosed {
        /// Run
        run_id: RunId,
        /// Job
        job: String,
    },

    /// The identity is not a required approver
    #[error("'{identity}' is not an approver for job '{job}'")]
    NotAnApprover {
        /// Rejected identity
        identity: String,
        /// Job
        job: String,
    },

    /// Reading or writing history failed
    #[error(transparent)]
    Events(#[from] EventsError),
}

impl From<EventsError> for WorkerError {
    fn from(e: EventsError) -> Self {
        Self(e.into())
    }
}

/// Worker result type
pub type WorkerResult<T = ()> = Result<T, WorkerError>;
