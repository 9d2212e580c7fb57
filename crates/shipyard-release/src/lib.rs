//! # Shipyard Release
//!
//! Release policy on top of the scheduler: version tagging with release notes
//! and staged traffic rollouts with health-check driven rollback. Both run as
//! action steps (`tag-release`, `rollout`) inside an ordinary job.
//!
//! ## Architecture
//!
//! - `source`: the source-control collaborator and its git CLI adapter
//! - `release`: next-version computation and idempotent release creation
//! - `router`: traffic routers that set a target's weight
//! - `probe`: HTTP and command health probes
//! - `rollout`: the canary / blue-green state machine
//! - `handlers`: step-executor handlers for the two release actions
//! - `poller`: turns new pushes and tags into trigger events
//!
//! ## Example
//!
//! ```rust,ignore
//! use shipyard_release::{GitCli, ReleaseController};
//!
//! let controller = ReleaseController::new(Arc::new(GitCli::new(".")), store);
//! let release = controller.release(&commit, BumpPolicy::Patch, vec![]).await?;
//! println!("released {}", release.tag);
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod handlers;
pub mod poller;
pub mod probe;
pub mod release;
pub mod rollout;
pub mod router;
pub mod source;

pub use handlers::{RolloutHandler, TagReleaseHandler};
pub use poller::GitPoller;
pub use probe::{CommandProbe, HealthProbe, HttpProbe, StandardProbe};
pub use release::{ReleaseController, ReleasePlan};
pub use rollout::{RolloutController, RolloutOutcome, RolloutReport, RolloutState};
pub use router::{CommandTrafficRouter, TrafficRouter};
pub use source::{GitCli, GitRef, SourceControl};

use shipyard_core::PipelineError;
use shipyard_events::EventsError;
use shipyard_executor::ExecutorError;

/// Release error types
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ReleaseError(#[from] ReleaseErrorKind);

impl ReleaseError {
    /// The specific kind
    #[must_use]
    pub fn kind(&self) -> &ReleaseErrorKind {
        &self.0
    }

    /// Converts into the engine error reported on the job
    #[must_use]
    pub fn into_pipeline_error(self) -> PipelineError {
        match self.0 {
            ReleaseErrorKind::Pipeline(e) => e,
            ReleaseErrorKind::Git { .. } => PipelineError::external("source control", self),
            ReleaseErrorKind::Router { .. } => PipelineError::external("traffic router", self),
            ReleaseErrorKind::Events(e) => PipelineError::external("event store", e),
            ReleaseErrorKind::Executor(e) => PipelineError::external("executor", e),
        }
    }
}

/// Specific error kinds
#[derive(Debug, thiserror::Error)]
pub enum ReleaseErrorKind {
    /// A git command failed
    #[error("git {command} failed: {reason}")]
    Git {
        /// Subcommand, e.g. `tag`
        command: String,
        /// Captured error output
        reason: String,
    },

    /// The router could not set a weight
    #[error("failed to route {weight}% of '{target}': {reason}")]
    Router {
        /// Deployment target
        target: String,
        /// Requested weight
        weight: u8,
        /// Failure detail
        reason: String,
    },

    /// A release or rollout domain error
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Reading or writing history failed
    #[error(transparent)]
    Events(#[from] EventsError),

    /// Running a command failed
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl From<PipelineError> for ReleaseError {
    fn from(e: PipelineError) -> Self {
        Self(e.into())
    }
}

impl From<EventsError> for ReleaseError {
    fn from(e: EventsError) -> Self {
        Self(e.into())
    }
}

impl From<ExecutorError> for ReleaseError {
    fn from(e: ExecutorError) -> Self {
        Self(e.into())
    }
}

/// Release result type
pub type ReleaseResult<T = ()> = Result<T, ReleaseError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_into_pipeline_error() {
        let err = ReleaseError::from(ReleaseErrorKind::Git {
            command: "tag".to_string(),
            reason: "fatal: tag 'v1.0.0' already exists".to_string(),
        });
        assert_eq!(
            err.into_pipeline_error(),
            PipelineError::external("source control", "git tag failed: fatal: tag 'v1.0.0' already exists")
        );

        let noop = PipelineError::NoOpRelease {
            tag: "v1.0.0".to_string(),
            commit: "abc".to_string(),
        };
        assert_eq!(ReleaseError::from(noop.clone()).into_pipeline_error(), noop);
    }
}
