//! Error kinds surfaced by the orchestration engine.

use std::time::Duration;
use thiserror::Error;

use crate::validation::ValidationError;

/// Result type for pipeline operations
pub type PipelineResult<T = ()> = Result<T, PipelineError>;

/// Errors that can occur while loading, scheduling or releasing a pipeline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The dependency graph contains a cycle
    #[error("dependency cycle detected: {}", .jobs.join(" -> "))]
    CycleDetected {
        /// Every job on the offending cycle, in cycle order
        jobs: Vec<String>,
    },

    /// A step exited with a non-zero status
    #[error("job '{job}' step '{step}' failed with exit code {exit_code}")]
    StepFailed {
        /// Owning job
        job: String,
        /// Step label
        step: String,
        /// Exit status reported by the runner
        exit_code: i32,
        /// Captured, secret-redacted output
        output: String,
    },

    /// A step exceeded its timeout and was terminated
    #[error("job '{job}' step '{step}' timed out after {timeout:?}")]
    StepTimedOut {
        /// Owning job
        job: String,
        /// Step label
        step: String,
        /// The limit that was exceeded
        timeout: Duration,
    },

    /// An approver rejected the job's environment gate
    #[error("job '{job}' was rejected by '{approver}'")]
    ApprovalDenied {
        /// Gated job
        job: String,
        /// Identity that rejected
        approver: String,
    },

    /// The gate stayed pending past the configured approval timeout
    #[error("job '{job}' approval timed out after {after:?}")]
    ApprovalTimedOut {
        /// Gated job
        job: String,
        /// Configured approval timeout
        after: Duration,
    },

    /// The commit is already released at an equal or greater version
    #[error("nothing to release: commit {commit} is already tagged '{tag}'")]
    NoOpRelease {
        /// The existing tag
        tag: String,
        /// Commit reference
        commit: String,
    },

    /// A rollout health probe failed
    #[error("health check '{probe}' failed: {reason}")]
    HealthCheckFailed {
        /// Probe name
        probe: String,
        /// Failure detail
        reason: String,
    },

    /// Restoring traffic to zero after a failed rollout did not succeed
    #[error("rollback failed: {reason}")]
    RollbackFailed {
        /// Failure detail
        reason: String,
    },

    /// The job was cancelled before it reached a terminal state
    #[error("job '{job}' was cancelled")]
    Cancelled {
        /// Cancelled job
        job: String,
    },

    /// The pipeline definition is malformed
    #[error("configuration error: {0}")]
    ConfigurationError(#[from] ValidationError),

    /// Talking to an external collaborator failed
    #[error("{collaborator} error: {reason}")]
    External {
        /// Which collaborator
        collaborator: String,
        /// Failure detail
        reason: String,
    },
}

impl PipelineError {
    /// Returns the job name this error originated from, if any
    #[must_use]
    pub fn job(&self) -> Option<&str> {
        match self {
            Self::StepFailed { job, .. }
            | Self::StepTimedOut { job, .. }
            | Self::ApprovalDenied { job, .. }
            | Self::ApprovalTimedOut { job, .. }
            | Self::Cancelled { job } => Some(job),
            _ => None,
        }
    }

    /// Returns true for errors that abort loading before any job starts
    #[must_use]
    pub fn is_load_time(&self) -> bool {
        matches!(self, Self::CycleDetected { .. } | Self::ConfigurationError(_))
    }

    /// Shorthand for an external collaborator failure
    pub fn external(collaborator: impl Into<String>, reason: impl ToString) -> Self {
        Self::External {
            collaborator: collaborator.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_jobs() {
        let err = PipelineError::CycleDetected {
            jobs: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
        assert!(err.is_load_time());
    }

    #[test]
    fn test_job_attribution() {
        let err = PipelineError::StepFailed {
            job: "build".into(),
            step: "compile".into(),
            exit_code: 2,
            output: String::new(),
        };
        assert_eq!(err.job(), Some("build"));
        assert!(!err.is_load_time());

        let err = PipelineError::from(ValidationError::EmptyJobs);
        assert_eq!(err.job(), None);
        assert!(err.is_load_time());
    }
}
