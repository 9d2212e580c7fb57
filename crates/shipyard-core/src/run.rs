//! Run records.
//!
//! A [`RunRecord`] is created when a run starts and is mutated only by the
//! scheduler that drives it. Job status transitions are monotonic: once a
//! job reaches a terminal status it never changes again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::options::TriggerEvent;

/// Identifier of one pipeline execution
pub type RunId = Uuid;

/// Lifecycle status of a job within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    /// Waiting on prerequisites
    Pending,
    /// All prerequisites satisfied, waiting for dispatch
    Ready,
    /// Executing steps
    Running,
    /// Blocked on an environment gate; holds no worker
    WaitingApproval,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
    /// Never ran because a prerequisite did not succeed
    Skipped,
    /// Stopped by a cancellation request
    Cancelled,
}

impl JobStatus {
    /// Returns true for statuses a job never leaves
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Returns true if the job counts against the run's outcome
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }

    /// Returns true if `self -> next` is an allowed transition
    ///
    /// A `Ready` job may fail before it ever holds a worker, for example when
    /// its environment lacks a secret.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobStatus::{Cancelled, Failed, Pending, Ready, Running, Skipped, Succeeded, WaitingApproval};
        matches!(
            (self, next),
            (Pending, Ready | Skipped | Cancelled)
                | (Ready, Running | Failed | Cancelled)
                | (Running, WaitingApproval | Succeeded | Failed | Cancelled)
                | (WaitingApproval, Running | Failed | Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::WaitingApproval => "waiting-approval",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Final outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineOutcome {
    /// Every job succeeded or was skipped
    Succeeded,
    /// At least one job failed or was cancelled
    Failed,
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Classification of a job failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Non-zero exit
    StepFailed,
    /// Step or job timeout
    StepTimedOut,
    /// Gate rejected
    ApprovalDenied,
    /// Gate pending past the approval timeout
    ApprovalTimedOut,
    /// Release already exists for the commit
    NoOpRelease,
    /// Rollout rolled back after a failed probe
    HealthCheckFailed,
    /// Rollback itself failed
    RollbackFailed,
    /// Cancelled
    Cancelled,
    /// Collaborator or configuration problem discovered at run time
    Other,
}

/// What went wrong in one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    /// Failure classification
    pub kind: FailureKind,
    /// Job the failure originated in
    pub job: String,
    /// Step label, when a step was running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// Human readable message
    pub message: String,
    /// Redacted output of the failing step
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

impl FailureReport {
    /// Builds a report from an engine error raised in `job`
    #[must_use]
    pub fn from_error(job: &str, error: &PipelineError) -> Self {
        let (kind, step, output) = match error {
            PipelineError::StepFailed { step, output, .. } => {
                (FailureKind::StepFailed, Some(step.clone()), output.clone())
            }
            PipelineError::StepTimedOut { step, .. } => {
                (FailureKind::StepTimedOut, Some(step.clone()), String::new())
            }
            PipelineError::ApprovalDenied { .. } => (FailureKind::ApprovalDenied, None, String::new()),
            PipelineError::ApprovalTimedOut { .. } => {
                (FailureKind::ApprovalTimedOut, None, String::new())
            }
            PipelineError::NoOpRelease { .. } => (FailureKind::NoOpRelease, None, String::new()),
            PipelineError::HealthCheckFailed { .. } => {
                (FailureKind::HealthCheckFailed, None, String::new())
            }
            PipelineError::RollbackFailed { .. } => (FailureKind::RollbackFailed, None, String::new()),
            PipelineError::Cancelled { .. } => (FailureKind::Cancelled, None, String::new()),
            _ => (FailureKind::Other, None, String::new()),
        };
        Self {
            kind,
            job: job.to_string(),
            step,
            message: error.to_string(),
            output,
        }
    }
}

/// Per-job slice of a run record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Job name
    pub name: String,
    /// Current status
    pub status: JobStatus,
    /// First time the job entered `Running`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Time the job reached a terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Step attempts made, retries included
    #[serde(default)]
    pub attempts: u32,
    /// Path of the job's redacted log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_ref: Option<PathBuf>,
    /// Failure detail for `Failed` and `Cancelled` jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    /// Non-fatal reports, e.g. a rollback after a failed health probe
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reports: Vec<String>,
}

/// Rejected status change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job '{job}' cannot move from {from} to {to}")]
pub struct InvalidTransition {
    /// Job name
    pub job: String,
    /// Current status
    pub from: JobStatus,
    /// Requested status
    pub to: JobStatus,
}

impl JobRecord {
    /// Creates a pending record
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
            attempts: 0,
            log_ref: None,
            failure: None,
            reports: Vec::new(),
        }
    }

    /// Moves the job to `next`, stamping start and finish times
    pub fn transition(&mut self, next: JobStatus, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                job: self.name.clone(),
                from: self.status,
                to: next,
            });
        }
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(at);
        }
        if next.is_terminal() {
            self.finished_at = Some(at);
        }
        self.status = next;
        Ok(())
    }
}

/// One pipeline execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Run identifier
    pub run_id: RunId,
    /// Pipeline name
    pub pipeline: String,
    /// Event that started the run
    pub trigger: TriggerEvent,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time, once every job is terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Per-job breakdown in definition order
    pub jobs: Vec<JobRecord>,
    /// Final outcome, once finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<PipelineOutcome>,
}

impl RunRecord {
    /// Creates a record with every job pending
    #[must_use]
    pub fn new<'a>(
        run_id: RunId,
        pipeline: impl Into<String>,
        trigger: TriggerEvent,
        jobs: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            run_id,
            pipeline: pipeline.into(),
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            jobs: jobs.into_iter().map(JobRecord::new).collect(),
            outcome: None,
        }
    }

    /// Commit the run builds
    #[must_use]
    pub fn commit(&self) -> &str {
        self.trigger.commit()
    }

    /// Looks a job up by name
    #[must_use]
    pub fn job(&self, name: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Status of a job by name
    #[must_use]
    pub fn status_of(&self, name: &str) -> Option<JobStatus> {
        self.job(name).map(|j| j.status)
    }

    /// Returns true once every job is terminal
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.jobs.iter().all(|j| j.status.is_terminal())
    }

    /// Outcome implied by the current job statuses
    #[must_use]
    pub fn compute_outcome(&self) -> PipelineOutcome {
        if self.jobs.iter().any(|j| j.status.is_failure() || !j.status.is_terminal()) {
            PipelineOutcome::Failed
        } else {
            PipelineOutcome::Succeeded
        }
    }

    /// Stamps the finish time and outcome
    pub fn finish(&mut self, at: DateTime<Utc>) -> PipelineOutcome {
        let outcome = self.compute_outcome();
        self.finished_at = Some(at);
        self.outcome = Some(outcome);
        outcome
    }

    /// Every failure report in job order
    pub fn failures(&self) -> impl Iterator<Item = &FailureReport> {
        self.jobs.iter().filter_map(|j| j.failure.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn record() -> RunRecord {
        RunRecord::new(
            Uuid::new_v4(),
            "web",
            TriggerEvent::Manual {
                commit: "abc123".to_string(),
            },
            ["lint", "test"],
        )
    }

    #[rstest]
    #[case(JobStatus::Pending, JobStatus::Ready, true)]
    #[case(JobStatus::Pending, JobStatus::Skipped, true)]
    #[case(JobStatus::Pending, JobStatus::Running, false)]
    #[case(JobStatus::Ready, JobStatus::Running, true)]
    #[case(JobStatus::Ready, JobStatus::Failed, true)]
    #[case(JobStatus::Ready, JobStatus::Succeeded, false)]
    #[case(JobStatus::Running, JobStatus::WaitingApproval, true)]
    #[case(JobStatus::WaitingApproval, JobStatus::Running, true)]
    #[case(JobStatus::WaitingApproval, JobStatus::Succeeded, false)]
    #[case(JobStatus::Succeeded, JobStatus::Running, false)]
    #[case(JobStatus::Failed, JobStatus::Cancelled, false)]
    #[case(JobStatus::Skipped, JobStatus::Ready, false)]
    fn test_transitions(#[case] from: JobStatus, #[case] to: JobStatus, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_terminal_status_never_regresses() {
        let mut job = JobRecord::new("deploy");
        let now = Utc::now();
        job.transition(JobStatus::Ready, now).unwrap();
        job.transition(JobStatus::Running, now).unwrap();
        job.transition(JobStatus::Succeeded, now).unwrap();
        assert_eq!(job.started_at, Some(now));
        assert_eq!(job.finished_at, Some(now));

        let err = job.transition(JobStatus::Failed, now).unwrap_err();
        assert_eq!(err.from, JobStatus::Succeeded);
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[test]
    fn test_outcome_from_job_statuses() {
        let mut run = record();
        let now = Utc::now();
        for job in &mut run.jobs {
            job.transition(JobStatus::Skipped, now).unwrap();
        }
        assert!(run.is_complete());
        assert_eq!(run.finish(now), PipelineOutcome::Succeeded);

        let mut run = record();
        run.jobs[0].transition(JobStatus::Cancelled, now).unwrap();
        run.jobs[1].transition(JobStatus::Skipped, now).unwrap();
        assert_eq!(run.compute_outcome(), PipelineOutcome::Failed);
    }

    #[test]
    fn test_failure_report_keeps_step_output() {
        let err = PipelineError::StepFailed {
            job: "test".to_string(),
            step: "unit".to_string(),
            exit_code: 1,
            output: "assertion failed".to_string(),
        };
        let report = FailureReport::from_error("test", &err);
        assert_eq!(report.kind, FailureKind::StepFailed);
        assert_eq!(report.step.as_deref(), Some("unit"));
        assert_eq!(report.output, "assertion failed");
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let run = record();
        let json = serde_json::to_value(&run).unwrap();
        assert!(json.get("runId").is_some());
        assert_eq!(json["jobs"][0]["status"], "pending");
        let back: RunRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, run);
    }
}
