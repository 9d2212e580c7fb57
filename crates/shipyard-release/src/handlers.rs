//! Step-executor handlers for `tag-release` and `rollout`.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;

use shipyard_core::{Action, PipelineError};
use shipyard_executor::{
    ActionHandler, ActionInvocation, ExecutorErrorKind, ExecutorResult, StepOutcome, StepResult,
};

use crate::release::ReleaseController;
use crate::rollout::{RolloutController, RolloutOutcome};

fn unexpected(action: &Action) -> shipyard_executor::ExecutorError {
    ExecutorErrorKind::NoHandler {
        action: action.kind().name().to_string(),
    }
    .into()
}

/// Runs [`Action::TagRelease`]
#[derive(Debug, Clone)]
pub struct TagReleaseHandler {
    controller: Arc<ReleaseController>,
}

impl TagReleaseHandler {
    /// Handler creating releases through `controller`
    #[must_use]
    pub fn new(controller: Arc<ReleaseController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl ActionHandler for TagReleaseHandler {
    async fn execute(&self, action: &Action, invocation: &ActionInvocation<'_>) -> ExecutorResult<StepResult> {
        let Action::TagRelease { bump, artifacts } = action else {
            return Err(unexpected(action));
        };
        let start = Instant::now();
        match self.controller.release(invocation.commit, *bump, artifacts.clone()).await {
            Ok(release) => Ok(StepResult::succeeded(
                format!("{}\n\n{}\n", release.tag, release.notes),
                start.elapsed(),
            )
            .with_report(format!("released {} at {}", release.tag, release.commit))),
            Err(e) => Ok(StepResult::aborted(e.into_pipeline_error(), start.elapsed())),
        }
    }
}

/// Runs [`Action::Rollout`]
///
/// A rollback after a failed probe is a recovered failure: the step succeeds
/// and carries the rollback as a report. A failed rollback aborts the step.
#[derive(Debug, Clone)]
pub struct RolloutHandler {
    controller: Arc<RolloutController>,
}

impl RolloutHandler {
    /// Handler running plans through `controller`
    #[must_use]
    pub fn new(controller: Arc<RolloutController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl ActionHandler for RolloutHandler {
    async fn execute(&self, action: &Action, invocation: &ActionInvocation<'_>) -> ExecutorResult<StepResult> {
        let Action::Rollout(plan) = action else {
            return Err(unexpected(action));
        };
        let start = Instant::now();
        let report = match self.controller.run(plan, invocation.cancel).await {
            Ok(report) => report,
            Err(e) => return Ok(StepResult::aborted(e.into_pipeline_error(), start.elapsed())),
        };

        let stdout = report
            .states
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
            + "\n";
        let result = match &report.outcome {
            RolloutOutcome::Promoted => StepResult::succeeded(stdout, start.elapsed()),
            RolloutOutcome::RolledBack { probe, reason } => {
                tracing::warn!(
                    job = %invocation.job,
                    error = %PipelineError::HealthCheckFailed { probe: probe.clone(), reason: reason.clone() },
                    "rollout rolled back"
                );
                StepResult::succeeded(stdout, start.elapsed())
            }
            RolloutOutcome::Cancelled => StepResult {
                stdout,
                ..StepResult::new(StepOutcome::Cancelled, start.elapsed())
            },
        };
        Ok(result.with_report(report.summary()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use shipyard_core::{BumpPolicy, ProbeCheck, ProbeSpec, RolloutPlan, Variables};
    use shipyard_events::InMemoryEventStore;
    use shipyard_executor::{CancelSignal, LocalRunner};
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::release::tests::FakeSource;
    use crate::rollout::tests::{FakeProbe, FakeRouter};

    fn invoke<'a>(
        dir: &'a TempDir,
        env: &'a Variables,
        cancel: &'a CancelSignal,
        runner: &'a LocalRunner,
    ) -> ActionInvocation<'a> {
        ActionInvocation {
            run_id: Uuid::nil(),
            job: "release",
            step: "tag-release",
            commit: "c2",
            environment: None,
            working_dir: dir.path(),
            env,
            timeout: Duration::from_secs(10),
            cancel,
            runner,
        }
    }

    #[tokio::test]
    async fn test_tag_release_then_noop() {
        let store = Arc::new(InMemoryEventStore::new());
        let controller = ReleaseController::new(Arc::new(FakeSource::with_tags(&[("v1.4.2", "c1")])), store);
        let handler = TagReleaseHandler::new(Arc::new(controller));
        let action = Action::TagRelease {
            bump: BumpPolicy::Minor,
            artifacts: Vec::new(),
        };
        let (dir, env, cancel, runner) = (TempDir::new().unwrap(), Variables::new(), CancelSignal::never(), LocalRunner::default());

        let first = handler.execute(&action, &invoke(&dir, &env, &cancel, &runner)).await.unwrap();
        assert_eq!(first.outcome, StepOutcome::Succeeded);
        assert_eq!(first.reports, vec!["released v1.5.0 at c2".to_string()]);

        let second = handler.execute(&action, &invoke(&dir, &env, &cancel, &runner)).await.unwrap();
        assert_eq!(
            second.outcome,
            StepOutcome::Aborted(PipelineError::NoOpRelease {
                tag: "v1.5.0".to_string(),
                commit: "c2".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_rollback_is_reported_not_failed() {
        let router = Arc::new(FakeRouter::default());
        let probe = Arc::new(FakeProbe {
            router: router.clone(),
            failing: "errors",
            fail_at: 50,
            checks: parking_lot::Mutex::new(0),
        });
        let handler = RolloutHandler::new(Arc::new(RolloutController::new(router, probe)));
        let plan = RolloutPlan::canary("web")
            .with_timing(Duration::ZERO, Duration::from_millis(10))
            .with_probe(ProbeSpec {
                name: "errors".to_string(),
                check: ProbeCheck::Run {
                    command: "check-errors".to_string(),
                },
            });
        let (dir, env, cancel, runner) = (TempDir::new().unwrap(), Variables::new(), CancelSignal::never(), LocalRunner::default());

        let result = handler
            .execute(&Action::Rollout(plan), &invoke(&dir, &env, &cancel, &runner))
            .await
            .unwrap();
        assert_eq!(result.outcome, StepOutcome::Succeeded);
        assert_eq!(
            result.reports,
            vec!["rollout of 'web' rolled back to 0%: health check 'errors' failed: error rate 7% at 50%".to_string()]
        );
        assert!(result.stdout.ends_with("rolled back (errors failed)\n"), "{}", result.stdout);
    }

    #[tokio::test]
    async fn test_wrong_action_is_rejected() {
        let handler = RolloutHandler::new(Arc::new(RolloutController::new(
            Arc::new(FakeRouter::default()),
            Arc::new(crate::probe::HttpProbe::default()),
        )));
        let (dir, env, cancel, runner) = (TempDir::new().unwrap(), Variables::new(), CancelSignal::never(), LocalRunner::default());
        let action = Action::TagRelease {
            bump: BumpPolicy::Patch,
            artifacts: Vec::new(),
        };
        let err = handler.execute(&action, &invoke(&dir, &env, &cancel, &runner)).await.unwrap_err();
        assert!(matches!(err.kind(), ExecutorErrorKind::NoHandler { action } if action == "tag-release"));
    }
}
