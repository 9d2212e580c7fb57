//! Runtime for executing pipeline steps.
//!
//! [`StepExecutor::execute`] runs one step inside a fresh [`StepSandbox`]:
//! secrets are looked up for the job's environment, injected for that step
//! only, and masked in everything the step produced. Failed or timed-out
//! attempts are retried up to the step's `retries`; cancelled ones never are.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use shipyard_core::{Action, ActionKind, Job, PipelineError, Step, StepKind};

use crate::action::{ActionHandler, ActionInvocation, CommandTemplates, TemplateActionHandler};
use crate::context::{ExecutionContext, StepSandbox};
use crate::listener::{NoopListener, StepEvent, StepListener};
use crate::runner::{CommandSpec, ComputeRunner, StepOutcome, StepResult};
use crate::secrets::{Redactor, SecretStore, SecretValue};
use crate::{ExecutorError, ExecutorErrorKind, ExecutorResult};

/// Result of one step, output already redacted
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Step label
    pub step: String,
    /// Final attempt's result
    pub result: StepResult,
    /// Attempts made
    pub attempts: u32,
    /// Timeout the final attempt ran under
    pub timeout: Duration,
}

/// Result of all steps of one job
#[derive(Debug, Clone, Default)]
pub struct JobReport {
    /// Reports of the steps that ran, in order
    pub steps: Vec<StepReport>,
    /// Non-fatal reports produced by actions
    pub reports: Vec<String>,
    /// Why the job failed, if it did
    pub error: Option<PipelineError>,
}

impl JobReport {
    /// Returns true if every step succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Step attempts across the job
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.steps.iter().map(|s| s.attempts).sum()
    }
}

/// Built-in step executor
pub struct StepExecutor {
    runner: Arc<dyn ComputeRunner>,
    secrets: Arc<dyn SecretStore>,
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
    templates: TemplateActionHandler,
    listener: Arc<dyn StepListener>,
    retry_delay: Duration,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("runner", &self.runner)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl StepExecutor {
    /// Creates an executor over `runner` and `secrets`
    #[must_use]
    pub fn new(runner: Arc<dyn ComputeRunner>, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            runner,
            secrets,
            handlers: HashMap::new(),
            templates: TemplateActionHandler::default(),
            listener: Arc::new(NoopListener),
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Registers a handler for one action kind
    #[must_use]
    pub fn with_handler(mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Sets the command templates used for actions without a handler
    #[must_use]
    pub fn with_templates(mut self, templates: CommandTemplates) -> Self {
        self.templates = TemplateActionHandler::new(templates);
        self
    }

    /// Sets the step listener
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn StepListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Sets the pause between retry attempts
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// The compute runner
    #[must_use]
    pub fn runner(&self) -> &Arc<dyn ComputeRunner> {
        &self.runner
    }

    /// The secret store steps read from
    #[must_use]
    pub fn secrets(&self) -> &Arc<dyn SecretStore> {
        &self.secrets
    }

    /// Returns true if `action` can run: it has a handler or a template
    #[must_use]
    pub fn supports(&self, action: &Action) -> bool {
        let kind = action.kind();
        self.handlers.contains_key(&kind)
            || kind == ActionKind::Checkout
            || self.templates.configured().any(|name| name == kind.name())
    }

    fn lookup_secrets(&self, step: &Step, ctx: &ExecutionContext) -> ExecutorResult<Vec<(String, SecretValue)>> {
        step.required_secrets()
            .into_iter()
            .map(|name| {
                let environment = ctx.environment.as_deref().unwrap_or_default();
                self.secrets
                    .get(environment, name)
                    .map(|value| (name.to_string(), value))
                    .ok_or_else(|| {
                        ExecutorError::from(ExecutorErrorKind::MissingSecret {
                            environment: environment.to_string(),
                            name: name.to_string(),
                        })
                    })
            })
            .collect()
    }

    /// Runs `step` under `timeout`, retrying as configured
    ///
    /// The returned report never contains a secret value.
    pub async fn execute(&self, step: &Step, ctx: &ExecutionContext, timeout: Duration) -> StepReport {
        self.execute_masking(step, ctx, timeout, &[]).await
    }

    /// Every secret value the steps of `job` can resolve
    fn job_secrets(&self, job: &Job, ctx: &ExecutionContext) -> Vec<SecretValue> {
        job.steps
            .iter()
            .filter_map(|step| self.lookup_secrets(step, ctx).ok())
            .flatten()
            .map(|(_, value)| value)
            .collect()
    }

    async fn execute_masking(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        timeout: Duration,
        also_mask: &[SecretValue],
    ) -> StepReport {
        self.listener
            .on_event(&StepEvent::StepStarted {
                run_id: ctx.run_id,
                job: ctx.job.clone(),
                step: step.name.clone(),
            })
            .await;

        let prepared = self
            .lookup_secrets(step, ctx)
            .and_then(|secrets| StepSandbox::create(ctx, &step.env, secrets, also_mask));
        let (result, attempts, timeout) = match prepared {
            Ok(sandbox) => self.attempts(step, ctx, &sandbox, timeout).await,
            Err(e) => {
                warn!(job = %ctx.job, step = %step.name, error = %e, "cannot prepare step");
                (
                    StepResult::aborted(PipelineError::external("executor", e), Duration::ZERO),
                    0,
                    timeout,
                )
            }
        };

        self.listener
            .on_event(&StepEvent::StepFinished {
                run_id: ctx.run_id,
                job: ctx.job.clone(),
                step: step.name.clone(),
                outcome: result.outcome.clone(),
                attempts,
                duration: result.duration,
            })
            .await;

        StepReport {
            step: step.name.clone(),
            result,
            attempts,
            timeout,
        }
    }

    async fn attempts(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        sandbox: &StepSandbox,
        timeout: Duration,
    ) -> (StepResult, u32, Duration) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let limit = ctx.step_timeout(Some(timeout));
            let started = Instant::now();
            let result = match self.attempt(step, ctx, sandbox, limit).await {
                Ok(result) => redact(result, sandbox.redactor()),
                Err(e) => StepResult::aborted(
                    PipelineError::external("executor", sandbox.redactor().redact(&e.to_string())),
                    started.elapsed(),
                ),
            };

            let output = result.combined_output();
            if !output.is_empty() {
                self.listener
                    .on_event(&StepEvent::StepOutput {
                        run_id: ctx.run_id,
                        job: ctx.job.clone(),
                        step: step.name.clone(),
                        attempt,
                        output,
                    })
                    .await;
            }

            if !result.outcome.is_retryable() || attempt > step.retries || ctx.cancel.is_cancelled() {
                return (result, attempt, limit);
            }

            warn!(job = %ctx.job, step = %step.name, attempt, outcome = %result.outcome, "retrying step");
            tokio::select! {
                () = tokio::time::sleep(self.retry_delay) => {}
                () = ctx.cancel.cancelled() => {
                    return (StepResult::new(StepOutcome::Cancelled, result.duration), attempt, limit);
                }
            }
        }
    }

    async fn attempt(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        sandbox: &StepSandbox,
        timeout: Duration,
    ) -> ExecutorResult<StepResult> {
        match &step.kind {
            StepKind::Run { command } => {
                debug!(job = %ctx.job, step = %step.name, ?timeout, "running command");
                let spec = CommandSpec::new(command.clone(), ctx.cwd(), timeout).with_env(sandbox.env().clone());
                self.runner.run_command(&spec, &ctx.cancel).await
            }
            StepKind::Uses { action } => {
                let invocation = ActionInvocation {
                    run_id: ctx.run_id,
                    job: &ctx.job,
                    step: &step.name,
                    commit: &ctx.commit,
                    environment: ctx.environment.as_deref(),
                    working_dir: ctx.cwd(),
                    env: sandbox.env(),
                    timeout,
                    cancel: &ctx.cancel,
                    runner: self.runner.as_ref(),
                };
                match self.handlers.get(&action.kind()) {
                    Some(handler) => handler.execute(action, &invocation).await,
                    None => self.templates.execute(action, &invocation).await,
                }
            }
        }
    }

    /// Runs the steps of `job` in order, stopping at the first that does not succeed
    pub async fn execute_job(&self, job: &Job, ctx: &ExecutionContext) -> JobReport {
        let mut report = JobReport::default();
        info!(run_id = %ctx.run_id, job = %job.name, steps = job.steps.len(), "executing job");
        let job_secrets = self.job_secrets(job, ctx);

        for step in &job.steps {
            if ctx.cancel.is_cancelled() {
                report.error = Some(PipelineError::Cancelled { job: job.name.clone() });
                break;
            }

            let step_report = self
                .execute_masking(step, ctx, ctx.step_timeout(step.timeout), &job_secrets)
                .await;
            report.reports.extend(step_report.result.reports.iter().cloned());
            let error = match &step_report.result.outcome {
                StepOutcome::Succeeded => None,
                StepOutcome::Failed { exit_code } => Some(PipelineError::StepFailed {
                    job: job.name.clone(),
                    step: step.name.clone(),
                    exit_code: *exit_code,
                    output: step_report.result.combined_output(),
                }),
                StepOutcome::TimedOut => Some(PipelineError::StepTimedOut {
                    job: job.name.clone(),
                    step: step.name.clone(),
                    timeout: step_report.timeout,
                }),
                StepOutcome::Cancelled => Some(PipelineError::Cancelled { job: job.name.clone() }),
                StepOutcome::Aborted(e) => Some(e.clone()),
            };
            report.steps.push(step_report);
            if error.is_some() {
                report.error = error;
                break;
            }
        }
        report
    }
}

fn redact(result: StepResult, redactor: &Redactor) -> StepResult {
    if redactor.is_empty() {
        return result;
    }
    let outcome = match result.outcome {
        StepOutcome::Aborted(e) => StepOutcome::Aborted(redact_error(e, redactor)),
        other => other,
    };
    StepResult {
        outcome,
        stdout: redactor.redact(&result.stdout),
        stderr: redactor.redact(&result.stderr),
        duration: result.duration,
        reports: result.reports.iter().map(|r| redactor.redact(r)).collect(),
    }
}

fn redact_error(error: PipelineError, redactor: &Redactor) -> PipelineError {
    match error {
        PipelineError::External {
            collaborator,
            reason,
        } => PipelineError::External {
            collaborator,
            reason: redactor.redact(&reason),
        },
        PipelineError::HealthCheckFailed { probe, reason } => PipelineError::HealthCheckFailed {
            probe,
            reason: redactor.redact(&reason),
        },
        PipelineError::RollbackFailed { reason } => PipelineError::RollbackFailed {
            reason: redactor.redact(&reason),
        },
        PipelineError::StepFailed {
            job,
            step,
            exit_code,
            output,
        } => PipelineError::StepFailed {
            job,
            step,
            exit_code,
            output: redactor.redact(&output),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;
    use crate::context::ExecutionConfig;
    use crate::listener::BufferListener;
    use crate::runner::LocalRunner;
    use crate::secrets::StaticSecretStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use shipyard_core::DeployTarget;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use uuid::Uuid;

    const SECRET: &str = "sup3r-s3cret-value";

    fn executor(secrets: StaticSecretStore) -> StepExecutor {
        StepExecutor::new(Arc::new(LocalRunner::default()), Arc::new(secrets)).with_retry_delay(Duration::from_millis(10))
    }

    fn context(root: &TempDir, environment: Option<&str>) -> ExecutionContext {
        let config = ExecutionConfig {
            workspace_root: root.path().to_path_buf(),
            ..ExecutionConfig::default()
        };
        ExecutionContext::new(&config, Uuid::new_v4(), "deploy", "abc123")
            .unwrap()
            .with_environment(environment.map(str::to_string))
            .with_default_timeout(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_secret_never_appears_in_output() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root, Some("production"));
        let buffer = BufferListener::new();
        let executor = executor(StaticSecretStore::new().with_secret("production", "TOKEN", SECRET))
            .with_listener(Arc::new(buffer.clone()));
        let step = Step::run("echo token=$TOKEN; echo again $TOKEN >&2; exit 1").with_secret("TOKEN");
        let job = Job::new("deploy").with_step(step);

        let report = executor.execute_job(&job, &ctx).await;

        let Some(PipelineError::StepFailed { output, exit_code, .. }) = &report.error else {
            panic!("expected StepFailed, got {:?}", report.error);
        };
        assert_eq!(*exit_code, 1);
        assert!(output.contains("token=***"));
        assert!(!output.contains(SECRET));
        assert!(!report.steps[0].result.stdout.contains(SECRET));
        assert!(!report.steps[0].result.stderr.contains(SECRET));
        for event in buffer.events() {
            assert!(!format!("{event:?}").contains(SECRET));
        }
    }

    #[tokio::test]
    async fn test_secret_is_scoped_to_its_step() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root, Some("production"));
        let executor = executor(StaticSecretStore::new().with_secret("production", "TOKEN", SECRET));
        let job = Job::new("deploy")
            .with_step(Step::run("test -n \"$TOKEN\"").with_secret("TOKEN"))
            .with_step(Step::run("test -z \"$TOKEN\""));

        let report = executor.execute_job(&job, &ctx).await;
        assert!(report.is_success(), "{:?}", report.error);
    }

    #[tokio::test]
    async fn test_secret_masked_in_later_steps_of_the_job() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root, Some("production"));
        let executor = executor(StaticSecretStore::new().with_secret("production", "TOKEN", SECRET));
        let job = Job::new("deploy")
            .with_step(Step::run("echo $TOKEN > creds").with_secret("TOKEN"))
            .with_step(Step::run("cat creds; cat creds >&2"));

        let report = executor.execute_job(&job, &ctx).await;
        assert!(report.is_success(), "{:?}", report.error);
        let later = &report.steps[1].result;
        assert!(!later.stdout.contains(SECRET));
        assert!(!later.stderr.contains(SECRET));
        assert!(later.stdout.contains("***"));
    }

    #[tokio::test]
    async fn test_missing_secret_aborts_without_running() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root, Some("production"));
        let executor = executor(StaticSecretStore::new());
        let job = Job::new("deploy").with_step(Step::run("touch ran").with_secret("TOKEN"));

        let report = executor.execute_job(&job, &ctx).await;
        assert!(matches!(report.error, Some(PipelineError::External { .. })));
        assert!(!ctx.cwd().join("ran").exists());
    }

    #[tokio::test]
    async fn test_failure_stops_remaining_steps() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root, None);
        let executor = executor(StaticSecretStore::new());
        let job = Job::new("build")
            .with_step(Step::run("echo one > one"))
            .with_step(Step::run("exit 2"))
            .with_step(Step::run("echo three > three"));

        let report = executor.execute_job(&job, &ctx).await;
        assert_eq!(report.steps.len(), 2);
        assert!(ctx.cwd().join("one").exists());
        assert!(!ctx.cwd().join("three").exists());
        assert!(matches!(report.error, Some(PipelineError::StepFailed { exit_code: 2, .. })));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root, None);
        let executor = executor(StaticSecretStore::new());
        // Fails on the first two attempts, succeeds on the third.
        let step = Step::run("echo x >> attempts; test $(wc -l < attempts) -ge 3").with_retries(3);

        let report = executor.execute(&step, &ctx, Duration::from_secs(10)).await;
        assert_eq!(report.result.outcome, StepOutcome::Succeeded);
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root, None);
        let executor = executor(StaticSecretStore::new());
        let step = Step::run("exit 1").with_retries(2);

        let report = executor.execute(&step, &ctx, Duration::from_secs(10)).await;
        assert_eq!(report.result.outcome, StepOutcome::Failed { exit_code: 1 });
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn test_timeout_reported_as_step_timed_out() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root, None);
        let executor = executor(StaticSecretStore::new());
        let job = Job::new("build").with_step(Step::run("sleep 5").named("slow").with_timeout(Duration::from_millis(100)));

        let report = executor.execute_job(&job, &ctx).await;
        assert_eq!(
            report.error,
            Some(PipelineError::StepTimedOut {
                job: "build".to_string(),
                step: "slow".to_string(),
                timeout: Duration::from_millis(100),
            })
        );
    }

    #[tokio::test]
    async fn test_cancelled_step_is_not_retried() {
        let root = TempDir::new().unwrap();
        let handle = CancelHandle::new();
        let ctx = context(&root, None).with_cancel(handle.signal());
        let executor = executor(StaticSecretStore::new());
        let step = Step::run("sleep 5").with_retries(5);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        });
        let report = executor.execute(&step, &ctx, Duration::from_secs(10)).await;
        canceller.await.unwrap();

        assert_eq!(report.result.outcome, StepOutcome::Cancelled);
        assert_eq!(report.attempts, 1);
    }

    #[derive(Debug, Default)]
    struct CountingHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ActionHandler for CountingHandler {
        async fn execute(&self, action: &Action, invocation: &ActionInvocation<'_>) -> ExecutorResult<StepResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let credentials = action.credentials().unwrap_or_default();
            let value = invocation.env.get(credentials).cloned().unwrap_or_default();
            Ok(StepResult::succeeded(format!("deployed with {value}"), Duration::ZERO).with_report("deployed"))
        }
    }

    #[tokio::test]
    async fn test_registered_handler_receives_credentials() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root, Some("production"));
        let handler = Arc::new(CountingHandler::default());
        let executor = executor(StaticSecretStore::new().with_secret("production", "CLUSTER_KEY", SECRET))
            .with_handler(ActionKind::ClusterApply, handler.clone());
        let action = Action::ClusterApply(DeployTarget {
            credentials: "CLUSTER_KEY".to_string(),
            target: "prod-cluster".to_string(),
            payload: None,
        });
        assert!(executor.supports(&action));
        let job = Job::new("deploy").with_step(Step::uses(action));

        let report = executor.execute_job(&job, &ctx).await;
        assert!(report.is_success());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.steps[0].result.stdout, "deployed with ***");
        assert_eq!(report.reports, vec!["deployed".to_string()]);
    }

    #[tokio::test]
    async fn test_unsupported_action_aborts() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root, None);
        let executor = executor(StaticSecretStore::new());
        let action = Action::SetupRuntime {
            runtime: "node".to_string(),
            version: "20".to_string(),
        };
        assert!(!executor.supports(&action));

        let report = executor.execute(&Step::uses(action), &ctx, Duration::from_secs(1)).await;
        assert!(matches!(report.result.outcome, StepOutcome::Aborted(_)));
        assert!(!report.result.outcome.is_retryable());
    }

    #[tokio::test]
    async fn test_step_sandbox_released() {
        let root = TempDir::new().unwrap();
        let ctx = context(&root, None);
        let executor = executor(StaticSecretStore::new());
        let step = Step::run("echo $TMPDIR");

        let report = executor.execute(&step, &ctx, Duration::from_secs(10)).await;
        let tmp = report.result.stdout.trim().to_string();
        assert!(tmp.starts_with(&ctx.cwd().display().to_string()));
        assert!(!std::path::Path::new(&tmp).exists());
    }
}
