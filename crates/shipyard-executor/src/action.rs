//! Action dispatch.
//!
//! Every [`Action`] variant runs through an [`ActionHandler`]. Handlers for
//! release and rollout actions live in their own crate and are registered on
//! the [`StepExecutor`](crate::StepExecutor); everything else falls back to a
//! [`TemplateActionHandler`], which renders a configured command template and
//! hands it to the compute runner.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use shipyard_core::environment::interpolate;
use shipyard_core::{Action, ActionKind, PipelineError, RunId, Variables};

use crate::cancel::CancelSignal;
use crate::runner::{CommandSpec, ComputeRunner, StepResult};
use crate::{ExecutorErrorKind, ExecutorResult};

/// Command template per action name
pub type CommandTemplates = BTreeMap<String, String>;

/// Template used for `checkout` when none is configured
pub const DEFAULT_CHECKOUT_TEMPLATE: &str =
    "git clone --quiet ${clone-flags} \"${SHIPYARD_REPOSITORY}\" . && git checkout --quiet ${ref}";

/// Everything a handler may use while running one action
#[derive(Debug)]
pub struct ActionInvocation<'a> {
    /// Owning run
    pub run_id: RunId,
    /// Owning job
    pub job: &'a str,
    /// Step label
    pub step: &'a str,
    /// Commit the run builds
    pub commit: &'a str,
    /// Environment the job targets
    pub environment: Option<&'a str>,
    /// Job workspace
    pub working_dir: &'a Path,
    /// Step environment, secrets included
    pub env: &'a Variables,
    /// Time left for this attempt
    pub timeout: Duration,
    /// Cancellation for the job
    pub cancel: &'a CancelSignal,
    /// Runner for any commands the action needs
    pub runner: &'a dyn ComputeRunner,
}

/// Executes one kind of action
#[async_trait]
pub trait ActionHandler: Send + Sync + fmt::Debug {
    /// Runs `action`
    async fn execute(&self, action: &Action, invocation: &ActionInvocation<'_>) -> ExecutorResult<StepResult>;
}

/// Renders a command template and runs it
///
/// Templates see the action's inputs (`${target}`, `${credentials}`, ...) and
/// the step environment (`${SHIPYARD_COMMIT}`, ...). Inputs are also exported
/// to the command as `INPUT_<NAME>`. Credentials are secret *names*; the value
/// is in the step environment under that name, so a template reads it with
/// `$${credentials}`.
#[derive(Debug, Clone, Default)]
pub struct TemplateActionHandler {
    templates: CommandTemplates,
}

impl TemplateActionHandler {
    /// Creates a handler from configured templates
    #[must_use]
    pub fn new(templates: CommandTemplates) -> Self {
        Self { templates }
    }

    /// Names that have a configured template
    pub fn configured(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    fn template_for(&self, kind: ActionKind) -> Option<&str> {
        self.templates
            .get(kind.name())
            .map(String::as_str)
            .or(match kind {
                ActionKind::Checkout => Some(DEFAULT_CHECKOUT_TEMPLATE),
                _ => None,
            })
    }

    /// Template inputs for `action`, with run-dependent defaults filled in
    fn inputs(action: &Action, invocation: &ActionInvocation<'_>) -> BTreeMap<String, String> {
        let mut inputs = action.template_inputs();
        if let Action::Checkout { fetch_depth, .. } = action {
            inputs
                .entry("ref".to_string())
                .or_insert_with(|| invocation.commit.to_string());
            let flags = match fetch_depth {
                Some(depth) if *depth > 0 => format!("--depth {depth}"),
                _ => String::new(),
            };
            inputs.insert("clone-flags".to_string(), flags);
        }
        inputs
    }

    /// Renders the command line for `action`
    pub fn render(&self, action: &Action, invocation: &ActionInvocation<'_>) -> ExecutorResult<String> {
        let kind = action.kind();
        let template = self.template_for(kind).ok_or_else(|| ExecutorErrorKind::NoHandler {
            action: kind.name().to_string(),
        })?;
        let mut scope = invocation.env.clone();
        scope.extend(Self::inputs(action, invocation));
        Ok(interpolate(template, &scope))
    }
}

fn input_variable(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("INPUT_{name}")
}

#[async_trait]
impl ActionHandler for TemplateActionHandler {
    async fn execute(&self, action: &Action, invocation: &ActionInvocation<'_>) -> ExecutorResult<StepResult> {
        if matches!(action, Action::Checkout { .. })
            && self.templates.get(ActionKind::Checkout.name()).is_none()
            && !invocation.env.contains_key("SHIPYARD_REPOSITORY")
        {
            return Ok(StepResult::aborted(
                PipelineError::external("checkout", "no repository configured"),
                Duration::ZERO,
            ));
        }

        let command = self.render(action, invocation)?;
        tracing::debug!(job = %invocation.job, action = %action.kind(), "running action template");

        let mut env = invocation.env.clone();
        for (key, value) in Self::inputs(action, invocation) {
            env.insert(input_variable(&key), value);
        }
        let spec = CommandSpec::new(command, invocation.working_dir, invocation.timeout).with_env(env);
        invocation.runner.run_command(&spec, invocation.cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{LocalRunner, StepOutcome};
    use pretty_assertions::assert_eq;
    use shipyard_core::DeployTarget;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn sync_action() -> Action {
        Action::StorageSync(DeployTarget {
            credentials: "AWS_KEYS".to_string(),
            target: "s3://site".to_string(),
            payload: Some("dist".to_string()),
        })
    }

    fn invocation<'a>(
        dir: &'a Path,
        env: &'a Variables,
        cancel: &'a CancelSignal,
        runner: &'a dyn ComputeRunner,
    ) -> ActionInvocation<'a> {
        ActionInvocation {
            run_id: Uuid::nil(),
            job: "deploy",
            step: "sync",
            commit: "abc123",
            environment: Some("production"),
            working_dir: dir,
            env,
            timeout: Duration::from_secs(10),
            cancel,
            runner,
        }
    }

    #[test]
    fn test_render_uses_inputs_and_env() {
        let mut templates = CommandTemplates::new();
        templates.insert(
            "storage-sync".to_string(),
            "sync ${payload} ${target} --key \"$${credentials}\" --rev ${SHIPYARD_COMMIT}".to_string(),
        );
        let handler = TemplateActionHandler::new(templates);
        let dir = TempDir::new().unwrap();
        let mut env = Variables::new();
        env.insert("SHIPYARD_COMMIT".to_string(), "abc123".to_string());
        let cancel = CancelSignal::never();
        let runner = LocalRunner::default();

        let command = handler
            .render(&sync_action(), &invocation(dir.path(), &env, &cancel, &runner))
            .unwrap();
        assert_eq!(command, "sync dist s3://site --key \"$AWS_KEYS\" --rev abc123");
    }

    #[test]
    fn test_missing_template_is_an_error() {
        let handler = TemplateActionHandler::default();
        let dir = TempDir::new().unwrap();
        let env = Variables::new();
        let cancel = CancelSignal::never();
        let runner = LocalRunner::default();

        let err = handler
            .render(&sync_action(), &invocation(dir.path(), &env, &cancel, &runner))
            .unwrap_err();
        assert_eq!(err.to_string(), "no handler for action 'storage-sync'");
    }

    #[tokio::test]
    async fn test_execute_exports_inputs_and_secret_value() {
        let mut templates = CommandTemplates::new();
        templates.insert(
            "storage-sync".to_string(),
            "echo \"$INPUT_TARGET $INPUT_PAYLOAD $${credentials}\"".to_string(),
        );
        let handler = TemplateActionHandler::new(templates);
        let dir = TempDir::new().unwrap();
        let mut env = Variables::new();
        env.insert("AWS_KEYS".to_string(), "key-material".to_string());
        let cancel = CancelSignal::never();
        let runner = LocalRunner::default();

        let result = handler
            .execute(&sync_action(), &invocation(dir.path(), &env, &cancel, &runner))
            .await
            .unwrap();
        assert_eq!(result.outcome, StepOutcome::Succeeded);
        assert_eq!(result.stdout, "s3://site dist key-material\n");
    }

    #[tokio::test]
    async fn test_checkout_without_repository_aborts() {
        let handler = TemplateActionHandler::default();
        let dir = TempDir::new().unwrap();
        let env = Variables::new();
        let cancel = CancelSignal::never();
        let runner = LocalRunner::default();
        let checkout = Action::Checkout {
            reference: None,
            fetch_depth: None,
        };

        let result = handler
            .execute(&checkout, &invocation(dir.path(), &env, &cancel, &runner))
            .await
            .unwrap();
        assert!(matches!(result.outcome, StepOutcome::Aborted(PipelineError::External { .. })));
    }

    #[test]
    fn test_checkout_defaults_ref_to_commit() {
        let handler = TemplateActionHandler::default();
        let dir = TempDir::new().unwrap();
        let mut env = Variables::new();
        env.insert("SHIPYARD_REPOSITORY".to_string(), "/srv/repo".to_string());
        let cancel = CancelSignal::never();
        let runner = LocalRunner::default();
        let checkout = Action::Checkout {
            reference: None,
            fetch_depth: Some(1),
        };

        let command = handler
            .render(&checkout, &invocation(dir.path(), &env, &cancel, &runner))
            .unwrap();
        assert_eq!(
            command,
            "git clone --quiet --depth 1 \"/srv/repo\" . && git checkout --quiet abc123"
        );
    }
}
