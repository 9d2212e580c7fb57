//! Traffic routers.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use shipyard_core::environment::interpolate;
use shipyard_core::rollout::Weight;
use shipyard_core::Variables;
use shipyard_executor::{CancelSignal, CommandSpec, ComputeRunner, StepOutcome};

use crate::{ReleaseErrorKind, ReleaseResult};

/// Shifts a share of a target's traffic to the new version
#[async_trait]
pub trait TrafficRouter: Send + Sync + std::fmt::Debug {
    /// Routes `weight` percent of `target` to the new version
    async fn set_weight(&self, target: &str, weight: Weight) -> ReleaseResult;
}

/// Runs a configured command to change weights
///
/// The template sees `${target}` and `${weight}`; the command also gets them
/// as `SHIPYARD_TRAFFIC_TARGET` and `SHIPYARD_TRAFFIC_WEIGHT`. Router commands
/// ignore cancellation so a rollback always runs to completion.
#[derive(Debug, Clone)]
pub struct CommandTrafficRouter {
    runner: Arc<dyn ComputeRunner>,
    template: String,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandTrafficRouter {
    /// Default time a router command may take
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    /// Router running `template` through `runner`
    pub fn new(runner: Arc<dyn ComputeRunner>, template: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            template: template.into(),
            working_dir: working_dir.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Overrides the command timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TrafficRouter for CommandTrafficRouter {
    async fn set_weight(&self, target: &str, weight: Weight) -> ReleaseResult {
        let vars = Variables::from([
            ("target".to_string(), target.to_string()),
            ("weight".to_string(), weight.to_string()),
        ]);
        let env = Variables::from([
            ("SHIPYARD_TRAFFIC_TARGET".to_string(), target.to_string()),
            ("SHIPYARD_TRAFFIC_WEIGHT".to_string(), weight.to_string()),
        ]);
        let spec = CommandSpec::new(interpolate(&self.template, &vars), &self.working_dir, self.timeout).with_env(env);

        let result = self.runner.run_command(&spec, &CancelSignal::never()).await?;
        if !result.outcome.is_success() {
            let reason = match &result.outcome {
                StepOutcome::Aborted(e) => e.to_string(),
                outcome => {
                    let output = result.combined_output();
                    format!("{outcome}: {}", output.trim())
                }
            };
            return Err(ReleaseErrorKind::Router {
                target: target.to_string(),
                weight,
                reason,
            }
            .into());
        }
        info!(deployment = %target, weight, "traffic weight set");
        Ok(())
    }
}
