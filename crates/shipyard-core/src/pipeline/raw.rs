//! File format of a pipeline definition.
//!
//! These types mirror the YAML one to one. Converting them into a
//! [`PipelineDefinition`] resolves every `uses:` through the action registry.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;

use super::{Job, PipelineDefinition, Step};
use crate::action::{ActionInputs, ActionRegistry};
use crate::environment::{EnvironmentSpec, Variables};
use crate::options::{PipelineOptions, Trigger};
use crate::validation::{ValidationError, ValidationResult};

/// Top level of a definition file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawPipeline {
    name: String,
    /// Written as `- push: {...}` / `- tag: {...}` maps rather than YAML tags
    #[serde(default, deserialize_with = "serde_yaml::with::singleton_map_recursive::deserialize")]
    triggers: Vec<Trigger>,
    #[serde(default)]
    options: PipelineOptions,
    #[serde(default)]
    environments: Vec<EnvironmentSpec>,
    #[serde(default)]
    jobs: Vec<RawJob>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawJob {
    name: String,
    #[serde(default, alias = "prerequisites")]
    needs: Vec<String>,
    #[serde(default)]
    allow_skipped: BTreeSet<String>,
    #[serde(default)]
    environment: Option<String>,
    #[serde(default)]
    concurrency_group: Option<String>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawStep {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    run: Option<String>,
    #[serde(default)]
    uses: Option<String>,
    /// `Mapping` rejects duplicate keys while parsing
    #[serde(default)]
    with: Option<serde_yaml::Mapping>,
    #[serde(default)]
    secrets: BTreeSet<String>,
    #[serde(default)]
    env: Variables,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    #[serde(default)]
    retries: u32,
}

impl RawPipeline {
    /// Converts into a definition, resolving actions through `registry`
    pub fn into_definition(self, registry: &ActionRegistry) -> ValidationResult<PipelineDefinition> {
        let jobs = self
            .jobs
            .into_iter()
            .map(|job| job.into_job(registry))
            .collect::<ValidationResult<Vec<_>>>()?;
        Ok(PipelineDefinition {
            name: self.name,
            triggers: self.triggers,
            options: self.options,
            environments: self.environments,
            jobs,
        })
    }
}

impl RawJob {
    fn into_job(self, registry: &ActionRegistry) -> ValidationResult<Job> {
        let name = self.name;
        let steps = self
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| step.into_step(&name, i, registry))
            .collect::<ValidationResult<Vec<_>>>()?;
        Ok(Job {
            prerequisites: self.needs,
            allow_skipped: self.allow_skipped,
            steps,
            environment: self.environment,
            concurrency_group: self.concurrency_group,
            timeout: self.timeout,
            name,
        })
    }
}

impl RawStep {
    fn into_step(self, job: &str, index: usize, registry: &ActionRegistry) -> ValidationResult<Step> {
        let invalid = |reason: &str| ValidationError::InvalidStep {
            job: job.to_string(),
            reason: format!("step {}: {reason}", index + 1),
        };

        let mut step = match (self.run, self.uses) {
            (Some(command), None) => {
                if self.with.is_some() {
                    return Err(invalid("`with` requires `uses`"));
                }
                Step::run(command)
            }
            (None, Some(uses)) => {
                let inputs = convert_inputs(job, &uses, self.with.unwrap_or_default())?;
                Step::uses(registry.resolve(job, &uses, inputs)?)
            }
            (Some(_), Some(_)) => return Err(invalid("`run` and `uses` are mutually exclusive")),
            (None, None) => return Err(invalid("one of `run` or `uses` is required")),
        };

        if let Some(name) = self.name {
            step.name = name;
        }
        if step.name.is_empty() {
            step.name = format!("step-{}", index + 1);
        }
        step.secrets = self.secrets;
        step.env = self.env;
        step.timeout = self.timeout;
        step.retries = self.retries;
        Ok(step)
    }
}

fn convert_inputs(job: &str, action: &str, mapping: serde_yaml::Mapping) -> ValidationResult<ActionInputs> {
    mapping
        .into_iter()
        .map(|(key, value)| match key {
            serde_yaml::Value::String(key) => Ok((key, value)),
            other => Err(ValidationError::InvalidStep {
                job: job.to_string(),
                reason: format!("input keys of '{action}' must be strings, got {other:?}"),
            }),
        })
        .collect()
}
