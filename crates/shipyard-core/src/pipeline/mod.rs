//! Pipeline definition types and builders.
//!
//! A [`PipelineDefinition`] is the validated, immutable form of a definition
//! file. [`ResolvedPipeline`] pairs it with its [`DependencyGraph`]; only a
//! resolved pipeline can be run.

mod raw;

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::action::Action;
use crate::environment::{EnvironmentSpec, Variables};
use crate::error::{PipelineError, PipelineResult};
use crate::graph::DependencyGraph;
use crate::options::{PipelineOptions, Trigger};
use crate::validation::{Validate, ValidationContext, ValidationError, rules};

pub use raw::RawPipeline;

/// A validated pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    /// Pipeline name
    pub name: String,

    /// Source-control events that start a run
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,

    /// Execution options
    pub options: PipelineOptions,

    /// Declared environments
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<EnvironmentSpec>,

    /// Jobs in definition order
    pub jobs: Vec<Job>,
}

/// A named unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job name
    pub name: String,

    /// Jobs that must finish first
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prerequisites: Vec<String>,

    /// Prerequisites whose `Skipped` status still counts as satisfied
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub allow_skipped: BTreeSet<String>,

    /// Steps, run strictly in order
    pub steps: Vec<Step>,

    /// Environment the job deploys to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    /// Jobs sharing a group never run at the same time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency_group: Option<String>,

    /// Bound on the whole job
    #[serde(
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

/// What a step does
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
    /// Shell command
    Run {
        /// Command line handed to the shell
        command: String,
    },
    /// Named external action
    Uses {
        /// Resolved action
        action: Action,
    },
}

/// One sequential action within a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Label used in logs and failure reports
    pub name: String,

    /// Command or action
    pub kind: StepKind,

    /// Secret names injected for this step only
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub secrets: BTreeSet<String>,

    /// Plain environment variables
    #[serde(skip_serializing_if = "Variables::is_empty")]
    pub env: Variables,

    /// Step timeout; falls back to the pipeline and runner defaults
    #[serde(
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    /// Extra attempts after a failure or timeout
    pub retries: u32,
}

impl Step {
    /// Creates a shell step
    #[must_use]
    pub fn run(command: impl Into<String>) -> Self {
        let command = command.into();
        let name = command.lines().next().unwrap_or_default().trim().to_string();
        Self {
            name,
            kind: StepKind::Run { command },
            secrets: BTreeSet::new(),
            env: Variables::new(),
            timeout: None,
            retries: 0,
        }
    }

    /// Creates an action step
    #[must_use]
    pub fn uses(action: Action) -> Self {
        Self {
            name: action.kind().name().to_string(),
            kind: StepKind::Uses { action },
            secrets: BTreeSet::new(),
            env: Variables::new(),
            timeout: None,
            retries: 0,
        }
    }

    /// Sets the label
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Requests a secret
    #[must_use]
    pub fn with_secret(mut self, name: impl Into<String>) -> Self {
        self.secrets.insert(name.into());
        self
    }

    /// Sets a plain environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the retry count
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Action behind this step, if any
    #[must_use]
    pub fn action(&self) -> Option<&Action> {
        match &self.kind {
            StepKind::Uses { action } => Some(action),
            StepKind::Run { .. } => None,
        }
    }

    /// Every secret name the step needs, action credentials included
    #[must_use]
    pub fn required_secrets(&self) -> BTreeSet<&str> {
        let mut names: BTreeSet<&str> = self.secrets.iter().map(String::as_str).collect();
        if let Some(credentials) = self.action().and_then(Action::credentials) {
            names.insert(credentials);
        }
        names
    }
}

impl Job {
    /// Creates a job with no steps
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a prerequisite
    #[must_use]
    pub fn needs(mut self, prerequisite: impl Into<String>) -> Self {
        self.prerequisites.push(prerequisite.into());
        self
    }

    /// Adds a prerequisite whose skip does not block this job
    #[must_use]
    pub fn needs_or_skipped(mut self, prerequisite: impl Into<String>) -> Self {
        let prerequisite = prerequisite.into();
        self.allow_skipped.insert(prerequisite.clone());
        self.prerequisites.push(prerequisite);
        self
    }

    /// Adds a step
    #[must_use]
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Binds the job to an environment
    #[must_use]
    pub fn in_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Puts the job in a concurrency group
    #[must_use]
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.concurrency_group = Some(group.into());
        self
    }

    /// Bounds the whole job
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl PipelineDefinition {
    /// Creates an empty definition
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triggers: Vec::new(),
            options: PipelineOptions::default(),
            environments: Vec::new(),
            jobs: Vec::new(),
        }
    }

    /// Sets the options
    #[must_use]
    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Adds a trigger
    #[must_use]
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Declares an environment
    #[must_use]
    pub fn with_environment(mut self, environment: EnvironmentSpec) -> Self {
        self.environments.push(environment);
        self
    }

    /// Adds a job
    #[must_use]
    pub fn with_job(mut self, job: Job) -> Self {
        self.jobs.push(job);
        self
    }

    /// Parses and validates a YAML definition
    pub fn from_yaml(source: &str) -> PipelineResult<Self> {
        let raw: RawPipeline = serde_yaml::from_str(source).map_err(|e| {
            ValidationError::Malformed {
                reason: e.to_string(),
            }
        })?;
        let definition = raw.into_definition(&crate::action::ActionRegistry::builtin())?;
        definition.validate()?;
        Ok(definition)
    }

    /// Looks up a declared environment
    #[must_use]
    pub fn environment(&self, name: &str) -> Option<&EnvironmentSpec> {
        self.environments.iter().find(|e| e.name == name)
    }

    /// Looks up a job
    #[must_use]
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Builds the dependency graph; cycles and dangling names fail here
    pub fn resolve(self) -> PipelineResult<ResolvedPipeline> {
        self.validate()?;
        let graph = DependencyGraph::build(self.jobs.iter().map(|job| {
            (
                job.name.as_str(),
                job.prerequisites.iter().map(String::as_str),
            )
        }))?;
        tracing::debug!(pipeline = %self.name, jobs = graph.len(), "resolved dependency graph");
        Ok(ResolvedPipeline {
            definition: self,
            graph,
        })
    }

    fn validate_job(&self, job: &Job, ctx: &mut ValidationContext) -> Result<(), ValidationError> {
        rules::validate_name(&job.name)?;
        if job.steps.is_empty() {
            return Err(ValidationError::EmptySteps {
                job: job.name.clone(),
            });
        }

        let mut seen = HashSet::new();
        for prerequisite in &job.prerequisites {
            if !seen.insert(prerequisite.as_str()) {
                return Err(ValidationError::DuplicatePrerequisite {
                    job: job.name.clone(),
                    prerequisite: prerequisite.clone(),
                });
            }
            if self.job(prerequisite).is_none() {
                return Err(ValidationError::DanglingPrerequisite {
                    job: job.name.clone(),
                    prerequisite: prerequisite.clone(),
                });
            }
        }
        if let Some(name) = job.allow_skipped.iter().find(|n| !seen.contains(n.as_str())) {
            return Err(ValidationError::InvalidAllowSkipped {
                job: job.name.clone(),
                name: name.clone(),
            });
        }

        let environment = match &job.environment {
            Some(name) => Some(self.environment(name).ok_or_else(|| {
                ValidationError::UnknownEnvironment {
                    job: job.name.clone(),
                    environment: name.clone(),
                }
            })?),
            None => None,
        };

        if let Some(timeout) = job.timeout {
            ctx.push("timeout");
            rules::validate_timeout(timeout).map_err(|e| ctx.wrap(e))?;
            ctx.pop();
        }

        for (i, step) in job.steps.iter().enumerate() {
            for secret in step.required_secrets() {
                if !environment.is_some_and(|env| env.provides(secret)) {
                    return Err(ValidationError::UnscopedSecret {
                        job: job.name.clone(),
                        secret: secret.to_string(),
                    });
                }
            }
            ctx.push(format!("steps[{i}]"));
            if let Some(timeout) = step.timeout {
                rules::validate_timeout(timeout).map_err(|e| ctx.wrap(e))?;
            }
            rules::validate_retry(step.retries).map_err(|e| ctx.wrap(e))?;
            if let StepKind::Run { command } = &step.kind
                && command.trim().is_empty()
            {
                return Err(ValidationError::InvalidStep {
                    job: job.name.clone(),
                    reason: format!("step {} has an empty command", i + 1),
                });
            }
            ctx.pop();
        }
        Ok(())
    }
}

impl Validate for PipelineDefinition {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        rules::validate_name(&self.name)?;
        if self.jobs.is_empty() {
            return Err(ValidationError::EmptyJobs);
        }
        self.options.validate()?;
        self.triggers.validate()?;

        let mut environments = HashSet::new();
        for environment in &self.environments {
            environment.validate()?;
            if !environments.insert(environment.name.as_str()) {
                return Err(ValidationError::DuplicateEnvironment {
                    name: environment.name.clone(),
                });
            }
        }

        rules::validate_unique_jobs(self.jobs.iter().map(|j| j.name.as_str()))?;

        let mut ctx = ValidationContext::new();
        for job in &self.jobs {
            ctx.push(format!("jobs.{}", job.name));
            self.validate_job(job, &mut ctx)?;
            ctx.pop();
        }
        Ok(())
    }
}

/// A definition together with its resolved dependency graph
#[derive(Debug, Clone)]
pub struct ResolvedPipeline {
    definition: PipelineDefinition,
    graph: DependencyGraph,
}

impl ResolvedPipeline {
    /// Parses, validates and resolves a YAML definition
    pub fn load(source: &str) -> PipelineResult<Self> {
        PipelineDefinition::from_yaml(source)?.resolve()
    }

    /// Reads and loads a definition file
    pub fn from_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::from(ValidationError::Malformed {
                reason: format!("cannot read {}: {e}", path.display()),
            })
        })?;
        Self::load(&source)
    }

    /// The definition
    #[must_use]
    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// The dependency graph
    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Job at a graph index
    #[must_use]
    pub fn job_at(&self, index: usize) -> &Job {
        &self.definition.jobs[index]
    }

    /// Environment a job is bound to, if any
    #[must_use]
    pub fn environment_of(&self, job: &Job) -> Option<&EnvironmentSpec> {
        job.environment
            .as_deref()
            .and_then(|name| self.definition.environment(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, DeployTarget};
    use pretty_assertions::assert_eq;

    const DEFINITION: &str = r#"
name: web
triggers:
  - push:
      branches: [main]
options:
  failFast: false
  approvalTimeout: 1h
environments:
  - name: staging
    secrets: [AWS_KEYS]
  - name: production
    requiredApprovers: [alice]
    secrets: [AWS_KEYS]
jobs:
  - name: lint
    steps:
      - run: cargo clippy
  - name: test
    needs: [lint]
    steps:
      - name: unit
        run: cargo test
        retries: 1
        timeout: 10m
  - name: build
    needs: [test]
    steps:
      - run: npm run build
  - name: deploy-staging
    needs: [build]
    environment: staging
    steps:
      - uses: storage-sync
        with:
          credentials: AWS_KEYS
          target: staging-bucket
          payload: ./dist
  - name: deploy-production
    needs: [deploy-staging]
    environment: production
    concurrencyGroup: production
    steps:
      - uses: storage-sync
        with:
          credentials: AWS_KEYS
          target: prod-bucket
"#;

    fn config_error(source: &str) -> ValidationError {
        match ResolvedPipeline::load(source) {
            Err(PipelineError::ConfigurationError(e)) => e,
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_full_definition() {
        let pipeline = ResolvedPipeline::load(DEFINITION).unwrap();
        let def = pipeline.definition();
        assert_eq!(def.name, "web");
        assert_eq!(def.jobs.len(), 5);
        assert_eq!(
            pipeline.graph().ordered_names(),
            vec!["lint", "test", "build", "deploy-staging", "deploy-production"]
        );

        let test = def.job("test").unwrap();
        assert_eq!(test.steps[0].name, "unit");
        assert_eq!(test.steps[0].retries, 1);
        assert_eq!(test.steps[0].timeout, Some(Duration::from_secs(600)));

        let prod = def.job("deploy-production").unwrap();
        assert_eq!(prod.concurrency_group.as_deref(), Some("production"));
        assert!(pipeline.environment_of(prod).unwrap().is_gated());
        assert_eq!(
            prod.steps[0].action(),
            Some(&Action::StorageSync(DeployTarget {
                credentials: "AWS_KEYS".to_string(),
                target: "prod-bucket".to_string(),
                payload: None,
            }))
        );
    }

    #[test]
    fn test_triggers_load_from_maps() {
        let def = PipelineDefinition::from_yaml(
            "name: web\ntriggers:\n  - push:\n      branches: [main, release/*]\n  - tag:\n      pattern: v*\njobs:\n  - name: build\n    steps:\n      - run: make\n",
        )
        .unwrap();
        assert_eq!(
            def.triggers,
            vec![
                Trigger::Push {
                    branches: vec!["main".to_string(), "release/*".to_string()],
                },
                Trigger::Tag {
                    pattern: "v*".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_dangling_prerequisite_fails_load() {
        let err = config_error("name: p\njobs:\n  - name: deploy\n    needs: [biuld]\n    steps:\n      - run: x\n");
        assert_eq!(
            err,
            ValidationError::DanglingPrerequisite {
                job: "deploy".to_string(),
                prerequisite: "biuld".to_string(),
            }
        );
    }

    #[test]
    fn test_cycle_fails_load() {
        let err = ResolvedPipeline::load(
            "name: p\njobs:\n  - name: a\n    needs: [b]\n    steps: [{run: x}]\n  - name: b\n    needs: [a]\n    steps: [{run: x}]\n",
        )
        .unwrap_err();
        assert_eq!(
            err,
            PipelineError::CycleDetected {
                jobs: vec!["a".to_string(), "b".to_string(), "a".to_string()]
            }
        );
    }

    #[test]
    fn test_unknown_action_fails_load() {
        let err = config_error("name: p\njobs:\n  - name: a\n    steps:\n      - uses: teleport\n");
        assert!(matches!(err, ValidationError::UnknownAction { ref action, .. } if action == "teleport"));
    }

    #[test]
    fn test_duplicate_input_key_is_malformed() {
        let err = config_error(
            "name: p\njobs:\n  - name: a\n    steps:\n      - uses: setup-runtime\n        with:\n          runtime: node\n          runtime: deno\n          version: '20'\n",
        );
        assert!(matches!(err, ValidationError::Malformed { .. }));
    }

    #[test]
    fn test_step_needs_exactly_one_of_run_or_uses() {
        let err = config_error("name: p\njobs:\n  - name: a\n    steps:\n      - name: nothing\n");
        assert!(matches!(err, ValidationError::InvalidStep { .. }));

        let err = config_error(
            "name: p\njobs:\n  - name: a\n    steps:\n      - run: x\n        uses: checkout\n",
        );
        assert!(matches!(err, ValidationError::InvalidStep { .. }));
    }

    #[test]
    fn test_secret_must_be_scoped_to_environment() {
        let def = PipelineDefinition::new("p")
            .with_environment(EnvironmentSpec::new("staging").with_secret("TOKEN"))
            .with_job(
                Job::new("deploy")
                    .in_environment("staging")
                    .with_step(Step::run("deploy").with_secret("OTHER")),
            );
        assert_eq!(
            def.validate(),
            Err(ValidationError::UnscopedSecret {
                job: "deploy".to_string(),
                secret: "OTHER".to_string(),
            })
        );

        let def = PipelineDefinition::new("p")
            .with_job(Job::new("build").with_step(Step::run("make").with_secret("TOKEN")));
        assert!(matches!(def.validate(), Err(ValidationError::UnscopedSecret { .. })));
    }

    #[test]
    fn test_allow_skipped_must_be_prerequisite() {
        let mut job = Job::new("b").with_step(Step::run("x"));
        job.allow_skipped.insert("a".to_string());
        let def = PipelineDefinition::new("p")
            .with_job(Job::new("a").with_step(Step::run("x")))
            .with_job(job);
        assert!(matches!(def.validate(), Err(ValidationError::InvalidAllowSkipped { .. })));
    }

    #[test]
    fn test_invalid_step_timeout_carries_path() {
        let def = PipelineDefinition::new("p").with_job(
            Job::new("a").with_step(Step::run("x").with_timeout(Duration::ZERO)),
        );
        let err = def.validate().unwrap_err();
        assert!(matches!(err, ValidationError::WithPath { ref path, .. } if path == "jobs.a.steps[0]"));
    }

    #[test]
    fn test_unknown_environment_and_empty_pipeline() {
        let def = PipelineDefinition::new("p")
            .with_job(Job::new("a").in_environment("moon").with_step(Step::run("x")));
        assert!(matches!(def.validate(), Err(ValidationError::UnknownEnvironment { .. })));
        assert_eq!(PipelineDefinition::new("p").validate(), Err(ValidationError::EmptyJobs));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = config_error("name: [unclosed");
        assert!(matches!(err, ValidationError::Malformed { .. }));
    }
}
