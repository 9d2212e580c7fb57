//! External actions and the registry that resolves them.
//!
//! Definition files name actions by string (`uses: storage-sync`). Loading
//! turns each name into one variant of the closed [`Action`] enum through an
//! [`ActionRegistry`], so an unknown name or a missing input is a
//! configuration error before any job starts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::release::BumpPolicy;
use crate::rollout::{ProbeSpec, RolloutPlan, RolloutStrategy, Weight};
use crate::validation::{Validate, ValidationError, ValidationResult};

/// Raw `with:` block of a step
pub type ActionInputs = BTreeMap<String, serde_yaml::Value>;

/// Fixed input schema shared by the cloud deploy actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployTarget {
    /// Secret name holding the provider credentials
    pub credentials: String,
    /// Bucket, distribution, app or cluster identifier
    pub target: String,
    /// Path of the payload inside the job workspace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// Every external action the engine knows how to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Action {
    /// Check the pipeline's commit out into the job workspace
    Checkout {
        /// Ref to check out; defaults to the run's commit
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
        /// Shallow clone depth; `None` fetches full history
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fetch_depth: Option<u32>,
    },
    /// Install a language runtime
    SetupRuntime {
        /// Runtime name, e.g. `node`
        runtime: String,
        /// Requested version
        version: String,
    },
    /// Authenticate against a cloud provider
    CloudLogin {
        /// Provider name
        provider: String,
        /// Secret name holding the credentials
        credentials: String,
    },
    /// Object-storage sync
    StorageSync(DeployTarget),
    /// Content-delivery cache invalidation
    CdnInvalidate(DeployTarget),
    /// Managed web-app deploy
    WebAppDeploy(DeployTarget),
    /// Container-cluster apply
    ClusterApply(DeployTarget),
    /// Compute the next version and create a release
    TagRelease {
        /// Component to increment
        bump: BumpPolicy,
        /// Artifact references attached to the release
        #[serde(default)]
        artifacts: Vec<String>,
    },
    /// Canary or blue-green promotion
    Rollout(RolloutPlan),
}

/// Discriminant of [`Action`], used to look up handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionKind {
    /// [`Action::Checkout`]
    Checkout,
    /// [`Action::SetupRuntime`]
    SetupRuntime,
    /// [`Action::CloudLogin`]
    CloudLogin,
    /// [`Action::StorageSync`]
    StorageSync,
    /// [`Action::CdnInvalidate`]
    CdnInvalidate,
    /// [`Action::WebAppDeploy`]
    WebAppDeploy,
    /// [`Action::ClusterApply`]
    ClusterApply,
    /// [`Action::TagRelease`]
    TagRelease,
    /// [`Action::Rollout`]
    Rollout,
}

impl ActionKind {
    /// Canonical action name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::SetupRuntime => "setup-runtime",
            Self::CloudLogin => "cloud-login",
            Self::StorageSync => "storage-sync",
            Self::CdnInvalidate => "cdn-invalidate",
            Self::WebAppDeploy => "webapp-deploy",
            Self::ClusterApply => "cluster-apply",
            Self::TagRelease => "tag-release",
            Self::Rollout => "rollout",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Action {
    /// Discriminant of this action
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Checkout { .. } => ActionKind::Checkout,
            Self::SetupRuntime { .. } => ActionKind::SetupRuntime,
            Self::CloudLogin { .. } => ActionKind::CloudLogin,
            Self::StorageSync(_) => ActionKind::StorageSync,
            Self::CdnInvalidate(_) => ActionKind::CdnInvalidate,
            Self::WebAppDeploy(_) => ActionKind::WebAppDeploy,
            Self::ClusterApply(_) => ActionKind::ClusterApply,
            Self::TagRelease { .. } => ActionKind::TagRelease,
            Self::Rollout(_) => ActionKind::Rollout,
        }
    }

    /// Secret name this action reads its credentials from, if any
    #[must_use]
    pub fn credentials(&self) -> Option<&str> {
        match self {
            Self::CloudLogin { credentials, .. } => Some(credentials),
            Self::StorageSync(t) | Self::CdnInvalidate(t) | Self::WebAppDeploy(t) | Self::ClusterApply(t) => {
                Some(&t.credentials)
            }
            _ => None,
        }
    }

    /// Flattens the inputs into `name -> value` pairs for command templates
    #[must_use]
    pub fn template_inputs(&self) -> BTreeMap<String, String> {
        let mut inputs = BTreeMap::new();
        let mut put = |key: &str, value: String| {
            inputs.insert(key.to_string(), value);
        };
        match self {
            Self::Checkout {
                reference,
                fetch_depth,
            } => {
                if let Some(reference) = reference {
                    put("ref", reference.clone());
                }
                put("fetch-depth", fetch_depth.unwrap_or(0).to_string());
            }
            Self::SetupRuntime { runtime, version } => {
                put("runtime", runtime.clone());
                put("version", version.clone());
            }
            Self::CloudLogin {
                provider,
                credentials,
            } => {
                put("provider", provider.clone());
                put("credentials", credentials.clone());
            }
            Self::StorageSync(t) | Self::CdnInvalidate(t) | Self::WebAppDeploy(t) | Self::ClusterApply(t) => {
                put("credentials", t.credentials.clone());
                put("target", t.target.clone());
                put("payload", t.payload.clone().unwrap_or_else(|| ".".to_string()));
            }
            Self::TagRelease { bump, artifacts } => {
                put("bump", bump.to_string());
                put("artifacts", artifacts.join(","));
            }
            Self::Rollout(plan) => {
                put("target", plan.target.clone());
            }
        }
        inputs
    }
}

/// Typed access to a `with:` block; every key must be consumed
struct Inputs<'a> {
    action: &'a str,
    values: ActionInputs,
}

impl<'a> Inputs<'a> {
    fn new(action: &'a str, values: ActionInputs) -> Self {
        Self { action, values }
    }

    fn invalid(&self, input: &str, reason: impl Into<String>) -> ValidationError {
        ValidationError::InvalidInput {
            action: self.action.to_string(),
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    fn optional_str(&mut self, key: &str) -> ValidationResult<Option<String>> {
        match self.values.remove(key) {
            None | Some(serde_yaml::Value::Null) => Ok(None),
            Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
            Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
            Some(serde_yaml::Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(_) => Err(self.invalid(key, "expected a scalar value")),
        }
    }

    fn required_str(&mut self, key: &str) -> ValidationResult<String> {
        match self.optional_str(key)? {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(ValidationError::MissingInput {
                action: self.action.to_string(),
                input: key.to_string(),
            }),
        }
    }

    fn optional_u32(&mut self, key: &str) -> ValidationResult<Option<u32>> {
        match self.optional_str(key)? {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(key, "expected a non-negative integer")),
        }
    }

    fn duration(&mut self, key: &str, default: Duration) -> ValidationResult<Duration> {
        match self.optional_str(key)? {
            None => Ok(default),
            Some(raw) => humantime::parse_duration(&raw)
                .map_err(|e| self.invalid(key, e.to_string())),
        }
    }

    fn list<T: serde::de::DeserializeOwned>(&mut self, key: &str) -> ValidationResult<Vec<T>> {
        match self.values.remove(key) {
            None | Some(serde_yaml::Value::Null) => Ok(Vec::new()),
            Some(value) => {
                serde_yaml::from_value(value).map_err(|e| self.invalid(key, e.to_string()))
            }
        }
    }

    fn finish<T>(self, value: T) -> ValidationResult<T> {
        match self.values.keys().next() {
            Some(extra) => Err(self.invalid(extra, "unknown input")),
            None => Ok(value),
        }
    }
}

fn deploy_target(inputs: &mut Inputs<'_>) -> ValidationResult<DeployTarget> {
    Ok(DeployTarget {
        credentials: inputs.required_str("credentials")?,
        target: inputs.required_str("target")?,
        payload: inputs.optional_str("payload")?,
    })
}

fn rollout_plan(
    inputs: &mut Inputs<'_>,
    fixed: Option<RolloutStrategy>,
) -> ValidationResult<RolloutPlan> {
    let target = inputs.required_str("target")?;
    let strategy = match fixed {
        Some(strategy) => strategy,
        None => match inputs.optional_str("strategy")?.as_deref() {
            None | Some("canary") => RolloutStrategy::default_canary(),
            Some("blue-green") => RolloutStrategy::BlueGreen,
            Some(other) => {
                return Err(inputs.invalid(
                    "strategy",
                    format!("expected canary or blue-green, got '{other}'"),
                ));
            }
        },
    };
    let strategy = match strategy {
        RolloutStrategy::Canary { weights } => {
            let custom: Vec<Weight> = inputs.list("weights")?;
            RolloutStrategy::Canary {
                weights: if custom.is_empty() { weights } else { custom },
            }
        }
        RolloutStrategy::BlueGreen => RolloutStrategy::BlueGreen,
    };
    let dwell = inputs.duration("dwell", RolloutPlan::DEFAULT_DWELL)?;
    let probe_interval = inputs.duration("probe-interval", RolloutPlan::DEFAULT_PROBE_INTERVAL)?;
    let probes: Vec<ProbeSpec> = inputs.list("probes")?;

    let plan = RolloutPlan {
        target,
        strategy,
        dwell,
        probe_interval,
        probes,
    };
    plan.validate()?;
    Ok(plan)
}

type Constructor = fn(&mut Inputs<'_>) -> ValidationResult<Action>;

/// Maps action names to variant constructors
pub struct ActionRegistry {
    constructors: BTreeMap<&'static str, Constructor>,
}

impl ActionRegistry {
    /// Registry with every built-in action
    #[must_use]
    pub fn builtin() -> Self {
        let mut constructors: BTreeMap<&'static str, Constructor> = BTreeMap::new();
        constructors.insert("checkout", |i| {
            Ok(Action::Checkout {
                reference: i.optional_str("ref")?,
                fetch_depth: i.optional_u32("fetch-depth")?,
            })
        });
        constructors.insert("setup-runtime", |i| {
            Ok(Action::SetupRuntime {
                runtime: i.required_str("runtime")?,
                version: i.required_str("version")?,
            })
        });
        constructors.insert("cloud-login", |i| {
            Ok(Action::CloudLogin {
                provider: i.required_str("provider")?,
                credentials: i.required_str("credentials")?,
            })
        });
        constructors.insert("storage-sync", |i| Ok(Action::StorageSync(deploy_target(i)?)));
        constructors.insert("cdn-invalidate", |i| Ok(Action::CdnInvalidate(deploy_target(i)?)));
        constructors.insert("webapp-deploy", |i| Ok(Action::WebAppDeploy(deploy_target(i)?)));
        constructors.insert("cluster-apply", |i| Ok(Action::ClusterApply(deploy_target(i)?)));
        constructors.insert("tag-release", |i| {
            let bump = match i.optional_str("bump")? {
                Some(raw) => raw.parse()?,
                None => BumpPolicy::default(),
            };
            Ok(Action::TagRelease {
                bump,
                artifacts: i.list("artifacts")?,
            })
        });
        constructors.insert("rollout", |i| Ok(Action::Rollout(rollout_plan(i, None)?)));
        constructors.insert("canary-rollout", |i| {
            Ok(Action::Rollout(rollout_plan(
                i,
                Some(RolloutStrategy::default_canary()),
            )?))
        });
        constructors.insert("blue-green", |i| {
            Ok(Action::Rollout(rollout_plan(i, Some(RolloutStrategy::BlueGreen))?))
        });
        Self { constructors }
    }

    /// Registered action names
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }

    /// Returns true if `name` is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Builds the action `name` from its `with:` block
    pub fn resolve(&self, job: &str, name: &str, with: ActionInputs) -> ValidationResult<Action> {
        let (key, constructor) =
            self.constructors
                .get_key_value(name)
                .ok_or_else(|| ValidationError::UnknownAction {
                    job: job.to_string(),
                    action: name.to_string(),
                })?;
        let mut inputs = Inputs::new(key, with);
        let action = constructor(&mut inputs)?;
        inputs.finish(action)
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn with(yaml: &str) -> ActionInputs {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_resolve_deploy_action() {
        let registry = ActionRegistry::builtin();
        let action = registry
            .resolve(
                "deploy",
                "storage-sync",
                with("credentials: AWS_KEYS\ntarget: my-bucket\npayload: ./dist\n"),
            )
            .unwrap();
        assert_eq!(
            action,
            Action::StorageSync(DeployTarget {
                credentials: "AWS_KEYS".to_string(),
                target: "my-bucket".to_string(),
                payload: Some("./dist".to_string()),
            })
        );
        assert_eq!(action.credentials(), Some("AWS_KEYS"));
        assert_eq!(action.kind().name(), "storage-sync");
    }

    #[test]
    fn test_unknown_action_is_configuration_error() {
        let registry = ActionRegistry::builtin();
        let err = registry.resolve("deploy", "teleport", ActionInputs::new()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownAction {
                job: "deploy".to_string(),
                action: "teleport".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_and_unknown_inputs() {
        let registry = ActionRegistry::builtin();
        let err = registry
            .resolve("deploy", "cluster-apply", with("target: prod\n"))
            .unwrap_err();
        assert!(matches!(err, ValidationError::MissingInput { ref input, .. } if input == "credentials"));

        let err = registry
            .resolve("setup", "setup-runtime", with("runtime: node\nversion: 20\ncolour: red\n"))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidInput { ref input, .. } if input == "colour"));
    }

    #[test]
    fn test_numeric_inputs_are_accepted_as_strings() {
        let registry = ActionRegistry::builtin();
        let action = registry
            .resolve("setup", "setup-runtime", with("runtime: node\nversion: 20\n"))
            .unwrap();
        assert_eq!(
            action,
            Action::SetupRuntime {
                runtime: "node".to_string(),
                version: "20".to_string(),
            }
        );
    }

    #[test]
    fn test_tag_release_defaults_to_patch() {
        let registry = ActionRegistry::builtin();
        let action = registry.resolve("release", "tag-release", ActionInputs::new()).unwrap();
        assert_eq!(
            action,
            Action::TagRelease {
                bump: BumpPolicy::Patch,
                artifacts: vec![],
            }
        );
        assert!(registry.resolve("release", "tag-release", with("bump: huge\n")).is_err());
    }

    #[test]
    fn test_canary_rollout_inputs() {
        let registry = ActionRegistry::builtin();
        let action = registry
            .resolve(
                "promote",
                "canary-rollout",
                with(
                    "target: web\nweights: [5, 25, 100]\ndwell: 30s\nprobe-interval: 5s\nprobes:\n  - name: health\n    http:\n      url: https://web/healthz\n",
                ),
            )
            .unwrap();
        let Action::Rollout(plan) = action else {
            panic!("expected rollout");
        };
        assert_eq!(
            plan.strategy,
            RolloutStrategy::Canary {
                weights: vec![5, 25, 100]
            }
        );
        assert_eq!(plan.dwell, Duration::from_secs(30));
        assert_eq!(plan.probes.len(), 1);

        let err = registry
            .resolve("promote", "canary-rollout", with("target: web\nweights: [50, 10]\n"))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidInput { .. }));
    }

    #[test]
    fn test_blue_green_alias() {
        let registry = ActionRegistry::builtin();
        let action = registry.resolve("swap", "blue-green", with("target: web\n")).unwrap();
        assert!(matches!(
            action,
            Action::Rollout(RolloutPlan {
                strategy: RolloutStrategy::BlueGreen,
                ..
            })
        ));
        assert!(registry.contains("rollout"));
        assert!(registry.names().count() >= 11);
    }
}
