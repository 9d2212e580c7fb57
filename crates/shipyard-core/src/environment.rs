//! Deployment environments and variable interpolation.
//!
//! An [`EnvironmentSpec`] names a deployment target, the identities that must
//! approve jobs bound to it, and the secret names scoped to it. Secret
//! *values* never live here; they are looked up from the secret store for the
//! duration of one step.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::validation::{Validate, ValidationError, rules};

/// A named deployment target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    /// Environment name, e.g. `production`
    pub name: String,

    /// Identities that must all approve before a job may proceed
    #[serde(default)]
    pub required_approvers: BTreeSet<String>,

    /// Secret names available to jobs bound to this environment
    #[serde(default)]
    pub secrets: BTreeSet<String>,
}

impl EnvironmentSpec {
    /// Creates an ungated environment with no secrets
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a required approver
    #[must_use]
    pub fn with_approver(mut self, identity: impl Into<String>) -> Self {
        self.required_approvers.insert(identity.into());
        self
    }

    /// Scopes a secret name to this environment
    #[must_use]
    pub fn with_secret(mut self, name: impl Into<String>) -> Self {
        self.secrets.insert(name.into());
        self
    }

    /// Returns true if jobs bound here need approval
    #[must_use]
    pub fn is_gated(&self) -> bool {
        !self.required_approvers.is_empty()
    }

    /// Returns true if `secret` is scoped to this environment
    #[must_use]
    pub fn provides(&self, secret: &str) -> bool {
        self.secrets.contains(secret)
    }
}

impl Validate for EnvironmentSpec {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        rules::validate_name(&self.name)
    }
}

impl fmt::Display for EnvironmentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_gated() {
            let approvers: Vec<&str> = self.required_approvers.iter().map(String::as_str).collect();
            write!(f, "{} (approvers: {})", self.name, approvers.join(", "))
        } else {
            write!(f, "{}", self.name)
        }
    }
}

/// Plain environment variables handed to a step
pub type Variables = BTreeMap<String, String>;

/// Variable resolver trait for interpolating `${NAME}` placeholders
pub trait VariableResolver {
    /// Resolves a variable value
    fn resolve(&self, name: &str) -> Option<String>;
}

impl VariableResolver for BTreeMap<String, String> {
    fn resolve(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl VariableResolver for HashMap<String, String> {
    fn resolve(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Replaces every `${NAME}` the resolver knows; unknown placeholders stay as written
pub fn interpolate(template: &str, resolver: &impl VariableResolver) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match resolver.resolve(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}
