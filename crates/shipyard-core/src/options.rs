//! Pipeline options and triggers.
//!
//! This module provides types for configuring pipeline execution
//! (concurrency, fail-fast, timeouts) and the source-control events that
//! start a run.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::validation::{Validate, ValidationError, rules};

/// Pipeline execution options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineOptions {
    /// Upper bound on jobs occupying a worker at once; `None` defers to the runner config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    /// Cancel every unfinished job as soon as any job fails
    pub fail_fast: bool,

    /// Fail a job that stays in `WaitingApproval` longer than this
    #[serde(
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub approval_timeout: Option<Duration>,

    /// Default step timeout for steps that declare none
    #[serde(
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub step_timeout: Option<Duration>,

    /// Branch whose successful runs may cut releases
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_branch: Option<String>,
}

impl PipelineOptions {
    /// Sets the concurrency limit
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Enables fail-fast cancellation
    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Sets the approval timeout
    #[must_use]
    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = Some(timeout);
        self
    }

    /// Sets the default step timeout
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }
}

impl Validate for PipelineOptions {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.max_concurrency == Some(0) {
            return Err(ValidationError::InvalidConcurrency {
                reason: "maxConcurrency must be at least 1".to_string(),
            });
        }
        if let Some(timeout) = self.approval_timeout {
            rules::validate_timeout(timeout)?;
        }
        if let Some(timeout) = self.step_timeout {
            rules::validate_timeout(timeout)?;
        }
        Ok(())
    }
}

/// Source-control events a pipeline reacts to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Trigger {
    /// Push to one of the branch patterns (all branches when empty)
    Push {
        /// Glob patterns, e.g. `main` or `release/*`
        #[serde(default)]
        branches: Vec<String>,
    },
    /// New tag matching the pattern
    Tag {
        /// Glob pattern, e.g. `v*`
        pattern: String,
    },
}

/// A concrete event observed on the source-control platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TriggerEvent {
    /// A branch moved
    Push {
        /// Branch name
        branch: String,
        /// New head commit
        commit: String,
    },
    /// A tag was created
    Tag {
        /// Tag name
        name: String,
        /// Tagged commit
        commit: String,
    },
    /// Run started by hand
    Manual {
        /// Commit the run builds
        commit: String,
    },
}

impl TriggerEvent {
    /// Commit the event refers to
    #[must_use]
    pub fn commit(&self) -> &str {
        match self {
            Self::Push { commit, .. } | Self::Tag { commit, .. } | Self::Manual { commit } => {
                commit
            }
        }
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push { branch, commit } => write!(f, "push to {branch} at {commit}"),
            Self::Tag { name, commit } => write!(f, "tag {name} at {commit}"),
            Self::Manual { commit } => write!(f, "manual run at {commit}"),
        }
    }
}

impl Trigger {
    /// Returns true if `event` should start a run
    #[must_use]
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        match (self, event) {
            (Self::Push { branches }, TriggerEvent::Push { branch, .. }) => {
                branches.is_empty() || branches.iter().any(|p| glob_matches(p, branch))
            }
            (Self::Tag { pattern }, TriggerEvent::Tag { name, .. }) => glob_matches(pattern, name),
            _ => false,
        }
    }
}

impl Validate for Trigger {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        let patterns: Vec<&String> = match self {
            Self::Push { branches } => branches.iter().collect(),
            Self::Tag { pattern } => vec![pattern],
        };
        for pattern in patterns {
            if pattern.trim().is_empty() || glob_to_regex(pattern).is_none() {
                return Err(ValidationError::InvalidTrigger {
                    pattern: pattern.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Returns true if any trigger accepts the event; manual runs always match
#[must_use]
pub fn any_trigger_matches(triggers: &[Trigger], event: &TriggerEvent) -> bool {
    matches!(event, TriggerEvent::Manual { .. }) || triggers.iter().any(|t| t.matches(event))
}

fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

fn glob_matches(pattern: &str, candidate: &str) -> bool {
    glob_to_regex(pattern).is_some_and(|re| re.is_match(candidate))
}
