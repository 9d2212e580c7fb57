//! Pipeline validation types and rules.
//!
//! Every way a pipeline definition can be malformed maps to one
//! [`ValidationError`] variant. They surface as `ConfigurationError` and are
//! fatal at load time.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation result type
pub type ValidationResult<T = ()> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ValidationError {
    /// The definition could not be parsed at all
    #[error("malformed pipeline definition: {reason}")]
    Malformed {
        /// Parser message
        reason: String,
    },

    /// Pipeline has no jobs
    #[error("pipeline must have at least one job")]
    EmptyJobs,

    /// Job or environment has no name
    #[error("name cannot be empty")]
    EmptyName,

    /// Job has no steps
    #[error("job '{job}' must have at least one step")]
    EmptySteps {
        /// Job name
        job: String,
    },

    /// Duplicate job name
    #[error("duplicate job name '{name}'")]
    DuplicateJob {
        /// Duplicate job name
        name: String,
    },

    /// Duplicate environment name
    #[error("duplicate environment '{name}'")]
    DuplicateEnvironment {
        /// Duplicate environment name
        name: String,
    },

    /// A prerequisite names a job that does not exist
    #[error("job '{job}' depends on unknown job '{prerequisite}'")]
    DanglingPrerequisite {
        /// Job declaring the prerequisite
        job: String,
        /// The unresolved name
        prerequisite: String,
    },

    /// A prerequisite is listed twice
    #[error("job '{job}' lists prerequisite '{prerequisite}' more than once")]
    DuplicatePrerequisite {
        /// Job declaring the prerequisite
        job: String,
        /// The repeated name
        prerequisite: String,
    },

    /// `allowSkipped` names a job that is not a prerequisite
    #[error("job '{job}' allows skipped '{name}' which is not one of its prerequisites")]
    InvalidAllowSkipped {
        /// Job name
        job: String,
        /// Offending entry
        name: String,
    },

    /// Job targets an environment that is not declared
    #[error("job '{job}' targets unknown environment '{environment}'")]
    UnknownEnvironment {
        /// Job name
        job: String,
        /// Environment name
        environment: String,
    },

    /// A step references a secret its job's environment does not provide
    #[error("job '{job}' uses secret '{secret}' which is not scoped to its environment")]
    UnscopedSecret {
        /// Job name
        job: String,
        /// Secret name
        secret: String,
    },

    /// A step has neither `run` nor `uses`, or both
    #[error("invalid step in job '{job}': {reason}")]
    InvalidStep {
        /// Job name
        job: String,
        /// Reason for validation failure
        reason: String,
    },

    /// `uses` names an action that is not registered
    #[error("job '{job}' uses unknown action '{action}'")]
    UnknownAction {
        /// Job name
        job: String,
        /// Action name
        action: String,
    },

    /// A registered action is missing a required input
    #[error("action '{action}' requires input '{input}'")]
    MissingInput {
        /// Action name
        action: String,
        /// Input key
        input: String,
    },

    /// An action input has the wrong shape or value
    #[error("action '{action}' has invalid input '{input}': {reason}")]
    InvalidInput {
        /// Action name
        action: String,
        /// Input key
        input: String,
        /// Reason for validation failure
        reason: String,
    },

    /// Invalid timeout configuration
    #[error("invalid timeout configuration: {reason}")]
    InvalidTimeout {
        /// Reason for validation failure
        reason: String,
    },

    /// Invalid retry configuration
    #[error("invalid retry configuration: {reason}")]
    InvalidRetry {
        /// Reason for validation failure
        reason: String,
    },

    /// Invalid concurrency configuration
    #[error("invalid concurrency configuration: {reason}")]
    InvalidConcurrency {
        /// Reason for validation failure
        reason: String,
    },

    /// Invalid trigger pattern
    #[error("invalid trigger pattern '{pattern}'")]
    InvalidTrigger {
        /// Pattern as written
        pattern: String,
    },

    /// Source control cannot supply what version computation needs
    #[error("source control misconfigured: {reason}")]
    SourceControl {
        /// Reason for validation failure
        reason: String,
    },

    /// Validation error with path context
    #[error("validation error at {path}: {error}")]
    WithPath {
        /// Path to the error location
        path: String,
        /// Underlying error
        error: Box<ValidationError>,
    },
}

/// Trait for validatable types
pub trait Validate {
    /// The error type returned by validation
    type Error;

    /// Validates this instance
    fn validate(&self) -> Result<(), Self::Error>;
}

impl<T: Validate> Validate for Option<T> {
    type Error = T::Error;

    fn validate(&self) -> Result<(), Self::Error> {
        match self {
            Some(value) => value.validate(),
            None => Ok(()),
        }
    }
}

impl<T: Validate> Validate for Vec<T> {
    type Error = T::Error;

    fn validate(&self) -> Result<(), Self::Error> {
        for item in self {
            item.validate()?;
        }
        Ok(())
    }
}

/// Validation context for nested validations
#[derive(Debug, Default)]
pub struct ValidationContext {
    path: Vec<String>,
}

impl ValidationContext {
    /// Creates a new validation context
    #[must_use]
    pub fn new() -> Self {
        Self { path: Vec::new() }
    }

    /// Pushes a path component
    pub fn push(&mut self, component: impl Into<String>) {
        self.path.push(component.into());
    }

    /// Pops a path component
    pub fn pop(&mut self) {
        self.path.pop();
    }

    /// Gets the current path as a string
    #[must_use]
    pub fn path(&self) -> String {
        self.path.join(".")
    }

    /// Wraps an error with the current path
    pub fn wrap<E>(&self, error: E) -> ValidationError
    where
        E: Into<ValidationError>,
    {
        if self.path.is_empty() {
            error.into()
        } else {
            ValidationError::WithPath {
                path: self.path(),
                error: Box::new(error.into()),
            }
        }
    }
}

/// Validation rules for common patterns
pub mod rules {
    use super::ValidationError;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Longest timeout accepted anywhere in a definition
    pub const MAX_TIMEOUT: Duration = Duration::from_secs(86400 * 7);

    /// Highest retry count accepted on a step
    pub const MAX_RETRIES: u32 = 10;

    /// Validates that a name is not blank
    pub fn validate_name(name: &str) -> Result<(), ValidationError> {
        if name.trim().is_empty() {
            Err(ValidationError::EmptyName)
        } else {
            Ok(())
        }
    }

    /// Validates that a timeout is within acceptable bounds
    pub fn validate_timeout(timeout: Duration) -> Result<(), ValidationError> {
        if timeout.is_zero() {
            return Err(ValidationError::InvalidTimeout {
                reason: "timeout must be greater than zero".to_string(),
            });
        }
        if timeout > MAX_TIMEOUT {
            return Err(ValidationError::InvalidTimeout {
                reason: "timeout exceeds maximum of 7 days".to_string(),
            });
        }
        Ok(())
    }

    /// Validates that a retry count is within acceptable bounds
    pub fn validate_retry(count: u32) -> Result<(), ValidationError> {
        if count > MAX_RETRIES {
            return Err(ValidationError::InvalidRetry {
                reason: format!("retry count exceeds maximum of {MAX_RETRIES}"),
            });
        }
        Ok(())
    }

    /// Validates that every job name is unique
    pub fn validate_unique_jobs<'a>(
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name) {
                return Err(ValidationError::DuplicateJob {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_jobs_error() {
        let error = ValidationError::EmptyJobs;
        assert_eq!(error.to_string(), "pipeline must have at least one job");
    }

    #[test]
    fn test_dangling_prerequisite_message_names_both_jobs() {
        let error = ValidationError::DanglingPrerequisite {
            job: "deploy".to_string(),
            prerequisite: "biuld".to_string(),
        };
        assert_eq!(error.to_string(), "job 'deploy' depends on unknown job 'biuld'");
    }

    #[test]
    fn test_validation_context_with_path() {
        let mut ctx = ValidationContext::new();
        ctx.push("jobs");
        ctx.push("deploy");
        assert_eq!(ctx.path(), "jobs.deploy");

        let wrapped = ctx.wrap(ValidationError::EmptyName);
        assert!(matches!(wrapped, ValidationError::WithPath { ref path, .. } if path == "jobs.deploy"));

        ctx.pop();
        ctx.pop();
        assert_eq!(ctx.wrap(ValidationError::EmptyName), ValidationError::EmptyName);
    }

    #[test]
    fn test_validate_timeout_bounds() {
        assert!(rules::validate_timeout(Duration::from_secs(3600)).is_ok());
        assert!(rules::validate_timeout(Duration::ZERO).is_err());
        assert!(rules::validate_timeout(Duration::from_secs(86400 * 8)).is_err());
    }

    #[test]
    fn test_validate_retry_bounds() {
        assert!(rules::validate_retry(3).is_ok());
        assert!(rules::validate_retry(15).is_err());
    }

    #[test]
    fn test_validate_unique_jobs() {
        assert!(rules::validate_unique_jobs(["lint", "test"]).is_ok());
        assert_eq!(
            rules::validate_unique_jobs(["lint", "test", "lint"]),
            Err(ValidationError::DuplicateJob {
                name: "lint".to_string()
            })
        );
    }
}
