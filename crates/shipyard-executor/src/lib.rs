//! # Shipyard Executor
//!
//! Step execution for shipyard. A step runs a shell command or a built-in
//! action inside a sandbox that is released on every exit path.
//!
//! ## Architecture
//!
//! - `runner`: the compute runner contract and a local shell runner
//! - `context`: job workspaces and per-step sandboxes
//! - `secrets`: environment-scoped secret lookup and output redaction
//! - `action`: dispatch of built-in actions to handlers
//! - `runtime`: the [`StepExecutor`], with retries, timeouts and redaction
//! - `listener`: step event listeners
//! - `cancel`: cancellation signals
//!
//! ## Example
//!
//! ```rust,ignore
//! use shipyard_executor::{ExecutionConfig, ExecutionContext, StepExecutor};
//!
//! let config = ExecutionConfig::default();
//! let executor = StepExecutor::local(&config);
//! let ctx = ExecutionContext::new(&config, run_id, "build", "abc123")?;
//! let report = executor.execute_job(&job, &ctx).await;
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod action;
pub mod cancel;
pub mod context;
pub mod listener;
pub mod runner;
pub mod runtime;
pub mod secrets;

use std::path::PathBuf;

pub use action::{ActionHandler, ActionInvocation, CommandTemplates, TemplateActionHandler};
pub use cancel::{CancelHandle, CancelSignal};
pub use context::{ExecutionConfig, ExecutionContext, StepSandbox, Workspace};
pub use listener::{
    BufferListener, CompositeListener, JobLogListener, NoopListener, StepEvent, StepListener,
    TracingListener,
};
pub use runner::{CommandSpec, ComputeRunner, LocalRunner, StepOutcome, StepResult};
pub use runtime::{JobReport, StepExecutor, StepReport};
pub use secrets::{
    LayeredSecretStore, ProcessEnvSecretStore, Redactor, SecretStore, SecretValue,
    StaticSecretStore, MASK,
};

/// Executor result type
pub type ExecutorResult<T = ()> = Result<T, ExecutorError>;

/// Executor error types
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ExecutorError(#[from] ExecutorErrorKind);

impl ExecutorError {
    /// The specific kind
    #[must_use]
    pub fn kind(&self) -> &ExecutorErrorKind {
        &self.0
    }
}

/// Specific error kinds
#[derive(Debug, thiserror::Error)]
pub enum ExecutorErrorKind {
    /// The runner could not start the command
    #[error("failed to spawn '{command}': {reason}")]
    Spawn {
        /// Command line
        command: String,
        /// Underlying error
        reason: String,
    },

    /// I/O failure while supervising a command
    #[error("I/O error: {reason}")]
    Io {
        /// Underlying error
        reason: String,
    },

    /// A workspace or sandbox directory could not be created
    #[error("cannot prepare workspace at {}: {reason}", path.display())]
    Workspace {
        /// Directory
        path: PathBuf,
        /// Underlying error
        reason: String,
    },

    /// A secret the step references has no value in its environment
    #[error("secret '{name}' is not provisioned for environment '{environment}'")]
    MissingSecret {
        /// Environment
        environment: String,
        /// Secret name
        name: String,
    },

    /// No handler and no command template exist for an action
    #[error("no handler for action '{action}'")]
    NoHandler {
        /// Action name
        action: String,
    },

    /// The secret mask could not be built; the step must not run unmasked
    #[error("cannot build secret redaction: {reason}")]
    Redaction {
        /// Underlying error
        reason: String,
    },
}

impl From<std::io::Error> for ExecutorError {
    fn from(e: std::io::Error) -> Self {
        Self(ExecutorErrorKind::Io {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ExecutorError::from(ExecutorErrorKind::MissingSecret {
            environment: "production".to_string(),
            name: "DEPLOY_TOKEN".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "secret 'DEPLOY_TOKEN' is not provisioned for environment 'production'"
        );

        let err = ExecutorError::from(std::io::Error::other("disk full"));
        assert!(matches!(err.kind(), ExecutorErrorKind::Io { .. }));
    }
}
