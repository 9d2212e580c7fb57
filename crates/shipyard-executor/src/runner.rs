//! Compute runners.
//!
//! A [`ComputeRunner`] runs one command to completion, timeout or
//! cancellation. [`LocalRunner`] runs commands on the current machine through
//! a shell.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use shipyard_core::Variables;

use crate::cancel::CancelSignal;
use crate::{ExecutorError, ExecutorErrorKind, ExecutorResult};

/// Environment variables a runner never passes through to children
pub const RESERVED_ENV_PREFIX: &str = "SHIPYARD_SECRET_";

/// How long to keep draining output after the process was killed
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// One command invocation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Command line handed to the shell
    pub command: String,
    /// Extra environment for this invocation only
    pub env: Variables,
    /// Working directory
    pub working_dir: PathBuf,
    /// Hard limit after which the process is killed
    pub timeout: Duration,
}

impl CommandSpec {
    /// Creates a spec with an empty environment
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            env: Variables::new(),
            working_dir: working_dir.into(),
            timeout,
        }
    }

    /// Adds environment variables
    #[must_use]
    pub fn with_env(mut self, env: Variables) -> Self {
        self.env.extend(env);
        self
    }
}

/// How a step ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Exit status zero
    Succeeded,
    /// Non-zero exit, or killed by a signal (`exit_code` -1)
    Failed {
        /// Exit status
        exit_code: i32,
    },
    /// Killed after exceeding its timeout
    TimedOut,
    /// Killed by a cancellation request
    Cancelled,
    /// Could not run, or an action failed with a domain error
    Aborted(shipyard_core::PipelineError),
}

impl StepOutcome {
    /// Returns true for a zero exit
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if another attempt may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::TimedOut)
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { exit_code } => write!(f, "failed (exit {exit_code})"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Aborted(e) => write!(f, "aborted: {e}"),
        }
    }
}

/// Captured result of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    /// How it ended
    pub outcome: StepOutcome,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Wall-clock duration
    pub duration: Duration,
    /// Non-fatal reports produced by actions
    pub reports: Vec<String>,
}

impl StepResult {
    /// A result with no output
    #[must_use]
    pub fn new(outcome: StepOutcome, duration: Duration) -> Self {
        Self {
            outcome,
            stdout: String::new(),
            stderr: String::new(),
            duration,
            reports: Vec::new(),
        }
    }

    /// A successful result carrying `stdout`
    #[must_use]
    pub fn succeeded(stdout: impl Into<String>, duration: Duration) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::new(StepOutcome::Succeeded, duration)
        }
    }

    /// An aborted result
    #[must_use]
    pub fn aborted(error: shipyard_core::PipelineError, duration: Duration) -> Self {
        Self {
            stderr: error.to_string(),
            ..Self::new(StepOutcome::Aborted(error), duration)
        }
    }

    /// Adds a report
    #[must_use]
    pub fn with_report(mut self, report: impl Into<String>) -> Self {
        self.reports.push(report.into());
        self
    }

    /// Standard output followed by standard error
    #[must_use]
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Runs commands
#[async_trait]
pub trait ComputeRunner: Send + Sync + fmt::Debug {
    /// Runs `spec` until it exits, times out or `cancel` fires
    async fn run_command(&self, spec: &CommandSpec, cancel: &CancelSignal) -> ExecutorResult<StepResult>;
}

/// Runner that spawns a local shell per command
#[derive(Debug, Clone)]
pub struct LocalRunner {
    shell: String,
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

enum Finish {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

impl LocalRunner {
    /// Creates a runner using `shell -c <command>`
    #[must_use]
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn drain<R>(reader: Option<R>) -> JoinHandle<Vec<u8>>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut reader) = reader {
                let _ = reader.read_to_end(&mut buf).await;
            }
            buf
        })
    }

    async fn collect(mut handle: JoinHandle<Vec<u8>>, killed: bool) -> String {
        let bytes = if killed {
            // Grandchildren may keep the pipe open after the shell died.
            match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
                Ok(joined) => joined.unwrap_or_default(),
                Err(_) => {
                    handle.abort();
                    Vec::new()
                }
            }
        } else {
            handle.await.unwrap_or_default()
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[async_trait]
impl ComputeRunner for LocalRunner {
    async fn run_command(&self, spec: &CommandSpec, cancel: &CancelSignal) -> ExecutorResult<StepResult> {
        let start = Instant::now();
        debug!(command = %spec.command, dir = %spec.working_dir.display(), "spawning command");

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, _) in std::env::vars_os() {
            if key.to_string_lossy().starts_with(RESERVED_ENV_PREFIX) {
                cmd.env_remove(&key);
            }
        }
        cmd.envs(&spec.env);

        let mut child = cmd.spawn().map_err(|e| {
            ExecutorError::from(ExecutorErrorKind::Spawn {
                command: spec.command.clone(),
                reason: e.to_string(),
            })
        })?;

        let stdout = Self::drain(child.stdout.take());
        let stderr = Self::drain(child.stderr.take());

        let finish = tokio::select! {
            status = child.wait() => Finish::Exited(status),
            () = tokio::time::sleep(spec.timeout) => Finish::TimedOut,
            () = cancel.cancelled() => Finish::Cancelled,
        };

        let outcome = match finish {
            Finish::Exited(status) => {
                let status = status.map_err(|e| ExecutorError::from(ExecutorErrorKind::Io { reason: e.to_string() }))?;
                match status.code() {
                    Some(0) => StepOutcome::Succeeded,
                    Some(code) => StepOutcome::Failed { exit_code: code },
                    None => StepOutcome::Failed { exit_code: -1 },
                }
            }
            Finish::TimedOut => {
                warn!(command = %spec.command, timeout = ?spec.timeout, "command timed out, killing");
                let _ = child.kill().await;
                StepOutcome::TimedOut
            }
            Finish::Cancelled => {
                debug!(command = %spec.command, "command cancelled, killing");
                let _ = child.kill().await;
                StepOutcome::Cancelled
            }
        };

        let killed = matches!(outcome, StepOutcome::TimedOut | StepOutcome::Cancelled);
        Ok(StepResult {
            stdout: Self::collect(stdout, killed).await,
            stderr: Self::collect(stderr, killed).await,
            outcome,
            duration: start.elapsed(),
            reports: Vec::new(),
        })
    }
}
