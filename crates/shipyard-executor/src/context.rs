//! Execution context for job and step execution.
//!
//! Every job gets a [`Workspace`]: a private directory shared by its steps and
//! removed when the job's context is dropped. Every step additionally gets a
//! [`StepSandbox`]: its own temporary directory and environment map, both
//! released when the step ends, on every exit path.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use shipyard_core::{RunId, Variables};

use crate::cancel::CancelSignal;
use crate::secrets::{Redactor, SecretValue};
use crate::{ExecutorError, ExecutorErrorKind, ExecutorResult};

/// Execution configuration
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Directory under which job workspaces are created
    pub workspace_root: PathBuf,
    /// Step timeout when neither the step nor the pipeline sets one
    pub default_step_timeout: Duration,
    /// Pause between retry attempts
    pub retry_delay: Duration,
    /// Repository checked out by the `checkout` action
    pub repository: Option<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir(),
            default_step_timeout: Duration::from_secs(30 * 60),
            retry_delay: Duration::from_secs(1),
            repository: None,
        }
    }
}

/// Private directory of one job
#[derive(Debug)]
pub struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    /// Creates a fresh workspace below `root`
    pub fn create(root: &Path, job: &str) -> ExecutorResult<Self> {
        std::fs::create_dir_all(root).map_err(|e| workspace_error(root, &e))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("shipyard-{}-", file_safe(job)))
            .tempdir_in(root)
            .map_err(|e| workspace_error(root, &e))?;
        Ok(Self { dir })
    }

    /// Workspace path
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// `name` with everything but ASCII alphanumerics and `-` replaced by `_`
pub(crate) fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn workspace_error(path: &Path, error: &std::io::Error) -> ExecutorError {
    ExecutorErrorKind::Workspace {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
    .into()
}

/// Everything a job's steps share
#[derive(Debug)]
pub struct ExecutionContext {
    /// Run the job belongs to
    pub run_id: RunId,
    /// Job name
    pub job: String,
    /// Environment the job is bound to
    pub environment: Option<String>,
    /// Commit the run builds
    pub commit: String,
    /// Variables visible to every step of the job
    pub variables: Variables,
    /// Timeout for steps that declare none
    pub default_timeout: Duration,
    /// Absolute limit for the whole job
    pub deadline: Option<Instant>,
    /// Cancellation for the job
    pub cancel: CancelSignal,
    workspace: Workspace,
}

impl ExecutionContext {
    /// Creates a context with a fresh workspace
    pub fn new(
        config: &ExecutionConfig,
        run_id: RunId,
        job: impl Into<String>,
        commit: impl Into<String>,
    ) -> ExecutorResult<Self> {
        let job = job.into();
        let commit = commit.into();
        let workspace = Workspace::create(&config.workspace_root, &job)?;

        let mut variables = Variables::new();
        variables.insert("SHIPYARD_RUN_ID".to_string(), run_id.to_string());
        variables.insert("SHIPYARD_JOB".to_string(), job.clone());
        variables.insert("SHIPYARD_COMMIT".to_string(), commit.clone());
        variables.insert(
            "SHIPYARD_WORKSPACE".to_string(),
            workspace.path().display().to_string(),
        );
        if let Some(repository) = &config.repository {
            variables.insert(
                "SHIPYARD_REPOSITORY".to_string(),
                repository.display().to_string(),
            );
        }

        Ok(Self {
            run_id,
            job,
            environment: None,
            commit,
            variables,
            default_timeout: config.default_step_timeout,
            deadline: None,
            cancel: CancelSignal::never(),
            workspace,
        })
    }

    /// Binds the job to an environment
    #[must_use]
    pub fn with_environment(mut self, environment: Option<String>) -> Self {
        if let Some(name) = &environment {
            self.variables
                .insert("SHIPYARD_ENVIRONMENT".to_string(), name.clone());
        }
        self.environment = environment;
        self
    }

    /// Sets the default step timeout
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Bounds the whole job
    #[must_use]
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    /// Attaches a cancellation signal
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Job workspace directory
    #[must_use]
    pub fn cwd(&self) -> &Path {
        self.workspace.path()
    }

    /// Effective timeout for a step declaring `requested`, clipped to the job deadline
    #[must_use]
    pub fn step_timeout(&self, requested: Option<Duration>) -> Duration {
        let timeout = requested.unwrap_or(self.default_timeout);
        match self.deadline {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => timeout,
        }
    }
}

/// Per-step scratch directory, environment and redactor
#[derive(Debug)]
pub struct StepSandbox {
    tmp: tempfile::TempDir,
    env: Variables,
    redactor: Redactor,
}

impl StepSandbox {
    /// Creates a sandbox inside the job workspace
    ///
    /// `secrets` are injected into the step; they and `also_mask` are masked
    /// in its output. Steps share the job workspace, so a value an earlier
    /// step wrote to disk is masked when a later one prints it.
    pub fn create(
        context: &ExecutionContext,
        env: &Variables,
        secrets: Vec<(String, SecretValue)>,
        also_mask: &[SecretValue],
    ) -> ExecutorResult<Self> {
        let tmp = tempfile::Builder::new()
            .prefix(".step-")
            .tempdir_in(context.cwd())
            .map_err(|e| workspace_error(context.cwd(), &e))?;

        let mut vars = context.variables.clone();
        vars.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.insert("TMPDIR".to_string(), tmp.path().display().to_string());
        for (name, value) in &secrets {
            vars.insert(name.clone(), value.expose().to_string());
        }
        let redactor = Redactor::new(secrets.iter().map(|(_, v)| v).chain(also_mask))?;

        Ok(Self {
            tmp,
            env: vars,
            redactor,
        })
    }

    /// Environment for the step's command
    #[must_use]
    pub fn env(&self) -> &Variables {
        &self.env
    }

    /// Redactor over the step's secrets
    #[must_use]
    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Scratch directory
    #[must_use]
    pub fn tmp_dir(&self) -> &Path {
        self.tmp.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn config(root: &TempDir) -> ExecutionConfig {
        ExecutionConfig {
            workspace_root: root.path().to_path_buf(),
            ..ExecutionConfig::default()
        }
    }

    #[test]
    fn test_workspace_is_removed_on_drop() {
        let root = TempDir::new().unwrap();
        let ctx = ExecutionContext::new(&config(&root), Uuid::new_v4(), "build/linux", "abc").unwrap();
        let path = ctx.cwd().to_path_buf();
        assert!(path.exists());
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("shipyard-build_linux-"));
        assert_eq!(ctx.variables["SHIPYARD_COMMIT"], "abc");
        drop(ctx);
        assert!(!path.exists());
    }

    #[test]
    fn test_sandbox_carries_secrets_and_cleans_up() {
        let root = TempDir::new().unwrap();
        let ctx = ExecutionContext::new(&config(&root), Uuid::new_v4(), "deploy", "abc")
            .unwrap()
            .with_environment(Some("production".to_string()));
        let mut env = Variables::new();
        env.insert("MODE".to_string(), "fast".to_string());

        let sandbox = StepSandbox::create(
            &ctx,
            &env,
            vec![("TOKEN".to_string(), SecretValue::new("hunter2"))],
            &[SecretValue::new("from-an-earlier-step")],
        )
        .unwrap();
        let tmp = sandbox.tmp_dir().to_path_buf();
        assert_eq!(sandbox.env()["TOKEN"], "hunter2");
        assert_eq!(sandbox.env()["MODE"], "fast");
        assert_eq!(sandbox.env()["SHIPYARD_ENVIRONMENT"], "production");
        assert_eq!(sandbox.redactor().redact("token=hunter2"), "token=***");
        assert!(!sandbox.env().values().any(|v| v == "from-an-earlier-step"));
        assert_eq!(sandbox.redactor().redact("cat: from-an-earlier-step"), "cat: ***");
        drop(sandbox);
        assert!(!tmp.exists());
    }

    #[test]
    fn test_step_timeout_clipped_by_deadline() {
        let root = TempDir::new().unwrap();
        let ctx = ExecutionContext::new(&config(&root), Uuid::new_v4(), "job", "abc")
            .unwrap()
            .with_default_timeout(Duration::from_secs(600));
        assert_eq!(ctx.step_timeout(None), Duration::from_secs(600));
        assert_eq!(ctx.step_timeout(Some(Duration::from_secs(5))), Duration::from_secs(5));

        let ctx = ctx.with_job_timeout(Some(Duration::from_secs(60)));
        assert!(ctx.step_timeout(None) <= Duration::from_secs(60));
    }
}
