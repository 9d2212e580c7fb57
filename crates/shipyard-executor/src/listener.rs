//! Step event listeners.
//!
//! The executor reports every step start, every attempt's output and every
//! step result to a [`StepListener`]. Output in events is already redacted.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event};

use shipyard_core::RunId;

use crate::runner::StepOutcome;

/// Step event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEvent {
    /// A step is about to run
    StepStarted {
        /// Owning run
        run_id: RunId,
        /// Owning job
        job: String,
        /// Step label
        step: String,
    },
    /// One attempt produced output
    StepOutput {
        /// Owning run
        run_id: RunId,
        /// Owning job
        job: String,
        /// Step label
        step: String,
        /// Attempt number, starting at 1
        attempt: u32,
        /// Redacted stdout and stderr
        output: String,
    },
    /// A step reached its final outcome
    StepFinished {
        /// Owning run
        run_id: RunId,
        /// Owning job
        job: String,
        /// Step label
        step: String,
        /// Final outcome
        outcome: StepOutcome,
        /// Attempts made
        attempts: u32,
        /// Duration of the last attempt
        duration: Duration,
    },
}

impl StepEvent {
    /// Job the event belongs to
    #[must_use]
    pub fn job(&self) -> &str {
        match self {
            Self::StepStarted { job, .. } | Self::StepOutput { job, .. } | Self::StepFinished { job, .. } => job,
        }
    }

    /// Run the event belongs to
    #[must_use]
    pub fn run_id(&self) -> RunId {
        match self {
            Self::StepStarted { run_id, .. }
            | Self::StepOutput { run_id, .. }
            | Self::StepFinished { run_id, .. } => *run_id,
        }
    }
}

/// Listener trait for step events
#[async_trait]
pub trait StepListener: Send + Sync {
    /// Called when an event occurs
    async fn on_event(&self, event: &StepEvent);
}

/// Composite listener that combines multiple listeners
#[derive(Default)]
pub struct CompositeListener {
    listeners: Vec<Arc<dyn StepListener>>,
}

impl std::fmt::Debug for CompositeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeListener")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl CompositeListener {
    /// Creates a new composite listener
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener
    pub fn add<L: StepListener + 'static>(&mut self, listener: L) {
        self.listeners.push(Arc::new(listener));
    }

    /// Adds a shared listener
    pub fn add_shared(&mut self, listener: Arc<dyn StepListener>) {
        self.listeners.push(listener);
    }
}

#[async_trait]
impl StepListener for CompositeListener {
    async fn on_event(&self, event: &StepEvent) {
        for listener in &self.listeners {
            listener.on_event(event).await;
        }
    }
}

/// Tracing listener that logs events
#[derive(Debug, Default)]
pub struct TracingListener;

#[async_trait]
impl StepListener for TracingListener {
    async fn on_event(&self, event: &StepEvent) {
        match event {
            StepEvent::StepStarted { run_id, job, step } => {
                event!(Level::DEBUG, run_id = %run_id, job = %job, step = %step, "step started");
            }
            StepEvent::StepOutput {
                job,
                step,
                attempt,
                output,
                ..
            } => {
                event!(Level::TRACE, job = %job, step = %step, attempt, output = %output);
            }
            StepEvent::StepFinished {
                job,
                step,
                outcome,
                attempts,
                duration,
                ..
            } => {
                if outcome.is_success() {
                    event!(Level::DEBUG, job = %job, step = %step, attempts, duration = ?duration, "step succeeded");
                } else {
                    event!(Level::WARN, job = %job, step = %step, attempts, outcome = %outcome, "step did not succeed");
                }
            }
        }
    }
}

/// No-op listener
#[derive(Debug, Default)]
pub struct NoopListener;

#[async_trait]
impl StepListener for NoopListener {
    async fn on_event(&self, _event: &StepEvent) {}
}

/// Buffer listener that stores events in memory
#[derive(Debug, Default, Clone)]
pub struct BufferListener {
    events: Arc<Mutex<Vec<StepEvent>>>,
}

impl BufferListener {
    /// Creates a new buffer listener
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets all recorded events
    #[must_use]
    pub fn events(&self) -> Vec<StepEvent> {
        self.events.lock().clone()
    }

    /// Clears all recorded events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl StepListener for BufferListener {
    async fn on_event(&self, event: &StepEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Appends each job's step output to `<dir>/<run_id>/<job>.log`
#[derive(Debug)]
pub struct JobLogListener {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JobLogListener {
    /// Creates a listener writing below `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    /// Log file of `job` in run `run_id` below `dir`
    #[must_use]
    pub fn path(dir: &Path, run_id: RunId, job: &str) -> PathBuf {
        dir.join(run_id.to_string())
            .join(format!("{}.log", crate::context::file_safe(job)))
    }

    /// Log file of `job` in run `run_id`
    #[must_use]
    pub fn path_for(&self, run_id: RunId, job: &str) -> PathBuf {
        Self::path(&self.dir, run_id, job)
    }

    fn append(&self, run_id: RunId, job: &str, text: &str) -> std::io::Result<()> {
        let path = self.path_for(run_id, job);
        let _guard = self.lock.lock();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(text.as_bytes())
    }

    fn render(event: &StepEvent) -> String {
        match event {
            StepEvent::StepStarted { step, .. } => format!("==> {step}\n"),
            StepEvent::StepOutput {
                attempt, output, ..
            } => {
                let mut text = String::new();
                if *attempt > 1 {
                    text.push_str(&format!("--- attempt {attempt}\n"));
                }
                text.push_str(output);
                if !output.is_empty() && !output.ends_with('\n') {
                    text.push('\n');
                }
                text
            }
            StepEvent::StepFinished {
                step,
                outcome,
                duration,
                ..
            } => format!("<== {step}: {outcome} in {duration:?}\n"),
        }
    }
}

#[async_trait]
impl StepListener for JobLogListener {
    async fn on_event(&self, event: &StepEvent) {
        if let Err(e) = self.append(event.run_id(), event.job(), &Self::render(event)) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "cannot write job log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn output(job: &str, attempt: u32, text: &str) -> StepEvent {
        StepEvent::StepOutput {
            run_id: Uuid::nil(),
            job: job.to_string(),
            step: "build".to_string(),
            attempt,
            output: text.to_string(),
        }
    }

    #[test]
    fn test_composite_listener_add() {
        let mut listener = CompositeListener::new();
        listener.add(TracingListener);
        listener.add(NoopListener);
        assert_eq!(listener.listeners.len(), 2);
    }

    #[tokio::test]
    async fn test_composite_fans_out_to_buffer() {
        let buffer = BufferListener::new();
        let mut listener = CompositeListener::new();
        listener.add(buffer.clone());
        listener.add(TracingListener);

        listener.on_event(&output("lint", 1, "ok")).await;
        assert_eq!(buffer.events().len(), 1);
        buffer.clear();
        assert!(buffer.events().is_empty());
    }

    #[tokio::test]
    async fn test_job_log_appends_per_job() {
        let dir = TempDir::new().unwrap();
        let listener = JobLogListener::new(dir.path().join("logs"));

        listener
            .on_event(&StepEvent::StepStarted {
                run_id: Uuid::nil(),
                job: "build".to_string(),
                step: "compile".to_string(),
            })
            .await;
        listener.on_event(&output("build", 1, "first")).await;
        listener.on_event(&output("build", 2, "second\n")).await;
        listener.on_event(&output("test", 1, "other job")).await;

        let log = std::fs::read_to_string(listener.path_for(Uuid::nil(), "build")).unwrap();
        assert_eq!(log, "==> compile\nfirst\n--- attempt 2\nsecond\n");
        assert!(listener.path_for(Uuid::nil(), "test").exists());
        assert!(listener.path_for(Uuid::nil(), "test").starts_with(dir.path().join("logs").join(Uuid::nil().to_string())));
    }
}
