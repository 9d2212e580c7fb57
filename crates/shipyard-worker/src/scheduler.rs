//! Pipeline scheduler.
//!
//! A run is driven by one loop that owns the [`RunRecord`]. It promotes
//! pending jobs whose prerequisites are satisfied, skips those whose
//! prerequisites failed, and spawns a task per dispatched job. Job tasks
//! never touch the record: they report [`JobUpdate`]s over a channel and the
//! loop applies them one at a time.
//!
//! A job task passes its environment gate first, then takes its
//! concurrency-group lock, and only then asks the loop for a worker. The loop
//! hands out worker permits best-ranked first and marks a job `Running` once
//! it holds one. A job waiting for approval therefore holds neither.

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shipyard_core::{
    ApprovalRequest, EnvironmentSpec, FailureReport, Job, JobStatus, PipelineError, ResolvedPipeline, RunId,
    RunRecord, TriggerEvent,
};
use shipyard_events::RunEvent;
use shipyard_executor::{CancelHandle, CancelSignal, ExecutionConfig, ExecutionContext, JobLogListener, StepExecutor};

use crate::gate::{ApprovalBook, GateResolution, missing_secrets};
use crate::listener::{RunListener, TracingRunListener};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker permits when the pipeline sets no limit
    pub max_concurrency: usize,
    /// Workspace and timeout settings handed to every job
    pub execution: ExecutionConfig,
    /// Directory holding `<run_id>/<job>.log`, if job logs are kept
    pub log_dir: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            execution: ExecutionConfig::default(),
            log_dir: None,
        }
    }
}

/// Message from a job task to the run loop
#[derive(Debug)]
pub enum JobUpdate {
    /// The job is waiting for approval
    Gated {
        /// Graph index of the job
        index: usize,
    },
    /// The job's gate allowed it
    Approved {
        /// Graph index of the job
        index: usize,
    },
    /// The job passed its gate and group lock and needs a worker
    WantsWorker {
        /// Graph index of the job
        index: usize,
    },
    /// The job reached a terminal state
    Finished {
        /// Graph index of the job
        index: usize,
        /// How it ended
        outcome: JobOutcome,
    },
}

/// Terminal result of one job task
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// `Succeeded`, `Failed` or `Cancelled`
    pub status: JobStatus,
    /// Step attempts made
    pub attempts: u32,
    /// Non-fatal reports
    pub reports: Vec<String>,
    /// Why the job did not succeed
    pub error: Option<PipelineError>,
}

impl JobOutcome {
    fn failed(error: PipelineError) -> Self {
        Self {
            status: JobStatus::Failed,
            attempts: 0,
            reports: Vec::new(),
            error: Some(error),
        }
    }

    fn cancelled(job: &str) -> Self {
        Self {
            status: JobStatus::Cancelled,
            ..Self::failed(PipelineError::Cancelled { job: job.to_string() })
        }
    }
}

/// Drives pipeline runs
pub struct Scheduler {
    executor: Arc<StepExecutor>,
    book: Arc<ApprovalBook>,
    listener: Arc<dyn RunListener>,
    config: SchedulerConfig,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("executor", &self.executor)
            .field("book", &self.book)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler running steps on `executor` and gating through `book`
    #[must_use]
    pub fn new(executor: Arc<StepExecutor>, book: Arc<ApprovalBook>) -> Self {
        Self {
            executor,
            book,
            listener: Arc::new(TracingRunListener),
            config: SchedulerConfig::default(),
        }
    }

    /// Sets the configuration
    #[must_use]
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the run listener
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn RunListener>) -> Self {
        self.listener = listener;
        self
    }

    /// The approval book gated jobs wait on
    #[must_use]
    pub fn approvals(&self) -> &Arc<ApprovalBook> {
        &self.book
    }

    /// Runs `pipeline` to completion under a fresh run id
    pub async fn run(&self, pipeline: &ResolvedPipeline, trigger: TriggerEvent, cancel: &CancelHandle) -> RunRecord {
        self.run_with_id(Uuid::new_v4(), pipeline, trigger, cancel).await
    }

    /// Runs `pipeline` to completion as `run_id`
    ///
    /// Returns the finished record; every job is terminal.
    pub async fn run_with_id(
        &self,
        run_id: RunId,
        pipeline: &ResolvedPipeline,
        trigger: TriggerEvent,
        cancel: &CancelHandle,
    ) -> RunRecord {
        let definition = pipeline.definition();
        let record = RunRecord::new(
            run_id,
            &definition.name,
            trigger,
            definition.jobs.iter().map(|j| j.name.as_str()),
        );
        let permits = definition
            .options
            .max_concurrency
            .unwrap_or(self.config.max_concurrency)
            .max(1);
        let (updates, inbox) = mpsc::unbounded_channel();

        let run = Run {
            scheduler: self,
            pipeline,
            record,
            permits: Arc::new(Semaphore::new(permits)),
            groups: HashMap::new(),
            spawned: vec![false; definition.jobs.len()],
            grants: HashMap::new(),
            waiting: Vec::new(),
            updates,
            in_flight: 0,
            cancel: cancel.clone(),
        };
        run.drive(inbox).await
    }
}

/// State of one run, owned by its loop
struct Run<'a> {
    scheduler: &'a Scheduler,
    pipeline: &'a ResolvedPipeline,
    record: RunRecord,
    permits: Arc<Semaphore>,
    groups: HashMap<String, Arc<Mutex<()>>>,
    /// Jobs whose task was spawned, by graph index
    spawned: Vec<bool>,
    /// Where each spawned job receives its worker permit
    grants: HashMap<usize, oneshot::Sender<OwnedSemaphorePermit>>,
    /// Jobs queued for a worker
    waiting: Vec<usize>,
    updates: mpsc::UnboundedSender<JobUpdate>,
    in_flight: usize,
    cancel: CancelHandle,
}

impl Run<'_> {
    async fn drive(mut self, mut inbox: mpsc::UnboundedReceiver<JobUpdate>) -> RunRecord {
        let run_id = self.record.run_id;
        self.emit(RunEvent::Started {
            record: self.record.clone(),
        })
        .await;

        let signal = self.cancel.signal();
        let mut cancel_seen = false;
        loop {
            self.settle().await;
            if self.cancel.is_cancelled() {
                self.cancel_unstarted().await;
                self.waiting.clear();
                self.grants.clear();
            } else {
                self.dispatch();
                self.grant_workers().await;
            }
            if self.in_flight == 0 {
                break;
            }
            tokio::select! {
                Some(update) = inbox.recv() => self.apply(update).await,
                () = signal.cancelled(), if !cancel_seen => {
                    info!(run_id = %run_id, "run cancelled");
                    cancel_seen = true;
                }
            }
        }

        let outcome = self.record.finish(Utc::now());
        self.emit(RunEvent::Finished {
            run_id,
            outcome,
            at: self.record.finished_at.unwrap_or_else(Utc::now),
        })
        .await;
        self.record
    }

    async fn emit(&self, event: RunEvent) {
        self.scheduler.listener.on_event(&event).await;
    }

    async fn transition(&mut self, index: usize, next: JobStatus) {
        let job = &mut self.record.jobs[index];
        if let Err(e) = job.transition(next, Utc::now()) {
            warn!(run_id = %self.record.run_id, error = %e, "ignoring transition");
            return;
        }
        let event = RunEvent::JobTransitioned {
            run_id: self.record.run_id,
            job: job.clone(),
        };
        self.emit(event).await;
    }

    /// Promotes or skips every pending job whose prerequisites are all terminal
    async fn settle(&mut self) {
        let pipeline = self.pipeline;
        let graph = pipeline.graph();
        for &index in graph.order() {
            if self.record.jobs[index].status != JobStatus::Pending {
                continue;
            }
            let job = pipeline.job_at(index);
            let mut ready = true;
            let mut skip = false;
            for &prerequisite in graph.prerequisites(index) {
                match self.record.jobs[prerequisite].status {
                    JobStatus::Succeeded => {}
                    JobStatus::Skipped if job.allow_skipped.contains(graph.name(prerequisite)) => {}
                    JobStatus::Skipped | JobStatus::Failed | JobStatus::Cancelled => skip = true,
                    _ => ready = false,
                }
            }
            if skip {
                debug!(job = %job.name, "skipping: a prerequisite did not succeed");
                self.transition(index, JobStatus::Skipped).await;
            } else if ready {
                self.transition(index, JobStatus::Ready).await;
            }
        }
    }

    /// Cancels jobs that have no task; spawned ones report through `Finished`
    async fn cancel_unstarted(&mut self) {
        for index in 0..self.record.jobs.len() {
            if !self.spawned[index] && matches!(self.record.jobs[index].status, JobStatus::Pending | JobStatus::Ready) {
                let job = self.record.jobs[index].name.clone();
                self.record.jobs[index].failure =
                    Some(FailureReport::from_error(&job, &PipelineError::Cancelled { job: job.clone() }));
                self.transition(index, JobStatus::Cancelled).await;
            }
        }
    }

    /// Spawns a task for every ready job that has none, best-ranked first
    fn dispatch(&mut self) {
        let graph = self.pipeline.graph();
        let mut ready: Vec<usize> = (0..self.record.jobs.len())
            .filter(|&i| self.record.jobs[i].status == JobStatus::Ready && !self.spawned[i])
            .collect();
        ready.sort_by_key(|&i| graph.rank(i));
        for index in ready {
            self.spawn(index);
        }
    }

    /// Hands free workers to waiting jobs, best-ranked first
    async fn grant_workers(&mut self) {
        let graph = self.pipeline.graph();
        self.waiting.sort_by_key(|&index| graph.rank(index));
        while !self.waiting.is_empty() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let index = self.waiting.remove(0);
            // A closed channel means the task gave up; the permit goes back.
            if let Some(grant) = self.grants.remove(&index)
                && grant.send(permit).is_ok()
            {
                self.transition(index, JobStatus::Running).await;
            }
        }
    }

    fn spawn(&mut self, index: usize) {
        let job = self.pipeline.job_at(index).clone();
        let group = job.concurrency_group.as_ref().map(|name| {
            self.groups
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        });
        let environment = self.pipeline.environment_of(&job).cloned();
        let (grant, granted) = oneshot::channel();
        self.grants.insert(index, grant);
        // Nothing stands between such a job and its worker, so it queues now
        // and simultaneously ready jobs are served by rank.
        if group.is_none() && environment.is_none() {
            self.waiting.push(index);
        }
        let options = &self.pipeline.definition().options;
        let task = JobTask {
            index,
            run_id: self.record.run_id,
            commit: self.record.commit().to_string(),
            environment,
            job,
            approval_timeout: options.approval_timeout,
            step_timeout: options.step_timeout,
            executor: self.scheduler.executor.clone(),
            book: self.scheduler.book.clone(),
            execution: self.scheduler.config.execution.clone(),
            group,
            granted,
            cancel: self.cancel.signal(),
            updates: self.updates.clone(),
        };

        let updates = self.updates.clone();
        let handle = tokio::spawn(task.run());
        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => JobOutcome::failed(PipelineError::external("scheduler", format!("job task ended abnormally: {e}"))),
            };
            // The loop only stops once every job reported.
            let _ = updates.send(JobUpdate::Finished { index, outcome });
        });
        self.spawned[index] = true;
        self.in_flight += 1;
    }

    async fn apply(&mut self, update: JobUpdate) {
        match update {
            JobUpdate::Gated { index } => {
                self.transition(index, JobStatus::Running).await;
                self.transition(index, JobStatus::WaitingApproval).await;
            }
            JobUpdate::Approved { index } => {
                debug!(run_id = %self.record.run_id, job = %self.record.jobs[index].name, "approved; waiting for a worker");
            }
            JobUpdate::WantsWorker { index } => {
                if self.grants.contains_key(&index) && !self.waiting.contains(&index) {
                    self.waiting.push(index);
                }
            }
            JobUpdate::Finished { index, outcome } => {
                self.in_flight -= 1;
                self.waiting.retain(|&waiting| waiting != index);
                self.grants.remove(&index);
                let run_id = self.record.run_id;
                let log_dir = self.scheduler.config.log_dir.clone();
                let job = &mut self.record.jobs[index];
                job.attempts = outcome.attempts;
                job.reports = outcome.reports;
                job.failure = outcome.error.as_ref().map(|e| FailureReport::from_error(&job.name, e));
                if let Some(dir) = log_dir
                    && outcome.attempts > 0
                {
                    job.log_ref = Some(JobLogListener::path(&dir, run_id, &job.name));
                }
                self.transition(index, outcome.status).await;

                if outcome.status == JobStatus::Failed
                    && self.pipeline.definition().options.fail_fast
                    && !self.cancel.is_cancelled()
                {
                    info!(run_id = %run_id, job = %self.record.jobs[index].name, "fail-fast: cancelling run");
                    self.cancel.cancel();
                }
            }
        }
    }
}

/// Everything one job needs, owned by its task
struct JobTask {
    index: usize,
    run_id: RunId,
    commit: String,
    job: Job,
    environment: Option<EnvironmentSpec>,
    approval_timeout: Option<Duration>,
    step_timeout: Option<Duration>,
    executor: Arc<StepExecutor>,
    book: Arc<ApprovalBook>,
    execution: ExecutionConfig,
    group: Option<Arc<Mutex<()>>>,
    granted: oneshot::Receiver<OwnedSemaphorePermit>,
    cancel: CancelSignal,
    updates: mpsc::UnboundedSender<JobUpdate>,
}

impl JobTask {
    async fn run(self) -> JobOutcome {
        if let Some(environment) = &self.environment {
            let missing = missing_secrets(&self.job, environment, self.executor.secrets().as_ref());
            if !missing.is_empty() {
                return JobOutcome::failed(PipelineError::external(
                    "secret store",
                    format!(
                        "environment '{}' does not provide {}",
                        environment.name,
                        missing.join(", ")
                    ),
                ));
            }
            if environment.is_gated()
                && let Some(outcome) = self.pass_gate(environment).await
            {
                return outcome;
            }
        }

        let _group = match &self.group {
            Some(lock) => tokio::select! {
                guard = lock.clone().lock_owned() => Some(guard),
                () = self.cancel.cancelled() => return JobOutcome::cancelled(&self.job.name),
            },
            None => None,
        };
        let _ = self.updates.send(JobUpdate::WantsWorker { index: self.index });
        let _permit = tokio::select! {
            permit = self.granted => match permit {
                Ok(permit) => permit,
                Err(_) => return JobOutcome::cancelled(&self.job.name),
            },
            () = self.cancel.cancelled() => return JobOutcome::cancelled(&self.job.name),
        };

        let ctx = match ExecutionContext::new(&self.execution, self.run_id, &self.job.name, &self.commit) {
            Ok(ctx) => ctx
                .with_environment(self.job.environment.clone())
                .with_default_timeout(self.step_timeout.unwrap_or(self.execution.default_step_timeout))
                .with_job_timeout(self.job.timeout)
                .with_cancel(self.cancel.clone()),
            Err(e) => return JobOutcome::failed(PipelineError::external("executor", e)),
        };
        debug!(run_id = %self.run_id, job = %self.job.name, workspace = %ctx.cwd().display(), "job executing");

        let report = self.executor.execute_job(&self.job, &ctx).await;
        let attempts = report.attempts();
        let status = match &report.error {
            None => JobStatus::Succeeded,
            Some(PipelineError::Cancelled { .. }) => JobStatus::Cancelled,
            Some(_) => JobStatus::Failed,
        };
        JobOutcome {
            status,
            attempts,
            reports: report.reports,
            error: report.error,
        }
    }

    /// Waits for approval; `None` means the job may proceed
    async fn pass_gate(&self, environment: &EnvironmentSpec) -> Option<JobOutcome> {
        let request = ApprovalRequest::open(
            self.run_id,
            &self.job.name,
            &environment.name,
            environment.required_approvers.clone(),
        );
        if let Err(e) = self.book.open(request).await {
            return Some(JobOutcome::failed(PipelineError::external("event store", e)));
        }
        let _ = self.updates.send(JobUpdate::Gated { index: self.index });

        let resolution = self
            .book
            .wait(
                self.run_id,
                &self.job.name,
                environment,
                self.approval_timeout,
                &self.cancel,
            )
            .await;
        match resolution {
            GateResolution::Allowed => {
                let _ = self.updates.send(JobUpdate::Approved { index: self.index });
                None
            }
            GateResolution::Denied { approver } => Some(JobOutcome::failed(PipelineError::ApprovalDenied {
                job: self.job.name.clone(),
                approver,
            })),
            GateResolution::TimedOut => Some(JobOutcome::failed(PipelineError::ApprovalTimedOut {
                job: self.job.name.clone(),
                after: self.approval_timeout.unwrap_or_default(),
            })),
            GateResolution::Cancelled => Some(JobOutcome::cancelled(&self.job.name)),
        }
    }
}
