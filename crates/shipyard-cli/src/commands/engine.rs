//! Wiring of the engine from configuration.

use std::sync::Arc;
use tracing::{debug, warn};

use shipyard_core::{ActionKind, PipelineOptions, ResolvedPipeline, RunRecord, TriggerEvent};
use shipyard_events::{EventStore, FileEventStore};
use shipyard_executor::{
    CancelHandle, CompositeListener, ComputeRunner, ExecutionConfig, JobLogListener, LayeredSecretStore,
    LocalRunner, ProcessEnvSecretStore, StepExecutor, TracingListener,
};
use shipyard_release::{
    CommandProbe, CommandTrafficRouter, GitCli, HttpProbe, ReleaseController, RolloutController, RolloutHandler,
    SourceControl, StandardProbe, TagReleaseHandler,
};
use shipyard_worker::{ApprovalBook, CompositeRunListener, HistoryRecorder, Scheduler, SchedulerConfig, TracingRunListener};

use crate::config::ShipyardConfig;

/// Event store under the configured state directory
pub fn event_store(config: &ShipyardConfig) -> Arc<dyn EventStore> {
    Arc::new(FileEventStore::in_dir(config.events_dir()))
}

/// Source-control adapter for the configured repository
pub fn source_control(config: &ShipyardConfig) -> Arc<dyn SourceControl> {
    let git = GitCli::new(&config.repository);
    Arc::new(match &config.remote {
        Some(remote) => git.with_remote(remote),
        None => git,
    })
}

/// A scheduler and everything it runs on
pub struct Engine {
    scheduler: Scheduler,
}

impl Engine {
    /// Builds the engine for pipelines with `options`
    pub fn new(config: &ShipyardConfig, options: &PipelineOptions) -> Self {
        // Job workspaces live elsewhere; checkout needs an absolute path.
        let repository = config
            .repository
            .canonicalize()
            .unwrap_or_else(|_| config.repository.clone());
        let runner: Arc<dyn ComputeRunner> = Arc::new(LocalRunner::new(&config.shell));
        let secrets = Arc::new(LayeredSecretStore::new(config.secret_store(), ProcessEnvSecretStore));
        let store = event_store(config);

        let mut listeners = CompositeListener::new();
        listeners.add(TracingListener);
        listeners.add(JobLogListener::new(config.logs_dir()));

        let releases = ReleaseController::new(source_control(config), store.clone())
            .with_release_branch(options.release_branch.clone());
        let mut executor = StepExecutor::new(runner.clone(), secrets)
            .with_templates(config.actions.clone())
            .with_listener(Arc::new(listeners))
            .with_handler(ActionKind::TagRelease, Arc::new(TagReleaseHandler::new(Arc::new(releases))));

        match &config.router {
            Some(template) => {
                let router = CommandTrafficRouter::new(runner.clone(), template, &repository);
                let probe = StandardProbe::new(
                    HttpProbe::default(),
                    CommandProbe::new(runner.clone(), &repository),
                );
                let rollouts = RolloutController::new(Arc::new(router), Arc::new(probe));
                executor = executor.with_handler(ActionKind::Rollout, Arc::new(RolloutHandler::new(Arc::new(rollouts))));
            }
            None => debug!("no traffic router configured; rollout steps will fail"),
        }

        let book = ApprovalBook::new(store.clone()).with_poll_interval(config.approval_poll_interval);
        let listener = CompositeRunListener::new()
            .add(TracingRunListener)
            .add(HistoryRecorder::new(store.clone()));
        let scheduler = Scheduler::new(Arc::new(executor), Arc::new(book))
            .with_config(SchedulerConfig {
                max_concurrency: config.max_concurrency,
                execution: ExecutionConfig {
                    workspace_root: config.workspace_root.clone(),
                    default_step_timeout: config.default_step_timeout,
                    repository: Some(repository),
                    ..ExecutionConfig::default()
                },
                log_dir: Some(config.logs_dir()),
            })
            .with_listener(Arc::new(listener));

        Self { scheduler }
    }

    /// Runs `pipeline` until it finishes or Ctrl-C cancels it
    pub async fn run(&self, pipeline: &ResolvedPipeline, trigger: TriggerEvent) -> RunRecord {
        let cancel = CancelHandle::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, cancelling run");
                    cancel.cancel();
                }
            })
        };
        let record = self.scheduler.run(pipeline, trigger, &cancel).await;
        interrupt.abort();
        record
    }
}
