//! `run` and `watch`.

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use shipyard_core::options::any_trigger_matches;
use shipyard_core::{PipelineOutcome, ResolvedPipeline, RunRecord, TriggerEvent};
use shipyard_release::GitPoller;

use super::engine::{Engine, source_control};
use crate::config::ShipyardConfig;

/// Loads a pipeline file with the path in the error
pub(crate) fn load_pipeline(path: &Path) -> Result<ResolvedPipeline> {
    ResolvedPipeline::from_file(path).with_context(|| format!("Failed to load pipeline: {}", path.display()))
}

/// Executes the pipeline once and fails when the run fails
pub async fn run_pipeline(
    config: &ShipyardConfig,
    path: &Path,
    commit: Option<String>,
    branch: Option<String>,
    tag: Option<String>,
) -> Result<()> {
    let pipeline = load_pipeline(path)?;
    let commit = match commit {
        Some(commit) => commit,
        None => source_control(config)
            .resolve("HEAD")
            .await
            .context("No --commit given and the repository HEAD could not be resolved")?,
    };
    let trigger = match (branch, tag) {
        (Some(branch), _) => TriggerEvent::Push { branch, commit },
        (None, Some(name)) => TriggerEvent::Tag { name, commit },
        (None, None) => TriggerEvent::Manual { commit },
    };
    if !any_trigger_matches(&pipeline.definition().triggers, &trigger) {
        bail!("Pipeline '{}' has no trigger matching {trigger:?}", pipeline.definition().name);
    }

    let engine = Engine::new(config, &pipeline.definition().options);
    let record = engine.run(&pipeline, trigger).await;
    print_summary(&record);

    if record.outcome == Some(PipelineOutcome::Failed) {
        bail!("Run {} failed", record.run_id);
    }
    Ok(())
}

/// Polls source control and runs the pipeline for each matching event
pub async fn watch(config: &ShipyardConfig, path: &Path, interval: Duration) -> Result<()> {
    let pipeline = load_pipeline(path)?;
    let definition = pipeline.definition();
    let engine = Engine::new(config, &definition.options);
    let mut poller = GitPoller::new(source_control(config));
    let mut ticker = tokio::time::interval(interval);

    info!(pipeline = %definition.name, interval = %humantime::format_duration(interval), "watching for changes");
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("stopped watching");
                return Ok(());
            }
        }

        let events = match poller.poll().await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "poll failed");
                continue;
            }
        };
        for event in events {
            if !any_trigger_matches(&definition.triggers, &event) {
                continue;
            }
            info!(pipeline = %definition.name, commit = %event.commit(), "trigger matched");
            let record = engine.run(&pipeline, event).await;
            print_summary(&record);
        }
    }
}

/// One line per job, then the outcome
pub(crate) fn print_summary(record: &RunRecord) {
    println!("Run {} of '{}' at {}", record.run_id, record.pipeline, short(record.commit()));
    for job in &record.jobs {
        print!("  {:<24} {}", job.name, job.status);
        if let Some(failure) = &job.failure {
            print!(": {}", failure.message);
        }
        println!();
        for report in &job.reports {
            println!("  {:<24} {report}", "");
        }
    }
    match record.outcome {
        Some(outcome) => println!("Outcome: {outcome}"),
        None => println!("Outcome: unfinished"),
    }
}

pub(crate) fn short(commit: &str) -> &str {
    commit.get(..12).unwrap_or(commit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_short_commit() {
        assert_eq!(short("4f2c9e1d8a7b6c5d4e3f"), "4f2c9e1d8a7b");
        assert_eq!(short("4f2c9e1"), "4f2c9e1");
    }

    #[test]
    fn test_load_pipeline_names_file() {
        let err = load_pipeline(&PathBuf::from("/nonexistent/pipeline.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pipeline.yaml"));
    }
}
