//! `history`, `show` and `releases`.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local, Utc};
use std::fmt::Write as _;

use shipyard_core::{ApprovalState, Release, RunRecord};
use shipyard_events::History;

use super::engine::event_store;
use super::run::short;
use crate::config::ShipyardConfig;

async fn load(config: &ShipyardConfig) -> Result<History> {
    History::load(event_store(config).as_ref())
        .await
        .context("Failed to read the event log")
}

/// Most recent runs first
pub async fn list_runs(config: &ShipyardConfig, pipeline: Option<&str>, limit: usize) -> Result<()> {
    let history = load(config).await?;
    let runs: Vec<&RunRecord> = history
        .runs()
        .iter()
        .rev()
        .filter(|r| pipeline.is_none_or(|p| r.pipeline == p))
        .take(limit)
        .collect();

    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    for run in runs {
        println!("{}", run_line(run));
    }
    Ok(())
}

/// One run job by job, or its record as JSON
pub async fn show_run(config: &ShipyardConfig, run: &str, json: bool) -> Result<()> {
    let history = load(config).await?;
    let record = history
        .find_run(run)
        .ok_or_else(|| anyhow!("No single run matches '{run}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(record)?);
        return Ok(());
    }

    println!("{}", run_line(record));
    for job in &record.jobs {
        println!("  {:<24} {} ({} attempt(s))", job.name, job.status, job.attempts);
        if let Some(failure) = &job.failure {
            println!("    failure: {}", failure.message);
            for line in failure.output.lines() {
                println!("      | {line}");
            }
        }
        for report in &job.reports {
            println!("    report: {report}");
        }
        if let Some(log) = &job.log_ref {
            println!("    log: {}", log.display());
        }
    }
    for approval in history.approvals(&record.run_id) {
        let state = match &approval.state {
            ApprovalState::Open => "open".to_string(),
            ApprovalState::Approved => "approved".to_string(),
            ApprovalState::Rejected { by } => format!("rejected by {by}"),
            ApprovalState::Expired => "expired".to_string(),
        };
        println!("  approval {} -> {}: {state}", approval.job, approval.environment);
    }
    Ok(())
}

/// Releases oldest first
pub async fn list_releases(config: &ShipyardConfig, notes: bool) -> Result<()> {
    let history = load(config).await?;
    if history.releases().is_empty() {
        println!("No releases recorded");
        return Ok(());
    }
    for release in history.releases() {
        print!("{}", release_entry(release, notes));
    }
    Ok(())
}

/// Timestamps are shown in the operator's timezone
fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn run_line(run: &RunRecord) -> String {
    let outcome = run.outcome.map_or_else(|| "running".to_string(), |o| o.to_string());
    let mut line = format!(
        "{}  {:<16} {:<10} {}  {}",
        run.run_id,
        run.pipeline,
        outcome,
        short(run.commit()),
        local_time(run.started_at)
    );
    if let Some(elapsed) = run.finished_at.and_then(|end| (end - run.started_at).to_std().ok()) {
        let elapsed = std::time::Duration::from_secs(elapsed.as_secs());
        let _ = write!(line, "  ({})", humantime::format_duration(elapsed));
    }
    line
}

fn release_entry(release: &Release, notes: bool) -> String {
    let mut out = format!(
        "{:<12} {}  {}\n",
        release.tag,
        short(&release.commit),
        local_time(release.created_at)
    );
    if notes {
        for line in release.notes.lines() {
            let _ = writeln!(out, "    {line}");
        }
    }
    if !release.artifacts.is_empty() {
        let _ = writeln!(out, "    artifacts: {}", release.artifacts.join(", "));
    }
    out
}
