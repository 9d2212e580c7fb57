//! Read model over the event log.
//!
//! [`History`] folds events into run records, approval requests and releases.
//! It is rebuilt from the store on every read; the log stays the only source
//! of truth.

use std::collections::HashMap;
use tracing::warn;

use shipyard_core::{ApprovalRequest, Release, RunId, RunRecord};

use crate::EventsResult;
use crate::event_store::EventStore;
use crate::types::{AnyEvent, ApprovalEvent, EventEnvelope, ReleaseEvent, RunEvent};

/// Runs, approvals and releases as of the last applied event
#[derive(Debug, Clone, Default)]
pub struct History {
    runs: Vec<RunRecord>,
    index: HashMap<RunId, usize>,
    approvals: Vec<ApprovalRequest>,
    releases: Vec<Release>,
}

impl History {
    /// Empty history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `events` in order
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a EventEnvelope>) -> Self {
        let mut history = Self::new();
        for envelope in events {
            history.apply(&envelope.event);
        }
        history
    }

    /// Reads the whole store and folds it
    pub async fn load(store: &dyn EventStore) -> EventsResult<Self> {
        let events = store.events().await?;
        Ok(Self::replay(&events))
    }

    /// Applies one event
    pub fn apply(&mut self, event: &AnyEvent) {
        match event {
            AnyEvent::Run(event) => self.apply_run(event),
            AnyEvent::Approval(event) => self.apply_approval(event),
            AnyEvent::Release(ReleaseEvent::Created { release }) => {
                if self.release(&release.tag).is_none() {
                    self.releases.push(release.clone());
                }
            }
        }
    }

    fn apply_run(&mut self, event: &RunEvent) {
        match event {
            RunEvent::Started { record } => match self.index.get(&record.run_id) {
                Some(&i) => self.runs[i] = record.clone(),
                None => {
                    self.index.insert(record.run_id, self.runs.len());
                    self.runs.push(record.clone());
                }
            },
            RunEvent::JobTransitioned { run_id, job } => {
                let Some(record) = self.index.get(run_id).map(|&i| &mut self.runs[i]) else {
                    warn!(run_id = %run_id, job = %job.name, "transition for unknown run");
                    return;
                };
                match record.jobs.iter_mut().find(|j| j.name == job.name) {
                    Some(existing) if existing.status.is_terminal() && existing.status != job.status => {
                        warn!(run_id = %run_id, job = %job.name, "ignoring transition out of a terminal state");
                    }
                    Some(existing) => *existing = job.clone(),
                    None => warn!(run_id = %run_id, job = %job.name, "transition for unknown job"),
                }
            }
            RunEvent::Finished { run_id, outcome, at } => {
                if let Some(&i) = self.index.get(run_id) {
                    self.runs[i].outcome = Some(*outcome);
                    self.runs[i].finished_at = Some(*at);
                }
            }
        }
    }

    fn apply_approval(&mut self, event: &ApprovalEvent) {
        if let ApprovalEvent::Requested { request } = event {
            self.approvals.push(request.clone());
            return;
        }
        let Some(request) = self
            .approvals
            .iter_mut()
            .rev()
            .find(|r| r.run_id == event.run_id() && r.job == event.job())
        else {
            warn!(run_id = %event.run_id(), job = %event.job(), "decision for unknown approval request");
            return;
        };
        match event {
            ApprovalEvent::Granted { identity, .. } => request.grant(identity.clone()),
            ApprovalEvent::Rejected { identity, .. } => request.reject(identity.clone()),
            ApprovalEvent::Expired { .. } => request.expire(),
            ApprovalEvent::Requested { .. } => {}
        }
    }

    /// Looks a run up by id
    #[must_use]
    pub fn run(&self, id: &RunId) -> Option<&RunRecord> {
        self.index.get(id).map(|&i| &self.runs[i])
    }

    /// Looks a run up by a unique prefix of its id
    #[must_use]
    pub fn find_run(&self, prefix: &str) -> Option<&RunRecord> {
        let mut matches = self.runs.iter().filter(|r| r.run_id.to_string().starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(run), None) => Some(run),
            _ => None,
        }
    }

    /// Every run, oldest first
    #[must_use]
    pub fn runs(&self) -> &[RunRecord] {
        &self.runs
    }

    /// Approval requests of one run
    pub fn approvals(&self, run_id: &RunId) -> impl Iterator<Item = &ApprovalRequest> {
        let run_id = *run_id;
        self.approvals.iter().filter(move |r| r.run_id == run_id)
    }

    /// Latest approval request of one job
    #[must_use]
    pub fn approval(&self, run_id: &RunId, job: &str) -> Option<&ApprovalRequest> {
        self.approvals
            .iter()
            .rev()
            .find(|r| &r.run_id == run_id && r.job == job)
    }

    /// Looks a release up by tag
    #[must_use]
    pub fn release(&self, tag: &str) -> Option<&Release> {
        self.releases.iter().find(|r| r.tag == tag)
    }

    /// Every release, oldest first
    #[must_use]
    pub fn releases(&self) -> &[Release] {
        &self.releases
    }
}
