//! Environment gate.
//!
//! [`authorize`] decides whether a job may enter its environment given the
//! current approval request. [`ApprovalBook`] owns those requests: it opens
//! them, records every decision in the event store and lets a gated job
//! suspend until the request is decided, the approval timeout elapses or the
//! run is cancelled.
//!
//! Decisions may come from this process ([`ApprovalBook::grant`]) or from
//! another one appending to the same store (`shipyard approve`). In-process
//! decisions wake waiters at once; foreign ones are picked up by polling.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use shipyard_core::{ApprovalRequest, ApprovalState, EnvironmentSpec, Job, RunId};
use shipyard_events::{ApprovalEvent, EventEnvelope, EventStore, History};
use shipyard_executor::{CancelSignal, SecretStore};

use crate::{WorkerError, WorkerErrorKind, WorkerResult};

/// Default interval between store polls while a job waits for approval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Gate verdict for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// The job may run
    Allow,
    /// An approver rejected the job
    Deny {
        /// Identity that rejected
        approver: String,
    },
    /// Some required approvers have not granted yet
    Pending {
        /// Approvers still missing, sorted
        outstanding: Vec<String>,
    },
}

/// Decides whether `job` may enter `environment`
///
/// Ungated environments always allow. A gated one allows once every required
/// approver granted, denies after an explicit rejection and is pending
/// otherwise, including before any request exists.
#[must_use]
pub fn authorize(job: &str, environment: &EnvironmentSpec, approvals: Option<&ApprovalRequest>) -> GateDecision {
    if !environment.is_gated() {
        return GateDecision::Allow;
    }
    let decision = match approvals.map(|r| &r.state) {
        Some(ApprovalState::Rejected { by }) => GateDecision::Deny {
            approver: by.clone(),
        },
        Some(ApprovalState::Approved) => GateDecision::Allow,
        _ => {
            let outstanding: Vec<String> = environment
                .required_approvers
                .iter()
                .filter(|a| approvals.is_none_or(|r| !r.granted.contains(*a)))
                .cloned()
                .collect();
            if outstanding.is_empty() {
                GateDecision::Allow
            } else {
                GateDecision::Pending { outstanding }
            }
        }
    };
    debug!(job, environment = %environment.name, ?decision, "gate evaluated");
    decision
}

/// Secrets the steps of `job` need that `secrets` cannot provide in `environment`
#[must_use]
pub fn missing_secrets(job: &Job, environment: &EnvironmentSpec, secrets: &dyn SecretStore) -> Vec<String> {
    let mut missing: Vec<String> = job
        .steps
        .iter()
        .flat_map(|step| step.required_secrets())
        .filter(|name| secrets.get(&environment.name, name).is_none())
        .map(str::to_string)
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

/// How a gated job's wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateResolution {
    /// Every required approver granted
    Allowed,
    /// An approver rejected
    Denied {
        /// Identity that rejected
        approver: String,
    },
    /// The approval timeout elapsed; the request is now expired
    TimedOut,
    /// The run was cancelled while waiting
    Cancelled,
}

/// Approval requests of gated jobs, backed by the event store
pub struct ApprovalBook {
    store: Arc<dyn EventStore>,
    requests: DashMap<(RunId, String), ApprovalRequest>,
    notify: Notify,
    poll_interval: Duration,
    source: String,
}

impl std::fmt::Debug for ApprovalBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalBook")
            .field("store", &self.store)
            .field("open", &self.requests.len())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl ApprovalBook {
    /// Creates a book recording to `store`
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            requests: DashMap::new(),
            notify: Notify::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            source: "scheduler".to_string(),
        }
    }

    /// Sets how often waiters re-read the store
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the source stamped on recorded events
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// The backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    async fn record(&self, event: ApprovalEvent) -> WorkerResult {
        self.store
            .append(&[EventEnvelope::record(event, &self.source)])
            .await?;
        Ok(())
    }

    fn key(run_id: RunId, job: &str) -> (RunId, String) {
        (run_id, job.to_string())
    }

    /// Keeps open requests only; decided ones live in the store alone
    fn remember(&self, request: &ApprovalRequest) {
        let key = Self::key(request.run_id, &request.job);
        if request.is_open() {
            self.requests.insert(key, request.clone());
        } else {
            self.requests.remove(&key);
        }
    }

    /// Number of undecided requests held in memory
    #[must_use]
    pub fn open_requests(&self) -> usize {
        self.requests.len()
    }

    /// Opens a request and records it
    pub async fn open(&self, request: ApprovalRequest) -> WorkerResult {
        self.record(ApprovalEvent::Requested {
            request: request.clone(),
        })
        .await?;
        info!(
            run_id = %request.run_id,
            job = %request.job,
            environment = %request.environment,
            approvers = ?request.required,
            "approval requested"
        );
        self.remember(&request);
        Ok(())
    }

    /// Latest request of a job, refreshed from the store
    pub async fn current(&self, run_id: RunId, job: &str) -> WorkerResult<Option<ApprovalRequest>> {
        let events = self.store.events_for(&run_id).await?;
        let history = History::replay(&events);
        if let Some(request) = history.approval(&run_id, job) {
            self.remember(request);
            return Ok(Some(request.clone()));
        }
        Ok(self.requests.get(&Self::key(run_id, job)).map(|r| r.clone()))
    }

    async fn open_request(&self, run_id: RunId, job: &str, identity: &str) -> WorkerResult<ApprovalRequest> {
        let request = self
            .current(run_id, job)
            .await?
            .ok_or_else(|| WorkerError::from(WorkerErrorKind::NoApprovalRequest {
                run_id,
                job: job.to_string(),
            }))?;
        if !request.is_open() {
            return Err(WorkerErrorKind::ApprovalClosed {
                run_id,
                job: job.to_string(),
            }
            .into());
        }
        if !request.required.contains(identity) {
            return Err(WorkerErrorKind::NotAnApprover {
                identity: identity.to_string(),
                job: job.to_string(),
            }
            .into());
        }
        Ok(request)
    }

    /// Records a grant by `identity` and wakes waiters
    pub async fn grant(&self, run_id: RunId, job: &str, identity: &str) -> WorkerResult<ApprovalRequest> {
        let mut request = self.open_request(run_id, job, identity).await?;
        self.record(ApprovalEvent::Granted {
            run_id,
            job: job.to_string(),
            identity: identity.to_string(),
        })
        .await?;
        request.grant(identity);
        info!(run_id = %run_id, job, identity, state = ?request.state, "approval granted");
        self.remember(&request);
        self.notify.notify_waiters();
        Ok(request)
    }

    /// Records a rejection by `identity` and wakes waiters
    pub async fn reject(&self, run_id: RunId, job: &str, identity: &str) -> WorkerResult<ApprovalRequest> {
        let mut request = self.open_request(run_id, job, identity).await?;
        self.record(ApprovalEvent::Rejected {
            run_id,
            job: job.to_string(),
            identity: identity.to_string(),
        })
        .await?;
        request.reject(identity);
        info!(run_id = %run_id, job, identity, "approval rejected");
        self.remember(&request);
        self.notify.notify_waiters();
        Ok(request)
    }

    async fn expire(&self, run_id: RunId, job: &str) {
        if let Err(e) = self
            .record(ApprovalEvent::Expired {
                run_id,
                job: job.to_string(),
            })
            .await
        {
            warn!(run_id = %run_id, job, error = %e, "failed to record approval expiry");
        }
        self.requests.remove(&Self::key(run_id, job));
    }

    /// Suspends until the request of `job` is decided
    ///
    /// Store read failures are logged and retried at the next poll. The
    /// request leaves memory once the wait resolves, however it resolves.
    pub async fn wait(
        &self,
        run_id: RunId,
        job: &str,
        environment: &EnvironmentSpec,
        timeout: Option<Duration>,
        cancel: &CancelSignal,
    ) -> GateResolution {
        let resolution = self.await_decision(run_id, job, environment, timeout, cancel).await;
        self.requests.remove(&Self::key(run_id, job));
        resolution
    }

    async fn await_decision(
        &self,
        run_id: RunId,
        job: &str,
        environment: &EnvironmentSpec,
        timeout: Option<Duration>,
        cancel: &CancelSignal,
    ) -> GateResolution {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let request = match self.current(run_id, job).await {
                Ok(request) => request,
                Err(e) => {
                    warn!(run_id = %run_id, job, error = %e, "failed to refresh approval");
                    self.requests.get(&Self::key(run_id, job)).map(|r| r.clone())
                }
            };
            match authorize(job, environment, request.as_ref()) {
                GateDecision::Allow => return GateResolution::Allowed,
                GateDecision::Deny { approver } => return GateResolution::Denied { approver },
                GateDecision::Pending { .. } => {}
            }

            let expiry = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(self.poll_interval) => {}
                () = expiry => {
                    self.expire(run_id, job).await;
                    return GateResolution::TimedOut;
                }
                () = cancel.cancelled() => return GateResolution::Cancelled,
            }
        }
    }
}
