//! Approval requests for gated environments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::run::RunId;

/// Open/closed state of an approval request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ApprovalState {
    /// Waiting for approvers
    Open,
    /// Every required approver granted
    Approved,
    /// Closed by an explicit rejection
    Rejected {
        /// Identity that rejected
        by: String,
    },
    /// Closed because the pipeline's approval timeout elapsed
    Expired,
}

/// Approval request raised when a job reaches a gated environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Run the job belongs to
    pub run_id: RunId,
    /// Gated job
    pub job: String,
    /// Environment being entered
    pub environment: String,
    /// Identities that must all grant
    pub required: BTreeSet<String>,
    /// Identities that have granted so far
    #[serde(default)]
    pub granted: BTreeSet<String>,
    /// Current state
    pub state: ApprovalState,
    /// Creation time
    pub opened_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Opens a request
    #[must_use]
    pub fn open(
        run_id: RunId,
        job: impl Into<String>,
        environment: impl Into<String>,
        required: BTreeSet<String>,
    ) -> Self {
        Self {
            run_id,
            job: job.into(),
            environment: environment.into(),
            required,
            granted: BTreeSet::new(),
            state: ApprovalState::Open,
            opened_at: Utc::now(),
        }
    }

    /// Returns true while approvers can still act
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == ApprovalState::Open
    }

    /// Required approvers who have not granted yet
    pub fn outstanding(&self) -> impl Iterator<Item = &str> {
        self.required.difference(&self.granted).map(String::as_str)
    }

    /// Records a grant; closes the request once every required approver granted.
    ///
    /// Grants on a closed request are ignored.
    pub fn grant(&mut self, identity: impl Into<String>) {
        if !self.is_open() {
            return;
        }
        self.granted.insert(identity.into());
        if self.required.is_subset(&self.granted) {
            self.state = ApprovalState::Approved;
        }
    }

    /// Closes the request as rejected, unless it is already closed
    pub fn reject(&mut self, identity: impl Into<String>) {
        if self.is_open() {
            self.state = ApprovalState::Rejected { by: identity.into() };
        }
    }

    /// Closes the request as expired, unless it is already closed
    pub fn expire(&mut self) {
        if self.is_open() {
            self.state = ApprovalState::Expired;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request(approvers: &[&str]) -> ApprovalRequest {
        ApprovalRequest::open(
            Uuid::new_v4(),
            "deploy-production",
            "production",
            approvers.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_closes_when_all_required_granted() {
        let mut req = request(&["alice", "bob"]);
        req.grant("alice");
        assert!(req.is_open());
        assert_eq!(req.outstanding().collect::<Vec<_>>(), vec!["bob"]);
        req.grant("mallory");
        assert!(req.is_open());
        req.grant("bob");
        assert_eq!(req.state, ApprovalState::Approved);
    }

    #[test]
    fn test_rejection_is_final() {
        let mut req = request(&["alice"]);
        req.reject("alice");
        req.grant("alice");
        assert_eq!(
            req.state,
            ApprovalState::Rejected {
                by: "alice".to_string()
            }
        );
    }

    #[test]
    fn test_expiry_closes_only_open_requests() {
        let mut req = request(&["alice"]);
        req.expire();
        assert_eq!(req.state, ApprovalState::Expired);

        let mut req = request(&["alice"]);
        req.grant("alice");
        req.expire();
        assert_eq!(req.state, ApprovalState::Approved);
    }
}
