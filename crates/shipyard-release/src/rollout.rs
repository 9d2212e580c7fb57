//! Staged traffic rollout.
//!
//! A canary moves through its weight ladder, observing the probe set for the
//! plan's dwell at every stage below 100%:
//!
//! ```text
//! Initiated -> PartialRollout(w1) -> HealthCheck(w1) -> PartialRollout(w2) -> ... -> Promoted
//!                                          |
//!                                          +-> RolledBack (weight 0)
//! ```
//!
//! Blue-green smoke-tests the idle version at 0% and then cuts over to 100%
//! in one step. A failing probe, a router error or a cancellation sends the
//! weight back to 0. Only a failed rollback is fatal.

use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use shipyard_core::rollout::Weight;
use shipyard_core::{PipelineError, RolloutPlan, RolloutStrategy};
use shipyard_executor::CancelSignal;

use crate::ReleaseResult;
use crate::probe::HealthProbe;
use crate::router::TrafficRouter;

/// Rollout states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutState {
    /// Nothing routed yet
    Initiated,
    /// `weight` percent routed to the new version
    PartialRollout {
        /// Current weight
        weight: Weight,
    },
    /// Observing probes at `weight`
    HealthCheck {
        /// Current weight
        weight: Weight,
    },
    /// All traffic on the new version
    Promoted,
    /// Traffic returned to the old version
    RolledBack {
        /// Probe that failed, if a probe caused the rollback
        probe: Option<String>,
    },
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiated => write!(f, "initiated"),
            Self::PartialRollout { weight } => write!(f, "partial rollout ({weight}%)"),
            Self::HealthCheck { weight } => write!(f, "health check ({weight}%)"),
            Self::Promoted => write!(f, "promoted"),
            Self::RolledBack { probe: Some(probe) } => write!(f, "rolled back ({probe} failed)"),
            Self::RolledBack { probe: None } => write!(f, "rolled back"),
        }
    }
}

/// How a rollout ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutOutcome {
    /// Weight reached 100%
    Promoted,
    /// A probe failed and traffic went back to 0%
    RolledBack {
        /// Failing probe
        probe: String,
        /// Failure reason
        reason: String,
    },
    /// Cancelled; traffic went back to 0%
    Cancelled,
}

/// Everything a rollout went through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutReport {
    /// Deployment target
    pub target: String,
    /// Every state entered, in order
    pub states: Vec<RolloutState>,
    /// Weight left in place
    pub final_weight: Weight,
    /// Terminal result
    pub outcome: RolloutOutcome,
}

impl RolloutReport {
    /// Last state entered
    #[must_use]
    pub fn state(&self) -> Option<&RolloutState> {
        self.states.last()
    }

    /// One-line summary for step reports
    #[must_use]
    pub fn summary(&self) -> String {
        match &self.outcome {
            RolloutOutcome::Promoted => format!("rollout of '{}' promoted to 100%", self.target),
            RolloutOutcome::RolledBack { probe, reason } => format!(
                "rollout of '{}' rolled back to {}%: {}",
                self.target,
                self.final_weight,
                PipelineError::HealthCheckFailed {
                    probe: probe.clone(),
                    reason: reason.clone(),
                }
            ),
            RolloutOutcome::Cancelled => format!("rollout of '{}' cancelled and rolled back", self.target),
        }
    }
}

enum Observation {
    Healthy,
    Unhealthy { probe: String, reason: String },
    Cancelled,
}

/// Runs rollout plans against a router and a probe
#[derive(Debug, Clone)]
pub struct RolloutController {
    router: Arc<dyn TrafficRouter>,
    probe: Arc<dyn HealthProbe>,
}

struct Progress<'a> {
    target: &'a str,
    states: Vec<RolloutState>,
    weight: Weight,
}

impl Progress<'_> {
    fn enter(&mut self, state: RolloutState) {
        info!(deployment = %self.target, state = %state, "rollout state");
        self.states.push(state);
    }

    fn finish(self, outcome: RolloutOutcome) -> RolloutReport {
        RolloutReport {
            target: self.target.to_string(),
            states: self.states,
            final_weight: self.weight,
            outcome,
        }
    }
}

impl RolloutController {
    /// Controller shifting traffic with `router`, judged by `probe`
    #[must_use]
    pub fn new(router: Arc<dyn TrafficRouter>, probe: Arc<dyn HealthProbe>) -> Self {
        Self { router, probe }
    }

    /// Runs `plan` to a terminal state
    ///
    /// Returns a report for promoted, rolled back and cancelled rollouts. A
    /// router error while escalating is returned after traffic has been put
    /// back to 0%; a router error during rollback is
    /// [`PipelineError::RollbackFailed`].
    pub async fn run(&self, plan: &RolloutPlan, cancel: &CancelSignal) -> ReleaseResult<RolloutReport> {
        let mut progress = Progress {
            target: &plan.target,
            states: Vec::new(),
            weight: 0,
        };
        progress.enter(RolloutState::Initiated);

        let ladder: Vec<Weight> = match &plan.strategy {
            RolloutStrategy::Canary { weights } => weights.clone(),
            RolloutStrategy::BlueGreen => {
                progress.enter(RolloutState::HealthCheck { weight: 0 });
                match self.observe(plan, true, cancel).await {
                    Observation::Healthy => vec![100],
                    Observation::Unhealthy { probe, reason } => {
                        return self.roll_back(progress, RolloutOutcome::RolledBack { probe, reason }).await;
                    }
                    Observation::Cancelled => return self.roll_back(progress, RolloutOutcome::Cancelled).await,
                }
            }
        };

        for weight in ladder {
            if cancel.is_cancelled() {
                return self.roll_back(progress, RolloutOutcome::Cancelled).await;
            }
            if let Err(e) = self.router.set_weight(&plan.target, weight).await {
                warn!(deployment = %plan.target, weight, error = %e, "escalation failed, rolling back");
                // The router may have applied part of the change.
                progress.weight = weight;
                self.roll_back(progress, RolloutOutcome::Cancelled).await?;
                return Err(e);
            }
            progress.weight = weight;
            progress.enter(RolloutState::PartialRollout { weight });
            if weight >= 100 {
                break;
            }

            progress.enter(RolloutState::HealthCheck { weight });
            match self.observe(plan, false, cancel).await {
                Observation::Healthy => {}
                Observation::Unhealthy { probe, reason } => {
                    return self.roll_back(progress, RolloutOutcome::RolledBack { probe, reason }).await;
                }
                Observation::Cancelled => return self.roll_back(progress, RolloutOutcome::Cancelled).await,
            }
        }

        progress.enter(RolloutState::Promoted);
        Ok(progress.finish(RolloutOutcome::Promoted))
    }

    async fn roll_back(&self, mut progress: Progress<'_>, outcome: RolloutOutcome) -> ReleaseResult<RolloutReport> {
        if progress.weight > 0 {
            self.router.set_weight(progress.target, 0).await.map_err(|e| PipelineError::RollbackFailed {
                reason: format!("'{}' left at {}%: {e}", progress.target, progress.weight),
            })?;
            progress.weight = 0;
        }
        let probe = match &outcome {
            RolloutOutcome::RolledBack { probe, .. } => Some(probe.clone()),
            _ => None,
        };
        warn!(deployment = %progress.target, probe = ?probe, "rolled back");
        progress.enter(RolloutState::RolledBack { probe });
        Ok(progress.finish(outcome))
    }

    /// Probe rounds until the dwell ends; a smoke test is a single round
    async fn observe(&self, plan: &RolloutPlan, smoke: bool, cancel: &CancelSignal) -> Observation {
        let deadline = Instant::now() + plan.dwell;
        loop {
            let round = async {
                for probe in &plan.probes {
                    if let Err(reason) = self.probe.check(probe).await {
                        return Observation::Unhealthy {
                            probe: probe.name.clone(),
                            reason,
                        };
                    }
                }
                Observation::Healthy
            };
            let result = tokio::select! {
                result = round => result,
                () = cancel.cancelled() => Observation::Cancelled,
            };
            if !matches!(result, Observation::Healthy) || smoke || Instant::now() + plan.probe_interval > deadline {
                return result;
            }
            tokio::select! {
                () = tokio::time::sleep(plan.probe_interval) => {}
                () = cancel.cancelled() => return Observation::Cancelled,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use shipyard_core::{ProbeCheck, ProbeSpec};
    use shipyard_executor::CancelHandle;
    use std::time::Duration;

    use crate::{ReleaseErrorKind, ReleaseError};

    /// Records weights; fails on the weights listed in `refuse`
    #[derive(Debug, Default)]
    pub(crate) struct FakeRouter {
        pub(crate) weights: Mutex<Vec<Weight>>,
        pub(crate) refuse: Vec<Weight>,
    }

    #[async_trait]
    impl TrafficRouter for FakeRouter {
        async fn set_weight(&self, target: &str, weight: Weight) -> ReleaseResult {
            if self.refuse.contains(&weight) {
                return Err(ReleaseError::from(ReleaseErrorKind::Router {
                    target: target.to_string(),
                    weight,
                    reason: "load balancer unreachable".to_string(),
                }));
            }
            self.weights.lock().push(weight);
            Ok(())
        }
    }

    /// Reads the router's current weight; the named probe fails at or above `fail_at`
    #[derive(Debug)]
    pub(crate) struct FakeProbe {
        pub(crate) router: Arc<FakeRouter>,
        pub(crate) failing: &'static str,
        pub(crate) fail_at: Weight,
        pub(crate) checks: Mutex<usize>,
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn check(&self, probe: &ProbeSpec) -> Result<(), String> {
            *self.checks.lock() += 1;
            let weight = self.router.weights.lock().last().copied().unwrap_or_default();
            if probe.name == self.failing && weight >= self.fail_at {
                return Err(format!("error rate 7% at {weight}%"));
            }
            Ok(())
        }
    }

    fn probe(name: &str) -> ProbeSpec {
        ProbeSpec {
            name: name.to_string(),
            check: ProbeCheck::Run {
                command: format!("check-{name}"),
            },
        }
    }

    fn plan() -> RolloutPlan {
        RolloutPlan::canary("web")
            .with_timing(Duration::from_millis(30), Duration::from_millis(10))
            .with_probe(probe("latency"))
            .with_probe(probe("errors"))
    }

    fn controller(refuse: Vec<Weight>, fail_at: Weight) -> (RolloutController, Arc<FakeRouter>, Arc<FakeProbe>) {
        let router = Arc::new(FakeRouter {
            refuse,
            ..FakeRouter::default()
        });
        let probe = Arc::new(FakeProbe {
            router: router.clone(),
            failing: "errors",
            fail_at,
            checks: Mutex::new(0),
        });
        (RolloutController::new(router.clone(), probe.clone()), router, probe)
    }

    #[tokio::test]
    async fn test_canary_promotes() {
        let (controller, router, probe) = controller(Vec::new(), 101);
        let report = controller.run(&plan(), &CancelSignal::never()).await.unwrap();

        assert_eq!(report.outcome, RolloutOutcome::Promoted);
        assert_eq!(report.final_weight, 100);
        assert_eq!(*router.weights.lock(), vec![10, 50, 100]);
        assert_eq!(
            report.states,
            vec![
                RolloutState::Initiated,
                RolloutState::PartialRollout { weight: 10 },
                RolloutState::HealthCheck { weight: 10 },
                RolloutState::PartialRollout { weight: 50 },
                RolloutState::HealthCheck { weight: 50 },
                RolloutState::PartialRollout { weight: 100 },
                RolloutState::Promoted,
            ]
        );
        // Several rounds per dwell window, two probes each.
        assert!(*probe.checks.lock() >= 8, "{}", probe.checks.lock());
    }

    #[tokio::test]
    async fn test_zero_dwell_runs_one_round() {
        let (controller, _, probe) = controller(Vec::new(), 101);
        let plan = plan().with_timing(Duration::ZERO, Duration::from_secs(60));
        controller.run(&plan, &CancelSignal::never()).await.unwrap();
        assert_eq!(*probe.checks.lock(), 4);
    }

    #[tokio::test]
    async fn test_blue_green_smoke_then_cutover() {
        let (controller, router, fake) = controller(Vec::new(), 101);
        let plan = RolloutPlan::blue_green("web").with_probe(probe("errors"));
        let report = controller.run(&plan, &CancelSignal::never()).await.unwrap();

        assert_eq!(*router.weights.lock(), vec![100]);
        assert_eq!(*fake.checks.lock(), 1);
        assert_eq!(
            report.states,
            vec![
                RolloutState::Initiated,
                RolloutState::HealthCheck { weight: 0 },
                RolloutState::PartialRollout { weight: 100 },
                RolloutState::Promoted,
            ]
        );
    }

    #[tokio::test]
    async fn test_blue_green_failed_smoke_never_switches() {
        let (controller, router, _) = controller(Vec::new(), 0);
        let plan = RolloutPlan::blue_green("web").with_probe(probe("errors"));
        let report = controller.run(&plan, &CancelSignal::never()).await.unwrap();

        assert!(router.weights.lock().is_empty());
        assert_eq!(report.final_weight, 0);
        assert_eq!(
            report.state(),
            Some(&RolloutState::RolledBack {
                probe: Some("errors".to_string())
            })
        );
    }

    #[tokio::test]
    async fn test_router_error_rolls_back_then_fails() {
        let (controller, router, _) = controller(vec![50], 101);
        let err = controller.run(&plan(), &CancelSignal::never()).await.unwrap_err();
        assert!(matches!(err.kind(), ReleaseErrorKind::Router { weight: 50, .. }));
        assert_eq!(*router.weights.lock(), vec![10, 0]);
    }

    #[tokio::test]
    async fn test_failed_rollback_is_fatal() {
        let (controller, _, _) = controller(vec![0], 50);
        let err = controller.run(&plan(), &CancelSignal::never()).await.unwrap_err();
        assert!(matches!(err.kind(), ReleaseErrorKind::Pipeline(PipelineError::RollbackFailed { .. })));
        assert!(err.to_string().contains("'web' left at 50%"), "{err}");
    }

    #[tokio::test]
    async fn test_cancel_rolls_back() {
        let (controller, router, _) = controller(Vec::new(), 101);
        let plan = plan().with_timing(Duration::from_secs(60), Duration::from_millis(10));
        let cancel = CancelHandle::new();
        let signal = cancel.signal();
        let run = tokio::spawn(async move { controller.run(&plan, &signal).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let report = run.await.unwrap().unwrap();
        assert_eq!(report.outcome, RolloutOutcome::Cancelled);
        assert_eq!(report.final_weight, 0);
        assert_eq!(*router.weights.lock(), vec![10, 0]);
    }
}
