//! Canary scenario: 10% passes, the error-rate probe fails at 50%, traffic
//! goes back to 0% and the step reports which probe failed.

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use shipyard_core::rollout::Weight;
use shipyard_core::{ActionKind, ProbeSpec, ResolvedPipeline, RolloutPlan};
use shipyard_executor::{
    CancelSignal, ExecutionConfig, ExecutionContext, LocalRunner, StaticSecretStore, StepExecutor,
};
use shipyard_release::{
    HealthProbe, ReleaseResult, RolloutController, RolloutHandler, RolloutOutcome, RolloutState, TrafficRouter,
};

const PIPELINE: &str = r"
name: web
jobs:
  - name: promote
    steps:
      - uses: canary-rollout
        with:
          target: web
          weights: [10, 50, 100]
          dwell: 40ms
          probe-interval: 10ms
          probes:
            - name: latency
              run:
                command: check-latency
            - name: error-rate
              http:
                url: http://web.internal/metrics/errors
";

#[derive(Debug, Default)]
struct LoadBalancer {
    weights: Mutex<Vec<Weight>>,
}

impl LoadBalancer {
    fn current(&self) -> Weight {
        self.weights.lock().last().copied().unwrap_or_default()
    }
}

#[async_trait]
impl TrafficRouter for LoadBalancer {
    async fn set_weight(&self, _target: &str, weight: Weight) -> ReleaseResult {
        self.weights.lock().push(weight);
        Ok(())
    }
}

/// Error rate climbs once half the traffic reaches the new version
#[derive(Debug)]
struct Metrics {
    lb: Arc<LoadBalancer>,
}

#[async_trait]
impl HealthProbe for Metrics {
    async fn check(&self, probe: &ProbeSpec) -> Result<(), String> {
        match (probe.name.as_str(), self.lb.current()) {
            ("error-rate", weight) if weight >= 50 => Err("5xx rate 12% above 2% budget".to_string()),
            _ => Ok(()),
        }
    }
}

fn controller() -> (Arc<RolloutController>, Arc<LoadBalancer>) {
    let lb = Arc::new(LoadBalancer::default());
    let metrics = Arc::new(Metrics { lb: lb.clone() });
    (Arc::new(RolloutController::new(lb.clone(), metrics)), lb)
}

fn plan(pipeline: &ResolvedPipeline) -> RolloutPlan {
    let job = pipeline.definition().job("promote").unwrap();
    match &job.steps[0].kind {
        shipyard_core::StepKind::Uses { action: shipyard_core::Action::Rollout(plan) } => plan.clone(),
        other => panic!("expected a rollout step, got {other:?}"),
    }
}

#[tokio::test]
async fn test_canary_rolls_back_at_fifty_percent() {
    let pipeline = ResolvedPipeline::load(PIPELINE).unwrap();
    let (controller, lb) = controller();

    let report = controller.run(&plan(&pipeline), &CancelSignal::never()).await.unwrap();

    assert_eq!(
        report.states,
        vec![
            RolloutState::Initiated,
            RolloutState::PartialRollout { weight: 10 },
            RolloutState::HealthCheck { weight: 10 },
            RolloutState::PartialRollout { weight: 50 },
            RolloutState::HealthCheck { weight: 50 },
            RolloutState::RolledBack {
                probe: Some("error-rate".to_string())
            },
        ]
    );
    assert_eq!(report.final_weight, 0);
    assert_eq!(
        report.outcome,
        RolloutOutcome::RolledBack {
            probe: "error-rate".to_string(),
            reason: "5xx rate 12% above 2% budget".to_string(),
        }
    );
    assert_eq!(*lb.weights.lock(), vec![10, 50, 0]);
}

#[tokio::test]
async fn test_rollback_surfaces_as_report_on_the_job() {
    let pipeline = ResolvedPipeline::load(PIPELINE).unwrap();
    let (controller, lb) = controller();
    let executor = StepExecutor::new(Arc::new(LocalRunner::default()), Arc::new(StaticSecretStore::new()))
        .with_handler(ActionKind::Rollout, Arc::new(RolloutHandler::new(controller)))
        .with_retry_delay(Duration::ZERO);

    let dir = TempDir::new().unwrap();
    let config = ExecutionConfig {
        workspace_root: dir.path().to_path_buf(),
        ..ExecutionConfig::default()
    };
    let ctx = ExecutionContext::new(&config, Uuid::new_v4(), "promote", "4f2c9e1").unwrap();
    let job = pipeline.definition().job("promote").unwrap();

    let report = executor.execute_job(job, &ctx).await;
    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(
        report.reports,
        vec![
            "rollout of 'web' rolled back to 0%: health check 'error-rate' failed: 5xx rate 12% above 2% budget"
                .to_string()
        ]
    );
    assert_eq!(lb.current(), 0);
}
