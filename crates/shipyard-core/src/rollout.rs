//! Rollout plans for canary and blue-green promotion.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::validation::{Validate, ValidationError};

/// Traffic weight, in percent
pub type Weight = u8;

/// How traffic moves to the new version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum RolloutStrategy {
    /// Staged escalation through `weights`, health-checked at each stage
    Canary {
        /// Escalation ladder, strictly increasing and ending at 100
        weights: Vec<Weight>,
    },
    /// One smoke test, then a single 0 -> 100 cutover
    BlueGreen,
}

impl RolloutStrategy {
    /// The default canary ladder
    #[must_use]
    pub fn default_canary() -> Self {
        Self::Canary {
            weights: vec![10, 50, 100],
        }
    }
}

/// A single health probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    /// Name reported when the probe fails
    pub name: String,
    /// What the probe checks
    #[serde(flatten)]
    pub check: ProbeCheck,
}

/// The check a probe performs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", deny_unknown_fields)]
pub enum ProbeCheck {
    /// HTTP GET that must answer with `expect_status` (any 2xx when unset)
    Http {
        /// URL to request
        url: String,
        /// Required status code
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect_status: Option<u16>,
    },
    /// Command that must exit zero
    Run {
        /// Shell command
        command: String,
    },
}

/// A complete rollout plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutPlan {
    /// Deployment target the router shifts traffic for
    pub target: String,
    /// Canary or blue-green
    #[serde(flatten)]
    pub strategy: RolloutStrategy,
    /// How long each health-check stage observes the probes
    #[serde(with = "humantime_serde")]
    pub dwell: Duration,
    /// Pause between probe rounds inside one dwell window
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    /// Probe set evaluated at every health-check stage
    pub probes: Vec<ProbeSpec>,
}

impl RolloutPlan {
    /// Default dwell per stage
    pub const DEFAULT_DWELL: Duration = Duration::from_secs(60);
    /// Default pause between probe rounds
    pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

    /// Creates a canary plan with the default ladder
    #[must_use]
    pub fn canary(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            strategy: RolloutStrategy::default_canary(),
            dwell: Self::DEFAULT_DWELL,
            probe_interval: Self::DEFAULT_PROBE_INTERVAL,
            probes: Vec::new(),
        }
    }

    /// Creates a blue-green plan
    #[must_use]
    pub fn blue_green(target: impl Into<String>) -> Self {
        Self {
            strategy: RolloutStrategy::BlueGreen,
            ..Self::canary(target)
        }
    }

    /// Replaces the canary ladder
    #[must_use]
    pub fn with_weights(mut self, weights: Vec<Weight>) -> Self {
        self.strategy = RolloutStrategy::Canary { weights };
        self
    }

    /// Sets the dwell window and probe interval
    #[must_use]
    pub fn with_timing(mut self, dwell: Duration, probe_interval: Duration) -> Self {
        self.dwell = dwell;
        self.probe_interval = probe_interval;
        self
    }

    /// Adds a probe
    #[must_use]
    pub fn with_probe(mut self, probe: ProbeSpec) -> Self {
        self.probes.push(probe);
        self
    }
}

impl Validate for RolloutPlan {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        let invalid = |input: &str, reason: &str| ValidationError::InvalidInput {
            action: "rollout".to_string(),
            input: input.to_string(),
            reason: reason.to_string(),
        };

        if self.target.trim().is_empty() {
            return Err(invalid("target", "must not be empty"));
        }
        if self.probe_interval.is_zero() {
            return Err(invalid("probe-interval", "must be greater than zero"));
        }
        if let RolloutStrategy::Canary { weights } = &self.strategy {
            if weights.is_empty() {
                return Err(invalid("weights", "at least one weight is required"));
            }
            if weights.iter().any(|w| *w == 0 || *w > 100) {
                return Err(invalid("weights", "each weight must be within 1..=100"));
            }
            if weights.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(invalid("weights", "weights must be strictly increasing"));
            }
            if weights.last() != Some(&100) {
                return Err(invalid("weights", "the last weight must be 100"));
            }
        }
        let mut names = std::collections::HashSet::new();
        for probe in &self.probes {
            if !names.insert(probe.name.as_str()) {
                return Err(invalid("probes", "probe names must be unique"));
            }
        }
        Ok(())
    }
}
