//! Coarse "stress config" consumed by the engine.
//!
//! This is the older of the engine's two chaos paths. It applies inside
//! `get_state`/`get_feedback` and can fabricate a failure that reaches the
//! caller. It also seeds the default [`AdversarialConfig`] when none is
//! supplied explicitly.

use crate::adversarial::AdversarialConfig;
use crate::error::ConfigError;
use crate::latency::{clamp_rate, LatencyRange};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    /// Latency slept before state/feedback reads
    pub latency_range: Option<LatencyRange>,

    /// Probability a state/feedback read fails with `SimulatedFailure`
    pub failure_rate: Option<f64>,

    /// Jitter probability handed to the derived adversarial config
    pub latency_rate: Option<f64>,

    pub seed: Option<u64>,
}

impl StressConfig {
    pub fn with_latency(mut self, range: LatencyRange) -> Self {
        self.latency_range = Some(range);
        self
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = Some(rate);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// True when no key is set.
    pub fn is_empty(&self) -> bool {
        self.latency_range.is_none()
            && self.failure_rate.is_none()
            && self.latency_rate.is_none()
            && self.seed.is_none()
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    /// Adversarial config implied by this stress config.
    ///
    /// Enabled whenever any stress key is set; `failure_rate` becomes the
    /// action drop rate and `latency_rate` the jitter rate.
    pub fn adversarial_config(&self) -> AdversarialConfig {
        AdversarialConfig {
            enabled: !self.is_empty(),
            seed: self.seed,
            jitter_rate: self.latency_rate.unwrap_or(0.0),
            latency_range: self.latency_range.unwrap_or_default(),
            drop_rate: self.failure_rate.unwrap_or(0.0),
            ..AdversarialConfig::default()
        }
        .normalized()
    }

    pub(crate) fn effective_failure_rate(&self) -> Option<f64> {
        self.failure_rate.map(clamp_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stress_disables_adversary() {
        let stress = StressConfig::default();
        assert!(stress.is_empty());
        assert!(!stress.adversarial_config().enabled);
    }

    #[test]
    fn test_adversary_derived_from_stress() {
        let stress = StressConfig::from_json(r#"{"latency_range": [0.2, 0.1], "failure_rate": 1.5, "seed": 3}"#).unwrap();
        let adv = stress.adversarial_config();

        assert!(adv.enabled);
        assert_eq!(adv.drop_rate, 1.0);
        assert_eq!(adv.latency_range, LatencyRange { min: 0.1, max: 0.2 });
        assert_eq!(adv.jitter_rate, 0.0);
        assert_eq!(adv.seed, Some(3));
        assert_eq!(stress.effective_failure_rate(), Some(1.0));
    }
}
