//! Named chaos drills.

use forge_core::adversarial::{AdversarialConfig, ChaosProfile};
use forge_core::latency::LatencyRange;
use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// Custom profile, half of all actions jittered by 10-50ms
    SteadyJitter,

    /// Bursty latency spikes
    FlakyWifi,

    /// Periodic outage windows on the virtual clock
    DataCenterOutage,

    /// Every action rejected
    Partition,

    /// 30% of actions dropped
    PacketLoss,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyJitter,
            ScenarioId::FlakyWifi,
            ScenarioId::DataCenterOutage,
            ScenarioId::Partition,
            ScenarioId::PacketLoss,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyJitter => "steady_jitter",
            ScenarioId::FlakyWifi => "flaky_wifi",
            ScenarioId::DataCenterOutage => "data_center_outage",
            ScenarioId::Partition => "partition",
            ScenarioId::PacketLoss => "packet_loss",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyJitter => "50% of actions delayed 10-50ms, nothing dropped",
            ScenarioId::FlakyWifi => "Sticky latency bursts at 10x the base delay",
            ScenarioId::DataCenterOutage => "1s outage every 2s of virtual time, 50-100ms otherwise",
            ScenarioId::Partition => "Network partition: no action reaches the world",
            ScenarioId::PacketLoss => "30% of actions silently dropped",
        }
    }

    /// Whether a healthy run makes any progress at all.
    pub fn expects_progress(&self) -> bool {
        !matches!(self, ScenarioId::Partition)
    }

    /// Middleware configuration for this drill, seeded from `seed`.
    pub fn adversary(&self, seed: u64) -> AdversarialConfig {
        let base = match self {
            ScenarioId::SteadyJitter => AdversarialConfig::profile(ChaosProfile::Custom)
                .with_jitter(0.5, LatencyRange::new(0.01, 0.05)),
            ScenarioId::FlakyWifi => AdversarialConfig::profile(ChaosProfile::FlakyWifi)
                .with_jitter(0.0, LatencyRange::new(0.01, 0.05))
                .with_spikes(0.1, 10.0),
            ScenarioId::DataCenterOutage => AdversarialConfig::profile(ChaosProfile::DataCenterOutage)
                .with_jitter(1.0, LatencyRange::new(0.05, 0.1))
                .with_outages(2.0, 1.0),
            ScenarioId::Partition => AdversarialConfig::profile(ChaosProfile::Custom).with_partition(true),
            ScenarioId::PacketLoss => AdversarialConfig::profile(ChaosProfile::Custom).with_drop_rate(0.3),
        };
        base.with_seed(seed)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady_jitter" | "jitter" => Ok(ScenarioId::SteadyJitter),
            "flaky_wifi" | "wifi" => Ok(ScenarioId::FlakyWifi),
            "data_center_outage" | "outage" => Ok(ScenarioId::DataCenterOutage),
            "partition" | "split" => Ok(ScenarioId::Partition),
            "packet_loss" | "loss" => Ok(ScenarioId::PacketLoss),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>().unwrap(), scenario);
        }
        assert!("time_warp".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_adversary_configs_are_enabled_and_seeded() {
        for scenario in ScenarioId::all() {
            let config = scenario.adversary(7);
            assert!(config.enabled, "{} disabled", scenario);
            assert_eq!(config.seed, Some(7));
        }
        assert!(ScenarioId::Partition.adversary(0).network_partition);
        assert_eq!(ScenarioId::FlakyWifi.adversary(0).profile_name, ChaosProfile::FlakyWifi);
    }
}
