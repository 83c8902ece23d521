//! Adversarial fault-injection middleware.
//!
//! Sits in front of every agent action and decides, in order:
//!
//! 1. disabled → proceed immediately
//! 2. random drop (`drop_rate`) → reject
//! 3. `network_partition` → reject
//! 4. otherwise compute a profile-specific delay, sleep, proceed
//!
//! # Profiles
//!
//! - **custom**: `jitter_rate` chance of a uniform sample from `latency_range`
//! - **flaky_wifi**: two-state Markov chain. `spike_chance` to enter a
//!   burst, fixed [`BURST_EXIT_CHANCE`] to leave it. Latency is always
//!   sampled and multiplied by `spike_multiplier` while bursting.
//! - **data_center_outage**: scheduled on the context clock. Inside a
//!   window the delay is the time left in the window; outside it ordinary
//!   jitter applies.
//!
//! The decision is computed under a short lock and the sleep happens after
//! the lock is released, so `update_config` never waits on a sleeping
//! caller and always leaves a normalised configuration behind.

use crate::error::ConfigError;
use crate::latency::{clamp_rate, fires, Delay, LatencyRange};

use forge_env::{ChaCha8Rng, ForgeContext};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Probability per call that a flaky_wifi burst ends.
pub const BURST_EXIT_CHANCE: f64 = 0.3;

const ADVERSARY_RNG_STREAM: u64 = 0xAD5;

/// Named chaos profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChaosProfile {
    #[default]
    Custom,
    FlakyWifi,
    DataCenterOutage,
}

impl ChaosProfile {
    pub fn name(&self) -> &'static str {
        match self {
            ChaosProfile::Custom => "custom",
            ChaosProfile::FlakyWifi => "flaky_wifi",
            ChaosProfile::DataCenterOutage => "data_center_outage",
        }
    }
}

impl std::fmt::Display for ChaosProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ChaosProfile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "custom" => Ok(ChaosProfile::Custom),
            "flaky_wifi" | "flakywifi" => Ok(ChaosProfile::FlakyWifi),
            "data_center_outage" | "datacenteroutage" => Ok(ChaosProfile::DataCenterOutage),
            _ => Err(ConfigError::UnknownProfile(s.to_string())),
        }
    }
}

/// Configuration of the middleware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdversarialConfig {
    pub enabled: bool,

    /// Seed for the middleware RNG (context-derived if absent)
    pub seed: Option<u64>,

    /// Probability of applying jitter (custom profile and outside outages)
    pub jitter_rate: f64,

    /// (min, max) seconds
    pub latency_range: LatencyRange,

    /// Probability of dropping an action outright
    pub drop_rate: f64,

    /// If set, every action is rejected
    pub network_partition: bool,

    pub profile_name: ChaosProfile,

    /// flaky_wifi: probability of entering a burst
    pub spike_chance: f64,

    /// flaky_wifi: latency multiplier while bursting
    pub spike_multiplier: f64,

    /// data_center_outage: seconds between the end of one window and the next
    pub outage_interval: f64,

    /// data_center_outage: window length in seconds
    pub outage_duration: f64,
}

impl Default for AdversarialConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            seed: None,
            jitter_rate: 0.0,
            latency_range: LatencyRange::ZERO,
            drop_rate: 0.0,
            network_partition: false,
            profile_name: ChaosProfile::Custom,
            spike_chance: 0.05,
            spike_multiplier: 10.0,
            outage_interval: 30.0,
            outage_duration: 5.0,
        }
    }
}

fn non_negative(v: f64) -> f64 {
    if v.is_nan() || v < 0.0 {
        0.0
    } else {
        v
    }
}

impl AdversarialConfig {
    /// Enabled config with the given profile.
    pub fn profile(profile: ChaosProfile) -> Self {
        Self {
            enabled: true,
            profile_name: profile,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_jitter(mut self, rate: f64, range: LatencyRange) -> Self {
        self.jitter_rate = rate;
        self.latency_range = range;
        self
    }

    pub fn with_drop_rate(mut self, rate: f64) -> Self {
        self.drop_rate = rate;
        self
    }

    pub fn with_partition(mut self, partitioned: bool) -> Self {
        self.network_partition = partitioned;
        self
    }

    pub fn with_spikes(mut self, chance: f64, multiplier: f64) -> Self {
        self.spike_chance = chance;
        self.spike_multiplier = multiplier;
        self
    }

    pub fn with_outages(mut self, interval: f64, duration: f64) -> Self {
        self.outage_interval = interval;
        self.outage_duration = duration;
        self
    }

    /// Clamps rates into [0, 1], repairs the latency range, and floors the
    /// multiplier at 1 and the outage timings at 0.
    pub fn normalized(mut self) -> Self {
        self.jitter_rate = clamp_rate(self.jitter_rate);
        self.drop_rate = clamp_rate(self.drop_rate);
        self.spike_chance = clamp_rate(self.spike_chance);
        self.latency_range = self.latency_range.normalized();
        self.spike_multiplier = if self.spike_multiplier.is_nan() {
            1.0
        } else {
            self.spike_multiplier.max(1.0)
        };
        self.outage_interval = non_negative(self.outage_interval);
        self.outage_duration = non_negative(self.outage_duration);
        self
    }

    /// Parses a JSON document; missing fields take defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str::<Self>(text)
            .map(Self::normalized)
            .map_err(|e| ConfigError::Malformed(e.to_string()))
    }
}

/// Partial update for [`AdversarialMiddleware::update_config`].
///
/// Deserializes from a JSON map; keys that are not config fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdversarialPatch {
    pub enabled: Option<bool>,
    pub seed: Option<u64>,
    pub jitter_rate: Option<f64>,
    pub latency_range: Option<LatencyRange>,
    pub drop_rate: Option<f64>,
    pub network_partition: Option<bool>,
    pub profile_name: Option<ChaosProfile>,
    pub spike_chance: Option<f64>,
    pub spike_multiplier: Option<f64>,
    pub outage_interval: Option<f64>,
    pub outage_duration: Option<f64>,
}

impl AdversarialPatch {
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    fn apply_to(&self, config: &mut AdversarialConfig) {
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field { config.$field = v; })*
            };
        }
        set!(
            enabled,
            jitter_rate,
            latency_range,
            drop_rate,
            network_partition,
            profile_name,
            spike_chance,
            spike_multiplier,
            outage_interval,
            outage_duration
        );
        if self.seed.is_some() {
            config.seed = self.seed;
        }
    }
}

/// Why an action was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    Random,
    Partition,
}

/// Outcome of one interception.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Proceed(Delay),
    Drop(DropCause),
}

impl Verdict {
    pub fn proceeds(&self) -> bool {
        matches!(self, Verdict::Proceed(_))
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdversaryStats {
    pub intercepted: u64,
    pub dropped: u64,
    pub delayed: u64,
}

/// data_center_outage schedule, in context-clock seconds.
#[derive(Debug, Default)]
struct OutageClock {
    next_outage: Option<f64>,
    outage_end: f64,
}

struct MiddlewareState {
    config: AdversarialConfig,
    rng: ChaCha8Rng,
    in_burst: bool,
    outage: OutageClock,
}

/// Stateful fault generator.
pub struct AdversarialMiddleware<Ctx: ForgeContext> {
    context: Arc<Ctx>,
    state: Mutex<MiddlewareState>,
    intercepted: AtomicU64,
    dropped: AtomicU64,
    delayed: AtomicU64,
}

impl<Ctx: ForgeContext> AdversarialMiddleware<Ctx> {
    pub fn new(context: Arc<Ctx>, config: AdversarialConfig) -> Self {
        let config = config.normalized();
        let rng = Self::rng_for(&context, &config);
        Self {
            context,
            state: Mutex::new(MiddlewareState {
                config,
                rng,
                in_burst: false,
                outage: OutageClock::default(),
            }),
            intercepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            delayed: AtomicU64::new(0),
        }
    }

    /// Middleware that always lets actions through.
    pub fn disabled(context: Arc<Ctx>) -> Self {
        Self::new(context, AdversarialConfig::default())
    }

    fn rng_for(context: &Ctx, config: &AdversarialConfig) -> ChaCha8Rng {
        match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => context.derive_rng(ADVERSARY_RNG_STREAM),
        }
    }

    /// Gates one action. Sleeps for the computed delay before returning
    /// `true`; returns `false` without delay if the action is rejected.
    pub async fn intercept_action(&self, agent_id: &str, action: &str) -> bool {
        match self.decide(agent_id, action) {
            Verdict::Drop(_) => false,
            Verdict::Proceed(Delay::None) => true,
            Verdict::Proceed(delay) => {
                if delay == Delay::Hang {
                    warn!(agent = agent_id, "[CHAOS] infinite latency; hanging call");
                }
                self.context.sleep(delay.duration()).await;
                true
            }
        }
    }

    /// Computes the verdict for one action and advances profile state,
    /// without sleeping.
    pub fn decide(&self, agent_id: &str, action: &str) -> Verdict {
        self.intercepted.fetch_add(1, Ordering::Relaxed);
        let now = self.context.now().as_secs_f64();
        let verdict = self.state.lock().decide(now);

        match verdict {
            Verdict::Drop(cause) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(agent = agent_id, action, ?cause, "[CHAOS] Dropping action");
            }
            Verdict::Proceed(Delay::None) => {}
            Verdict::Proceed(delay) => {
                self.delayed.fetch_add(1, Ordering::Relaxed);
                debug!(agent = agent_id, delay = ?delay.duration(), "[CHAOS] delaying action");
            }
        }
        verdict
    }

    /// Applies a partial update and re-normalises the whole config.
    ///
    /// A new seed reseeds the RNG; a profile change resets burst and outage
    /// state.
    pub fn update_config(&self, patch: &AdversarialPatch) {
        let mut state = self.state.lock();
        let previous_profile = state.config.profile_name;
        let mut config = state.config.clone();
        patch.apply_to(&mut config);
        state.config = config.normalized();

        if patch.seed.is_some() {
            state.rng = Self::rng_for(&self.context, &state.config);
        }
        if state.config.profile_name != previous_profile {
            state.in_burst = false;
            state.outage = OutageClock::default();
        }
        info!(config = ?state.config, "Adversarial Config Updated");
    }

    /// Current configuration.
    pub fn config(&self) -> AdversarialConfig {
        self.state.lock().config.clone()
    }

    /// True while a flaky_wifi burst is active.
    pub fn in_burst(&self) -> bool {
        self.state.lock().in_burst
    }

    pub fn stats(&self) -> AdversaryStats {
        AdversaryStats {
            intercepted: self.intercepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
        }
    }
}

impl MiddlewareState {
    fn decide(&mut self, now: f64) -> Verdict {
        if !self.config.enabled {
            return Verdict::Proceed(Delay::None);
        }
        if fires(&mut self.rng, self.config.drop_rate) {
            return Verdict::Drop(DropCause::Random);
        }
        if self.config.network_partition {
            return Verdict::Drop(DropCause::Partition);
        }

        let delay = match self.config.profile_name {
            ChaosProfile::Custom => self.jitter(),
            ChaosProfile::FlakyWifi => self.flaky_wifi(),
            ChaosProfile::DataCenterOutage => self.outage(now),
        };
        Verdict::Proceed(delay)
    }

    fn jitter(&mut self) -> Delay {
        if fires(&mut self.rng, self.config.jitter_rate) {
            self.config.latency_range.sample(&mut self.rng)
        } else {
            Delay::None
        }
    }

    fn flaky_wifi(&mut self) -> Delay {
        let check: f64 = self.rng.gen();
        if self.in_burst {
            if check < BURST_EXIT_CHANCE {
                self.in_burst = false;
            }
        } else if check < self.config.spike_chance {
            self.in_burst = true;
            debug!("[CHAOS] latency burst started");
        }

        let base = self.config.latency_range.sample(&mut self.rng);
        if self.in_burst {
            base.scaled(self.config.spike_multiplier)
        } else {
            base
        }
    }

    fn outage(&mut self, now: f64) -> Delay {
        let next = *self
            .outage
            .next_outage
            .get_or_insert(now + self.config.outage_interval);

        if now >= next && now >= self.outage.outage_end {
            let end = now + self.config.outage_duration;
            self.outage.outage_end = end;
            self.outage.next_outage = Some(end + self.config.outage_interval);
            warn!(ends_at = end, "[CHAOS] DATA CENTER OUTAGE STARTED");
        }

        if now < self.outage.outage_end {
            Delay::from_secs(self.outage.outage_end - now)
        } else {
            self.jitter()
        }
    }
}
