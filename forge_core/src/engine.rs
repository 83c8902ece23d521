//! Simulation engine - one reset/step cycle per agent action.
//!
//! ```text
//! perform_action(agent, action)
//!   │
//!   ├─► AdversarialMiddleware::intercept_action ── dropped ──► Ok(true), nothing else
//!   │
//!   ├─► pause gate
//!   ├─► done? ──► Ok(false)
//!   ├─► Environment::step        (duration → info["duration"])
//!   ├─► Auditor::audit_state     (violations → info["violations"])
//!   ├─► cache observation / reward / done / info
//!   ├─► InteractionLogger        (with state fingerprint)
//!   └─► StepObserver             ({type:"step", seq_id, ...})
//! ```
//!
//! Environment and auditor errors propagate to the caller. Logger errors
//! are logged and swallowed.
//!
//! Steps are serialized from the environment step through the observer
//! call, so observers see `seq_id`s strictly in order. An observer must not
//! call back into `perform_action`.

use crate::adversarial::{AdversarialConfig, AdversarialMiddleware};
use crate::collaborators::{
    state_fingerprint, Auditor, Environment, Info, InteractionLogger, InteractionRecord, StepOutcome,
};
use crate::error::{EngineError, EnvironmentError};
use crate::latency::fires;
use crate::stress::StressConfig;

use async_trait::async_trait;
use forge_env::{ChaCha8Rng, ForgeContext};
use parking_lot::{Mutex, RwLock};
use rand::SeedableRng;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

/// RNG stream for the stress path.
const STRESS_RNG_STREAM: u64 = 0x57E55;

/// Mixed into the stress seed to give the derived adversary its own stream.
const ADVERSARY_SEED_MIX: u64 = 0x9e3779b97f4a7c15;

/// Envelope delivered to step observers.
///
/// Serializes as `{"type":"step","seq_id":..,"agent_id":..,"observation":..,"info":..,"timestamp":..}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename = "step")]
pub struct StepEvent {
    pub seq_id: u64,
    pub agent_id: String,
    pub observation: Value,
    pub info: Info,
    pub timestamp: f64,
}

impl StepEvent {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Last cached reward/done/info.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feedback {
    pub reward: f64,
    pub done: bool,
    pub info: Info,
}

/// Receives one event per non-dropped action.
#[async_trait]
pub trait StepObserver: Send + Sync + 'static {
    async fn on_step(&self, event: &StepEvent);
}

pub struct SyncObserver<F>(F);

#[async_trait]
impl<F> StepObserver for SyncObserver<F>
where
    F: Fn(&StepEvent) + Send + Sync + 'static,
{
    async fn on_step(&self, event: &StepEvent) {
        (self.0)(event)
    }
}

pub struct AsyncObserver<F>(F);

#[async_trait]
impl<F, Fut> StepObserver for AsyncObserver<F>
where
    F: Fn(StepEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_step(&self, event: &StepEvent) {
        (self.0)(event.clone()).await
    }
}

pub fn sync_observer<F>(f: F) -> Arc<dyn StepObserver>
where
    F: Fn(&StepEvent) + Send + Sync + 'static,
{
    Arc::new(SyncObserver(f))
}

pub fn async_observer<F, Fut>(f: F) -> Arc<dyn StepObserver>
where
    F: Fn(StepEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(AsyncObserver(f))
}

/// Environment plus cached results. One lock so a step is atomic with
/// respect to the done check and the cache update.
struct EngineCore {
    env: Option<Box<dyn Environment>>,
    observation: Value,
    reward: f64,
    done: bool,
    info: Info,
}

impl EngineCore {
    fn reset(&mut self) -> Result<Value, EngineError> {
        self.observation = match self.env.as_mut() {
            Some(env) => env.reset()?,
            None => Value::Null,
        };
        self.reward = 0.0;
        self.done = false;
        self.info = Info::new();
        Ok(self.observation.clone())
    }
}

/// Builder for [`SimulationEngine`].
pub struct EngineBuilder<Ctx: ForgeContext> {
    context: Arc<Ctx>,
    env: Option<Box<dyn Environment>>,
    auditor: Option<Arc<dyn Auditor>>,
    logger: Option<Arc<dyn InteractionLogger>>,
    stress: StressConfig,
    adversary: Option<AdversarialConfig>,
}

impl<Ctx: ForgeContext> EngineBuilder<Ctx> {
    pub fn environment(mut self, env: impl Environment + 'static) -> Self {
        self.env = Some(Box::new(env));
        self
    }

    pub fn auditor(mut self, auditor: Arc<dyn Auditor>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn InteractionLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn stress(mut self, stress: StressConfig) -> Self {
        self.stress = stress;
        self
    }

    /// Explicit adversary config; otherwise one is derived from the stress config.
    pub fn adversary(mut self, config: AdversarialConfig) -> Self {
        self.adversary = Some(config);
        self
    }

    /// Builds the engine and performs the initial reset.
    pub fn build(self) -> Result<SimulationEngine<Ctx>, EngineError> {
        let seed = self.stress.seed;
        let mut adversary_config = self.adversary.unwrap_or_else(|| self.stress.adversarial_config());
        if adversary_config.seed.is_none() {
            adversary_config.seed = seed.map(|s| s ^ ADVERSARY_SEED_MIX);
        }
        let stress_rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => self.context.derive_rng(STRESS_RNG_STREAM),
        };
        let (gate, _) = watch::channel(true);

        let engine = SimulationEngine {
            adversary: AdversarialMiddleware::new(Arc::clone(&self.context), adversary_config),
            context: self.context,
            core: Mutex::new(EngineCore {
                env: self.env,
                observation: Value::Null,
                reward: 0.0,
                done: false,
                info: Info::new(),
            }),
            step_order: AsyncMutex::new(()),
            sequence_id: AtomicU64::new(0),
            auditor: self.auditor,
            logger: self.logger,
            stress: self.stress,
            stress_rng: Mutex::new(stress_rng),
            gate,
            observer: RwLock::new(None),
        };

        if let (Some(seed), Some(logger)) = (seed, engine.logger.as_ref()) {
            let mut metadata = Info::new();
            metadata.insert("seed".into(), json!(seed));
            let record = InteractionRecord {
                agent_id: "engine",
                action: "seeded",
                state: &json!(seed),
                reward: 0.0,
                metadata: &metadata,
                state_hash: Some(""),
            };
            if let Err(e) = logger.log_interaction(&record) {
                warn!(error = %e, "failed to log engine seed");
            }
        }

        engine.reset()?;
        Ok(engine)
    }
}

/// Orchestrates agents against an environment under injected faults.
pub struct SimulationEngine<Ctx: ForgeContext> {
    context: Arc<Ctx>,
    core: Mutex<EngineCore>,
    /// Held from the environment step until the observer returns
    step_order: AsyncMutex<()>,
    /// Never reset, not even by `reset()`
    sequence_id: AtomicU64,
    auditor: Option<Arc<dyn Auditor>>,
    logger: Option<Arc<dyn InteractionLogger>>,
    stress: StressConfig,
    stress_rng: Mutex<ChaCha8Rng>,
    adversary: AdversarialMiddleware<Ctx>,
    /// `true` = open
    gate: watch::Sender<bool>,
    observer: RwLock<Option<Arc<dyn StepObserver>>>,
}

impl<Ctx: ForgeContext> SimulationEngine<Ctx> {
    pub fn builder(context: Arc<Ctx>) -> EngineBuilder<Ctx> {
        EngineBuilder {
            context,
            env: None,
            auditor: None,
            logger: None,
            stress: StressConfig::default(),
            adversary: None,
        }
    }

    /// Swaps the environment and resets.
    pub fn set_env(&self, env: impl Environment + 'static) -> Result<Value, EngineError> {
        let mut core = self.core.lock();
        core.env = Some(Box::new(env));
        core.reset()
    }

    /// Resets the environment and clears reward/done/info.
    /// The sequence counter is left untouched.
    pub fn reset(&self) -> Result<Value, EngineError> {
        self.core.lock().reset()
    }

    pub fn pause(&self) {
        self.gate.send_replace(false);
        info!("simulation paused");
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
        info!("simulation resumed");
    }

    pub fn is_paused(&self) -> bool {
        !*self.gate.borrow()
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id.load(Ordering::Acquire)
    }

    /// The action-level fault injector, for runtime `update_config`.
    pub fn adversary(&self) -> &AdversarialMiddleware<Ctx> {
        &self.adversary
    }

    pub fn set_step_observer(&self, observer: Arc<dyn StepObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub fn clear_step_observer(&self) {
        *self.observer.write() = None;
    }

    async fn wait_gate(&self) {
        let mut rx = self.gate.subscribe();
        // The sender lives as long as `self`, so this only returns once open
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Stress path: optional latency, then an optional fabricated failure.
    async fn apply_stress(&self) -> Result<(), EngineError> {
        if let Some(range) = self.stress.latency_range {
            let delay = range.sample(&mut *self.stress_rng.lock());
            if !delay.is_none() {
                self.context.sleep(delay.duration()).await;
            }
        }
        if let Some(rate) = self.stress.effective_failure_rate() {
            if fires(&mut *self.stress_rng.lock(), rate) {
                debug!("[STRESS] injecting simulated failure");
                return Err(EngineError::SimulatedFailure);
            }
        }
        Ok(())
    }

    /// The agent's current view of the state.
    ///
    /// May fail with [`EngineError::SimulatedFailure`] under stress.
    pub async fn get_state(&self, agent_id: &str) -> Result<Value, EngineError> {
        self.wait_gate().await;
        self.apply_stress().await?;
        let core = self.core.lock();
        let view = core.env.as_ref().and_then(|env| env.agent_state(agent_id));
        Ok(view.unwrap_or_else(|| core.observation.clone()))
    }

    /// Last cached reward/done/info.
    pub async fn get_feedback(&self, _agent_id: &str) -> Result<Feedback, EngineError> {
        self.wait_gate().await;
        self.apply_stress().await?;
        let core = self.core.lock();
        Ok(Feedback {
            reward: core.reward,
            done: core.done,
            info: core.info.clone(),
        })
    }

    /// Executes an action. Returns whether the episode is still alive.
    ///
    /// A dropped action reports alive and has no other effect.
    pub async fn perform_action(&self, agent_id: &str, action: Value) -> Result<bool, EngineError> {
        let action_text = action.to_string();
        if !self.adversary.intercept_action(agent_id, &action_text).await {
            return Ok(true);
        }

        self.wait_gate().await;
        let _order = self.step_order.lock().await;

        let outcome = {
            let mut core = self.core.lock();
            if core.done {
                return Ok(false);
            }
            let env = core.env.as_mut().ok_or(EngineError::NoEnvironment)?;

            let started = self.context.now();
            let mut outcome = step_tolerant(env.as_mut(), &action, agent_id)?;
            let elapsed = self.context.now().saturating_sub(started);
            outcome.info.insert("duration".into(), json!(elapsed.as_secs_f64()));

            if let Some(auditor) = &self.auditor {
                let violations = auditor.audit_state(agent_id, &outcome.observation)?;
                if !violations.is_empty() {
                    let records = violations.iter().map(|v| v.to_record()).collect();
                    outcome.info.insert("violations".into(), Value::Array(records));
                }
            }

            core.observation = outcome.observation.clone();
            core.reward = outcome.reward;
            core.done = outcome.done;
            core.info = outcome.info.clone();
            outcome
        };

        if let Some(logger) = &self.logger {
            let hash = state_fingerprint(&outcome.observation);
            let record = InteractionRecord {
                agent_id,
                action: &action_text,
                state: &outcome.observation,
                reward: outcome.reward,
                metadata: &outcome.info,
                state_hash: Some(&hash),
            };
            if let Err(e) = logger.log_interaction(&record) {
                warn!(agent = agent_id, error = %e, "interaction logger failed");
            }
        }

        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            let seq_id = self.sequence_id.fetch_add(1, Ordering::AcqRel) + 1;
            let event = StepEvent {
                seq_id,
                agent_id: agent_id.to_string(),
                observation: outcome.observation,
                info: outcome.info,
                timestamp: self.context.unix_secs(),
            };
            observer.on_step(&event).await;
        }

        Ok(!outcome.done)
    }
}

/// Steps with the agent id, retrying without it if the environment refuses.
fn step_tolerant(env: &mut dyn Environment, action: &Value, agent_id: &str) -> Result<StepOutcome, EnvironmentError> {
    match env.step(action, Some(agent_id)) {
        Err(EnvironmentError::AgentIdUnsupported) => env.step(action, None),
        other => other,
    }
}
