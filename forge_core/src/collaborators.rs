//! Contracts for the engine's external collaborators.
//!
//! The engine never knows how an environment computes physics or rewards,
//! what rules an auditor checks, or where an interaction logger writes. It
//! only relies on the traits below.

use crate::error::{AuditError, EnvironmentError, LoggerError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Free-form step metadata.
pub type Info = Map<String, Value>;

/// Result of one environment step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub observation: Value,
    pub reward: f64,
    pub done: bool,
    pub info: Info,
}

impl StepOutcome {
    pub fn new(observation: Value, reward: f64, done: bool) -> Self {
        Self {
            observation,
            reward,
            done,
            info: Info::new(),
        }
    }

    pub fn with_info(mut self, key: impl Into<String>, value: Value) -> Self {
        self.info.insert(key.into(), value);
        self
    }
}

/// A simulation environment.
pub trait Environment: Send {
    fn reset(&mut self) -> Result<Value, EnvironmentError>;

    /// Advances the environment by one action.
    ///
    /// Implementations that cannot attribute actions to agents return
    /// [`EnvironmentError::AgentIdUnsupported`] when given `Some(id)`; the
    /// engine then retries with `None`.
    fn step(&mut self, action: &Value, agent_id: Option<&str>) -> Result<StepOutcome, EnvironmentError>;

    /// Per-agent view of the state, if the environment has one.
    fn agent_state(&self, _agent_id: &str) -> Option<Value> {
        None
    }
}

/// A compliance finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: String,
    pub message: String,
    pub context: Value,
}

impl Violation {
    pub fn new(rule_id: impl Into<String>, message: impl Into<String>, context: Value) -> Self {
        Self {
            rule_id: rule_id.into(),
            message: message.into(),
            context,
        }
    }

    /// Plain JSON record stored under `info["violations"]`.
    pub fn to_record(&self) -> Value {
        json!({
            "rule": self.rule_id,
            "msg": self.message,
            "context": self.context,
        })
    }
}

/// Inspects every post-step observation.
pub trait Auditor: Send + Sync {
    fn audit_state(&self, agent_id: &str, observation: &Value) -> Result<Vec<Violation>, AuditError>;
}

/// One logged interaction.
#[derive(Debug, Clone, Copy)]
pub struct InteractionRecord<'a> {
    pub agent_id: &'a str,
    pub action: &'a str,
    pub state: &'a Value,
    pub reward: f64,
    pub metadata: &'a Info,
    pub state_hash: Option<&'a str>,
}

/// Fire-and-forget sink for interactions; errors are logged, never raised.
pub trait InteractionLogger: Send + Sync {
    fn log_interaction(&self, record: &InteractionRecord<'_>) -> Result<(), LoggerError>;
}

/// Cheap, non-cryptographic fingerprint of an observation.
///
/// Stable across runs for the same value; intended for deduplication and
/// debugging only.
pub fn state_fingerprint(observation: &Value) -> String {
    let mut hasher = DefaultHasher::new();
    observation.to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
