//! Error taxonomy for the coordination core.
//!
//! Authentication and validation failures are raised synchronously to the
//! caller. Handler failures never leave the dispatcher. Domain failures
//! (environment, auditor) propagate out of the engine untouched.

use forge_env::EnvError;
use thiserror::Error;

/// A message field failed validation at construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid field `{field}`: {reason}")]
pub struct ValidationError {
    /// Name of the offending field
    pub field: &'static str,
    /// Human-readable reason
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Publish was rejected by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The sender is registered but presented a different token
    #[error("invalid auth token for sender `{0}`")]
    TokenMismatch(String),

    /// The registry is closed to unregistered senders
    #[error("sender `{0}` is not registered")]
    Unregistered(String),
}

/// A subscriber handler failed while processing a message.
#[derive(Debug, Clone, Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Errors surfaced by `MessageBus::publish`.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The dispatcher side of the queue has gone away
    #[error(transparent)]
    Env(#[from] EnvError),
}

/// A configuration value could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown chaos profile `{0}`")]
    UnknownProfile(String),

    #[error("invalid latency bound `{0}`")]
    InvalidLatency(String),

    #[error("invalid config document: {0}")]
    Malformed(String),
}

/// Raised by an `Environment` implementation.
#[derive(Debug, Clone, Error)]
pub enum EnvironmentError {
    /// The environment does not take an explicit agent id; the engine
    /// retries the step without one.
    #[error("environment does not accept an agent id")]
    AgentIdUnsupported,

    #[error("environment failure: {0}")]
    Failed(String),
}

/// Raised by an `Auditor` implementation.
#[derive(Debug, Clone, Error)]
#[error("audit failure: {0}")]
pub struct AuditError(pub String);

/// Raised by an `InteractionLogger`; the engine logs and swallows it.
#[derive(Debug, Clone, Error)]
#[error("interaction logger failure: {0}")]
pub struct LoggerError(pub String);

/// Errors returned by `SimulationEngine` operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    /// Fabricated fault from the stress path; callers are expected to retry
    #[error("Simulated Network Failure")]
    SimulatedFailure,

    #[error("no environment attached to the engine")]
    NoEnvironment,
}

impl EngineError {
    /// True for the deliberately injected stress fault.
    pub fn is_simulated(&self) -> bool {
        matches!(self, EngineError::SimulatedFailure)
    }
}
