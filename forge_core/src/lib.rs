//! Agent Forge Core - coordination of LLM agents under injected faults
//!
//! This library provides three cooperating pieces:
//! 1. **Message Bus**: authenticated, queued pub/sub with a dead-letter queue and JSONL audit log
//! 2. **Adversarial Middleware**: action-level drops, jitter, flaky-wifi bursts and scheduled outages
//! 3. **Simulation Engine**: reset/step orchestration with auditing, logging and sequenced step events
//!
//! All time and randomness flow through a [`forge_env::ForgeContext`], so a
//! run under a virtual clock with a fixed seed is reproducible.

pub mod adversarial;
pub mod bus;
pub mod collaborators;
pub mod engine;
pub mod error;
pub mod latency;
pub mod message;
pub mod stress;

// Re-export key types for convenience
pub use adversarial::{AdversarialConfig, AdversarialMiddleware, AdversarialPatch, ChaosProfile, Verdict};
pub use bus::{async_handler, sync_handler, BusConfig, BusStats, MessageBus, MessageHandler};
pub use collaborators::{Auditor, Environment, Info, InteractionLogger, InteractionRecord, StepOutcome, Violation};
pub use engine::{async_observer, sync_observer, Feedback, SimulationEngine, StepEvent, StepObserver};
pub use error::{BusError, ConfigError, EngineError, EnvironmentError, HandlerError};
pub use latency::{Delay, LatencyRange};
pub use message::{Message, MessageDraft, MessageType};
pub use stress::StressConfig;
