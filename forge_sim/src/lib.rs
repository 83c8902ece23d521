//! Agent Forge Deterministic Chaos Drills
//!
//! This crate provides a controlled harness where the whole coordination
//! stack (bus, middleware, engine) runs against a virtual clock.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: the virtual clock only advances when something sleeps
//! - **Faults**: every middleware and bus decision draws from a seeded RNG
//! - **Agents**: each agent's policy uses its own seed-derived stream
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       DrillRunner                        │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ SimContext (virtual clock + ChaCha8 streams)       │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │    agent-0 .. agent-N                                    │
//! │       │                                                  │
//! │  ┌────▼──────────────────────┐      ┌─────────────────┐  │
//! │  │ SimulationEngine          │─────►│ MessageBus      │  │
//! │  │  + AdversarialMiddleware  │ step │  "sim.step"     │  │
//! │  │  + CorridorWorld          │      └─────────────────┘  │
//! │  └───────────────────────────┘                           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use forge_sim::{DrillConfig, DrillRunner, ScenarioId};
//!
//! let config = DrillConfig::new(42, ScenarioId::FlakyWifi).with_agents(4);
//! let report = DrillRunner::new(config).run().await?;
//! assert!(report.passed);
//! ```

mod context;
mod runner;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use runner::{DrillConfig, DrillError, DrillReport, DrillRunner, ENGINE_SENDER, STEP_TOPIC};
pub use scenarios::ScenarioId;
pub use world::{BoundaryAuditor, CorridorConfig, CorridorWorld, LoggedInteraction, MemoryInteractionLog, BOUNDARY_RULE};
