//! Reference collaborators for drills.
//!
//! `CorridorWorld` is a one-dimensional track: every agent starts at cell 0
//! and tries to reach the goal cell. A seeded "slip" occasionally reverses a
//! move, so two runs only agree when their seeds do.

use forge_core::collaborators::{Auditor, Environment, Info, InteractionLogger, InteractionRecord, StepOutcome, Violation};
use forge_core::error::{AuditError, EnvironmentError, LoggerError};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Configuration for a corridor.
#[derive(Debug, Clone)]
pub struct CorridorConfig {
    /// Goal cell; agents start at 0
    pub length: i64,

    /// Probability that a move is reversed
    pub slip_chance: f64,

    /// Episode ends after this many steps (0 = only when every agent is home)
    pub max_ticks: u64,

    /// Slip RNG seed
    pub seed: u64,
}

impl Default for CorridorConfig {
    fn default() -> Self {
        Self {
            length: 10,
            slip_chance: 0.1,
            max_ticks: 0,
            seed: 42,
        }
    }
}

/// One-dimensional multi-agent corridor.
pub struct CorridorWorld {
    config: CorridorConfig,
    rng: ChaCha8Rng,
    positions: BTreeMap<String, i64>,
    tick: u64,
}

impl CorridorWorld {
    pub fn new(config: CorridorConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            positions: BTreeMap::new(),
            tick: 0,
        }
    }

    /// Corridor with default settings and the given seed.
    pub fn seeded(seed: u64) -> Self {
        Self::new(CorridorConfig {
            seed,
            ..CorridorConfig::default()
        })
    }

    pub fn positions(&self) -> &BTreeMap<String, i64> {
        &self.positions
    }

    fn observation(&self) -> Value {
        json!({
            "tick": self.tick,
            "goal": self.config.length,
            "positions": self.positions,
        })
    }

    /// `"left"`, `"right"`, `"stay"`, or `{"move": n}` with n in -1..=1.
    fn parse_move(action: &Value) -> Result<i64, EnvironmentError> {
        let invalid = || EnvironmentError::Failed(format!("unsupported action: {}", action));
        match action {
            Value::String(s) => match s.as_str() {
                "left" => Ok(-1),
                "right" => Ok(1),
                "stay" => Ok(0),
                _ => Err(invalid()),
            },
            Value::Object(map) => map
                .get("move")
                .and_then(Value::as_i64)
                .filter(|d| (-1..=1).contains(d))
                .ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }
}

impl Environment for CorridorWorld {
    fn reset(&mut self) -> Result<Value, EnvironmentError> {
        self.positions.clear();
        self.tick = 0;
        Ok(self.observation())
    }

    fn step(&mut self, action: &Value, agent_id: Option<&str>) -> Result<StepOutcome, EnvironmentError> {
        let agent = agent_id.ok_or_else(|| EnvironmentError::Failed("corridor needs an agent id".into()))?;
        let mut delta = Self::parse_move(action)?;
        let slipped = delta != 0 && self.rng.gen::<f64>() < self.config.slip_chance;
        if slipped {
            delta = -delta;
        }

        let goal = self.config.length;
        let position = self.positions.entry(agent.to_string()).or_insert(0);
        let before = *position;
        // The back wall is one cell behind the start
        *position = (*position + delta).clamp(-1, goal);
        let arrived = *position == goal && before != goal;
        let current = *position;

        self.tick += 1;
        let home = !self.positions.is_empty() && self.positions.values().all(|p| *p == goal);
        let timed_out = self.config.max_ticks > 0 && self.tick >= self.config.max_ticks;
        let reward = if arrived { 1.0 } else { -0.01 };

        Ok(StepOutcome::new(self.observation(), reward, home || timed_out)
            .with_info("position", json!(current))
            .with_info("slipped", json!(slipped)))
    }

    fn agent_state(&self, agent_id: &str) -> Option<Value> {
        let position = self.positions.get(agent_id).copied().unwrap_or(0);
        Some(json!({
            "position": position,
            "goal": self.config.length,
            "tick": self.tick,
        }))
    }
}

/// Flags agents that have backed into the wall behind the start line.
#[derive(Debug, Default, Clone, Copy)]
pub struct BoundaryAuditor;

pub const BOUNDARY_RULE: &str = "BOUNDARY-001";

impl Auditor for BoundaryAuditor {
    fn audit_state(&self, agent_id: &str, observation: &Value) -> Result<Vec<Violation>, AuditError> {
        let positions = observation
            .get("positions")
            .and_then(Value::as_object)
            .ok_or_else(|| AuditError("observation has no positions".into()))?;

        Ok(positions
            .iter()
            .filter(|(agent, _)| agent.as_str() == agent_id)
            .filter_map(|(agent, pos)| {
                let pos = pos.as_i64()?;
                (pos < 0).then(|| {
                    Violation::new(
                        BOUNDARY_RULE,
                        format!("{} left the track", agent),
                        json!({"agent": agent, "position": pos}),
                    )
                })
            })
            .collect())
    }
}

/// Owned copy of an [`InteractionRecord`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedInteraction {
    pub agent_id: String,
    pub action: String,
    pub state: Value,
    pub reward: f64,
    pub metadata: Info,
    pub state_hash: Option<String>,
}

/// Interaction logger that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryInteractionLog {
    entries: Mutex<Vec<LoggedInteraction>>,
}

impl MemoryInteractionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LoggedInteraction> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn for_agent(&self, agent_id: &str) -> Vec<LoggedInteraction> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect()
    }
}

impl InteractionLogger for MemoryInteractionLog {
    fn log_interaction(&self, record: &InteractionRecord<'_>) -> Result<(), LoggerError> {
        self.entries.lock().push(LoggedInteraction {
            agent_id: record.agent_id.to_string(),
            action: record.action.to_string(),
            state: record.state.clone(),
            reward: record.reward,
            metadata: record.metadata.clone(),
            state_hash: record.state_hash.map(str::to_string),
        });
        Ok(())
    }
}
