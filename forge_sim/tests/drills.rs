//! Whole-drill properties: determinism, virtual-clock outages, concurrency.

use forge_core::message::Message;
use forge_sim::{CorridorConfig, DrillConfig, DrillReport, DrillRunner, ScenarioId, STEP_TOPIC};
use serde_json::Value;
use std::time::{Duration, Instant};

fn long_corridor() -> CorridorConfig {
    CorridorConfig {
        length: 1_000,
        slip_chance: 0.3,
        ..CorridorConfig::default()
    }
}

async fn run(config: DrillConfig) -> DrillReport {
    DrillRunner::new(config).run().await.unwrap()
}

/// `(seq_id, observation, info)` of every step; timestamps are excluded.
fn trace(report: &DrillReport) -> Vec<(u64, Value, Value)> {
    report
        .events
        .iter()
        .map(|e| (e["seq_id"].as_u64().unwrap(), e["observation"].clone(), e["info"].clone()))
        .collect()
}

#[tokio::test]
async fn test_same_seed_same_trace() {
    let config = || {
        DrillConfig::new(1234, ScenarioId::PacketLoss)
            .with_agents(1)
            .with_steps(60)
            .with_corridor(long_corridor())
    };
    let first = run(config()).await;
    let second = run(config()).await;

    assert!(first.passed, "{:?}", first.failure_reason);
    assert!(!first.events.is_empty());
    assert_eq!(trace(&first), trace(&second));
    assert_eq!(first.dropped_actions, second.dropped_actions);
    assert_eq!(first.dropped_actions + first.steps, 60);
}

#[tokio::test]
async fn test_different_seed_different_trace() {
    let config = |seed| {
        DrillConfig::new(seed, ScenarioId::PacketLoss)
            .with_agents(1)
            .with_steps(60)
            .with_corridor(long_corridor())
    };
    let a = run(config(1)).await;
    let b = run(config(2)).await;
    assert_ne!(trace(&a), trace(&b));
}

#[tokio::test]
async fn test_outages_run_on_virtual_time() {
    let wall = Instant::now();
    let report = run(DrillConfig::new(7, ScenarioId::DataCenterOutage)
        .with_agents(1)
        .with_steps(100)
        .with_corridor(long_corridor()))
    .await;

    assert!(report.passed, "{:?}", report.failure_reason);
    assert_eq!(report.steps, 100);
    assert_eq!(report.delayed_actions, 100);
    // 100 jittered actions alone take at least 5s, plus at least one 1s window
    assert!(report.virtual_time_secs >= 6.0, "t={}", report.virtual_time_secs);
    assert!(wall.elapsed() < Duration::from_secs(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_agents_leave_no_sequence_gaps() {
    let report = run(DrillConfig::new(99, ScenarioId::SteadyJitter)
        .with_agents(8)
        .with_steps(30)
        .with_corridor(long_corridor()))
    .await;

    assert!(report.passed, "{:?}", report.failure_reason);
    assert_eq!(report.steps, 240);
    assert_eq!(report.events_received, 240);
    assert_eq!(report.sequence_gaps, 0);
    assert_eq!(report.out_of_order, 0);
    assert_eq!(report.dead_letters, 0);

    let ids: Vec<u64> = report.events.iter().map(|e| e["seq_id"].as_u64().unwrap()).collect();
    assert_eq!(ids, (1..=240).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_flaky_wifi_bursts_delay_actions() {
    let report = run(DrillConfig::new(5, ScenarioId::FlakyWifi)
        .with_agents(2)
        .with_steps(50)
        .with_corridor(long_corridor()))
    .await;

    assert!(report.passed, "{:?}", report.failure_reason);
    assert_eq!(report.dropped_actions, 0);
    assert_eq!(report.delayed_actions, report.steps);
    // Base latency is at least 10ms per action
    assert!(report.virtual_time_secs >= 0.009 * report.steps as f64);
}

#[tokio::test]
async fn test_audit_log_mirrors_published_steps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("drill.jsonl");
    let report = run(DrillConfig::new(11, ScenarioId::SteadyJitter)
        .with_agents(2)
        .with_steps(10)
        .with_audit_log(&path))
    .await;

    let text = std::fs::read_to_string(&path).unwrap();
    let messages: Vec<Message> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(messages.len() as u64, report.bus.published);
    assert_eq!(messages.len() as u64, report.steps);
    assert!(messages.iter().all(|m| m.topic() == STEP_TOPIC && m.sender() == "engine"));
    assert!(messages.iter().all(|m| m.payload()["type"] == "step"));
}
