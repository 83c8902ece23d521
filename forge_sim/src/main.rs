//! Agent Forge Drill CLI
//!
//! Run deterministic chaos drills against the coordination core.

use clap::Parser;
use forge_core::adversarial::AdversarialConfig;
use forge_sim::{DrillConfig, DrillReport, DrillRunner, ScenarioId};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Agent Forge chaos drill CLI
#[derive(Parser, Debug)]
#[command(name = "forge-drill")]
#[command(about = "Run deterministic chaos drills for Agent Forge", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of concurrent agents
    #[arg(short, long, default_value = "3")]
    agents: usize,

    /// Actions attempted per agent
    #[arg(long, default_value = "50")]
    steps: usize,

    /// Scenario to run (steady_jitter, flaky_wifi, data_center_outage, partition, packet_loss, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// JSON file with an AdversarialConfig overriding the scenario's
    #[arg(long)]
    adversary: Option<PathBuf>,

    /// JSONL audit log path (one file per scenario, suffixed with its name)
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn load_adversary(path: &Path) -> Result<AdversarialConfig, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    AdversarialConfig::from_json(&text).map_err(|e| e.to_string())
}

fn audit_path(base: &Path, scenario: ScenarioId, single: bool) -> PathBuf {
    if single {
        return base.to_path_buf();
    }
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("audit");
    base.with_file_name(format!("{}.{}.jsonl", stem, scenario.name()))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error: failed to set tracing subscriber: {}", e);
        std::process::exit(1);
    }

    if !args.json {
        info!("Agent Forge Drill v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            eprintln!("Available scenarios: steady_jitter, flaky_wifi, data_center_outage, partition, packet_loss, all");
            std::process::exit(1);
        })]
    };

    let adversary = args.adversary.as_ref().map(|path| {
        load_adversary(path).unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        })
    });

    // Determine seed
    let seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    let mut reports: Vec<DrillReport> = Vec::new();
    let mut failed_count = 0;

    for scenario in &scenarios {
        let mut config = DrillConfig::new(seed, *scenario)
            .with_agents(args.agents)
            .with_steps(args.steps);
        if let Some(adversary) = &adversary {
            config = config.with_adversary(adversary.clone());
        }
        if let Some(base) = &args.audit_log {
            config = config.with_audit_log(audit_path(base, *scenario, scenarios.len() == 1));
        }

        match DrillRunner::new(config).run().await {
            Ok(report) => {
                if !args.json {
                    if report.passed {
                        info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                    } else {
                        error!(
                            "✗ {} (seed={}) FAILED: {}",
                            scenario.name(),
                            seed,
                            report.failure_reason.as_deref().unwrap_or("unknown")
                        );
                    }
                }
                if !report.passed {
                    failed_count += 1;
                }
                reports.push(report);
            }
            Err(e) => {
                error!("✗ {} (seed={}) aborted: {}", scenario.name(), seed, e);
                failed_count += 1;
            }
        }
    }

    let total = scenarios.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": reports.iter().map(DrillReport::summary).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("failed to render summary: {}", e),
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 {
            info!("✅ All {} drills passed!", total);
        } else {
            error!("❌ {}/{} drills failed!", failed_count, total);
            for report in reports.iter().filter(|r| !r.passed) {
                error!("  - {}", report);
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
