//! distlab scenario replay CLI
//!
//! Replays a scenario file against one protocol model and prints the final
//! statistics.

use anyhow::Context;
use clap::Parser;
use distlab_simulator::{load_scenario, replay, Protocol, ReplayConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "distlab-replay")]
#[command(about = "Replay a distlab scenario against a protocol model")]
#[command(version)]
struct Cli {
    /// Scenario JSON file
    #[arg(long)]
    scenario: PathBuf,

    /// Protocol to replay against
    #[arg(long, value_enum)]
    protocol: Protocol,

    /// Number of participants. Counts cohorts, clients or workers where the
    /// protocol has a central node; pbft keeps the largest 3f+1 that fits.
    #[arg(long)]
    nodes: Option<usize>,

    /// Timeline speed multiplier
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// Seed for delivery jitter and gossip peer choice
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Message transit delay in milliseconds
    #[arg(long, default_value = "500")]
    delay_ms: u64,

    /// Delivery jitter as a fraction of the delay (0.0 to 1.0)
    #[arg(long, default_value = "0.0")]
    jitter: f64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let scenario = load_scenario(&cli.scenario)?;

    let mut config = ReplayConfig::new(cli.protocol)
        .with_speed(cli.speed)
        .with_seed(cli.seed)
        .with_delay(Duration::from_millis(cli.delay_ms))
        .with_jitter(cli.jitter);
    if let Some(nodes) = cli.nodes {
        config = config.with_nodes(nodes);
    }

    let report = replay(scenario, &config)
        .with_context(|| format!("replaying {}", cli.scenario.display()))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(())
}
