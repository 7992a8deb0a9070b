//! Warpline PHOLD benchmark.
//!
//! # Usage
//!
//! ```bash
//! # Four nodes, 64 LPs, run to virtual time 1000
//! warpline-node --nodes 4 --lps 64 --end-time 1000
//!
//! # Mostly local traffic, verbose GVT logging
//! RUST_LOG=warpline_core=debug warpline-node --remote-percent 10
//! ```

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use warpline_core::{NodeConfig, Placement};
use warpline_node::{DEFAULT_IDLE_WAIT, Phold, PholdConfig, run_in_process};
use warpline_proto::VirtualTime;

/// Warpline PHOLD benchmark
#[derive(Parser, Debug)]
#[command(name = "warpline-node")]
#[command(about = "Run a PHOLD simulation on in-process Time Warp nodes")]
#[command(version)]
struct Args {
    /// Simulation nodes
    #[arg(short, long, default_value = "4", value_parser = clap::value_parser!(u32).range(1..))]
    nodes: u32,

    /// Logical processes across all nodes
    #[arg(short, long, default_value = "64", value_parser = clap::value_parser!(u32).range(1..))]
    lps: u32,

    /// Initial events per LP
    #[arg(long, default_value = "4")]
    population: u32,

    /// Virtual time to simulate up to
    #[arg(short, long, default_value = "1000")]
    end_time: u64,

    /// Percent of events sent to a random LP
    #[arg(long, default_value = "50")]
    remote_percent: u8,

    /// Minimum virtual delay between an event and its successor
    #[arg(long, default_value = "1")]
    lookahead: u64,

    /// Upper bound on the random part of the delay
    #[arg(long, default_value = "10")]
    jitter: u64,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Processed events between periodic checkpoints
    #[arg(long, default_value = "8")]
    checkpoint_interval: u32,

    /// Milliseconds between GVT rounds
    #[arg(long, default_value = "50")]
    gvt_period_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(nodes = args.nodes, lps = args.lps, end = args.end_time, "warpline starting");

    let config = NodeConfig {
        end_time: VirtualTime::new(args.end_time),
        checkpoint_interval: args.checkpoint_interval,
        gvt_period: Duration::from_millis(args.gvt_period_ms),
        ..NodeConfig::default()
    };
    let model = Phold::new(PholdConfig {
        lps: args.lps,
        population: args.population,
        remote_percent: args.remote_percent,
        lookahead: args.lookahead,
        jitter: args.jitter,
        seed: args.seed,
    });
    let placement = Placement::block(args.nodes, args.lps);

    let run = run_in_process(placement, config, model, &model.initial_events(), DEFAULT_IDLE_WAIT).await?;

    for report in &run.reports {
        tracing::info!(
            node = report.node,
            committed = report.committed,
            processed = report.processed,
            rollbacks = report.rollbacks,
            antimessages = report.antimessages,
            violations = report.violations,
            leaked = report.shutdown.leaked,
            "node summary"
        );
    }
    let digest = run.states.values().fold(0u64, |acc, s| acc.rotate_left(5) ^ s.digest);
    tracing::info!(committed = run.committed(), digest = format!("{digest:016x}"), "run complete");

    Ok(())
}
