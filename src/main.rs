use std::path::PathBuf;

use anyhow::{ensure, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use floodnet::{LookupStrategy, NetDbConfig, Simulation};

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum Strategy {
    Iterative,
    FloodOnly,
    Classic,
}

impl From<Strategy> for LookupStrategy {
    fn from(s: Strategy) -> Self {
        match s {
            Strategy::Iterative => LookupStrategy::Iterative,
            Strategy::FloodOnly => LookupStrategy::FloodOnly,
            Strategy::Classic => LookupStrategy::Classic,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "floodnet")]
#[command(author, version, about = "Simulate a small floodfill network database", long_about = None)]
struct Args {
    /// Routers in the simulated network.
    #[arg(short, long, default_value = "40")]
    nodes: usize,

    /// How many of them act as floodfills.
    #[arg(short, long, default_value = "8")]
    floodfills: usize,

    /// Random router lookups to run after publishing.
    #[arg(short, long, default_value = "20")]
    lookups: usize,

    /// Per-lookup timeout in milliseconds.
    #[arg(long, default_value = "10000")]
    timeout_ms: u64,

    /// TOML file overriding database defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Lookup strategy, overriding the configuration.
    #[arg(short, long, value_enum)]
    strategy: Option<Strategy>,

    /// Keep running and log status every this many seconds (0 exits).
    #[arg(long, default_value = "0")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    ensure!(args.floodfills <= args.nodes, "more floodfills than nodes");

    let mut config = match &args.config {
        Some(path) => NetDbConfig::load(path)?,
        None => NetDbConfig::default(),
    };
    if let Some(strategy) = args.strategy {
        config.lookup.strategy = strategy.into();
    }

    let sim = Simulation::start(args.nodes, args.floodfills, &config).await?;
    sim.reseed();

    let published = sim.publish_all().await;
    info!(published, nodes = args.nodes, "router descriptors published");

    let found = sim
        .run_lookups(args.lookups, Duration::from_millis(args.timeout_ms))
        .await?;
    info!(found, lookups = args.lookups, strategy = ?config.lookup.strategy, "lookups finished");

    if let Some(first) = sim.routers.first() {
        info!("status of first router\n{}", first.netdb.render_status().await);
    }

    if args.status_interval > 0 {
        let mut interval = time::interval(Duration::from_secs(args.status_interval));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, exiting gracefully");
                    break;
                }
                _ = interval.tick() => {
                    for router in sim.routers.iter().take(args.floodfills.max(1)) {
                        let snapshot = router.netdb.snapshot().await;
                        info!(
                            router = %snapshot.local.short(),
                            floodfill = snapshot.floodfill,
                            routers = snapshot.routers,
                            floodfills = snapshot.floodfills,
                            in_flight = snapshot.in_flight_lookups,
                            "status snapshot"
                        );
                    }
                }
            }
        }
    }

    sim.shutdown().await;
    Ok(())
}
