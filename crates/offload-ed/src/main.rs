//! offload-ed: edge-device workload driver.
//!
//! Generates tasks, offers each one to the broker and runs whatever the
//! broker cannot take on the local engine. Prints the reconciled run
//! summary on exit.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use offload_core::config::{ArrivalSettings, OffloadConfig, RunLimit};
use offload_services::RunSupervisor;

#[derive(Parser)]
#[command(name = "offload-ed")]
#[command(about = "Edge-device task generator with remote offload and local fallback")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker address, host:port
    #[arg(short, long, value_name = "ADDR")]
    endpoint: Option<String>,

    /// Poisson arrivals with this mean rate
    #[arg(long, value_name = "PER_SEC", conflicts_with = "fixed_rate")]
    poisson: Option<f64>,

    /// Fixed-interval arrivals
    #[arg(long, value_name = "PER_SEC")]
    fixed_rate: Option<f64>,

    /// Stop after this many tasks
    #[arg(short = 'n', long, conflicts_with = "duration")]
    tasks: Option<u64>,

    /// Stop generating after this many seconds
    #[arg(short, long, value_name = "SECS")]
    duration: Option<u64>,

    /// Concurrent offload attempts
    #[arg(long)]
    pool_size: Option<usize>,

    /// Pick payloads at random from this directory
    #[arg(long, value_name = "DIR")]
    payload_dir: Option<PathBuf>,

    /// Seed for reproducible arrivals
    #[arg(long)]
    seed: Option<u64>,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

fn load_config(cli: &Cli) -> Result<OffloadConfig> {
    let mut config = match &cli.config {
        Some(path) => OffloadConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OffloadConfig::load().with_context(|| {
            format!("loading {}", OffloadConfig::file_path().display())
        })?,
    };

    let device = &mut config.device;
    if let Some(endpoint) = &cli.endpoint {
        device.endpoint = endpoint.clone();
    }
    if let Some(rate) = cli.poisson {
        device.arrival = ArrivalSettings::Poisson { rate_per_sec: rate };
    }
    if let Some(rate) = cli.fixed_rate {
        device.arrival = ArrivalSettings::FixedRate {
            tasks_per_sec: rate,
        };
    }
    if let Some(tasks) = cli.tasks {
        device.limit = RunLimit::Count { tasks };
    }
    if let Some(secs) = cli.duration {
        device.limit = RunLimit::Duration { secs };
    }
    if let Some(n) = cli.pool_size {
        device.pool_size = n;
    }
    if let Some(dir) = &cli.payload_dir {
        device.payload.directory = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let mut supervisor = RunSupervisor::new(config.device);
    if let Some(seed) = cli.seed {
        supervisor = supervisor.with_seed(seed);
    }
    let report = supervisor.run(shutdown_tx).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }
    Ok(())
}
