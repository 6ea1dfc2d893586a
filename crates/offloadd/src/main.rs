//! offloadd: edge-compute offload broker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use offload_core::config::{AdmissionMode, OffloadConfig};
use offload_services::{Broker, InferenceEngine, SimulatedEngine};

#[derive(Parser)]
#[command(name = "offloadd")]
#[command(about = "Admission-controlled inference broker for edge devices")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:5000
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Estimated marginal wait of one queued task
    #[arg(long, value_name = "MS")]
    per_task_cost_ms: Option<f64>,

    /// Admission latency budget
    #[arg(long, value_name = "MS")]
    latency_budget_ms: Option<f64>,

    /// Admit everything and only log over-budget estimates
    #[arg(long)]
    observe: bool,
}

fn load_config(cli: &Cli) -> Result<OffloadConfig> {
    let mut config = match &cli.config {
        Some(path) => OffloadConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            if let Err(e) = OffloadConfig::write_default_if_missing() {
                tracing::warn!(error = %e, "failed to write default config");
            }
            OffloadConfig::load().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                OffloadConfig::default()
            })
        }
    };

    let broker = &mut config.broker;
    if let Some(addr) = &cli.listen {
        broker.listen_addr = addr.clone();
    }
    if let Some(cost) = cli.per_task_cost_ms {
        broker.admission.per_task_cost_ms = cost;
    }
    if let Some(budget) = cli.latency_budget_ms {
        broker.admission.latency_budget_ms = budget;
    }
    if cli.observe {
        broker.admission.mode = AdmissionMode::Observe;
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
    let config = load_config(&cli)?.broker;

    let engine_settings = &config.engine;
    let engine: Arc<dyn InferenceEngine> = Arc::new(SimulatedEngine::new(Duration::from_millis(
        engine_settings.simulated_latency_ms,
    )));
    tracing::info!(
        model = %engine_settings.model,
        latency_ms = engine_settings.simulated_latency_ms,
        "inference engine ready"
    );

    let admission = &config.admission;
    tracing::info!(
        per_task_cost_ms = admission.per_task_cost_ms,
        latency_budget_ms = admission.latency_budget_ms,
        mode = ?admission.mode,
        "admission control"
    );

    let listen_addr = config.listen_addr.clone();
    let server = Broker::new(config, engine)
        .bind(&listen_addr)
        .await
        .context("broker listen socket")?;
    tracing::info!(addr = %server.local_addr()?, "offloadd listening");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let stats = server.run(shutdown_tx.subscribe()).await?;
    tracing::info!(
        admitted = stats.admitted,
        completed = stats.completed,
        dropped = stats.dropped,
        failed = stats.failed,
        "offloadd stopped"
    );
    Ok(())
}
