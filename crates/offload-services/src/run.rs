//! Edge-device run supervisor.
//!
//! Owns every ED-side component for the lifetime of one experiment and tears
//! them down in order:
//!
//!   1. generator stops (limit reached or shutdown)
//!   2. in-flight tasks drain, and are aborted after `drain_timeout`
//!   3. client clones drop, closing the local submission queue
//!   4. the executor drains its queue and exits
//!   5. the listener exits once the completion channel closes
//!   6. completion records are reconciled into the final report

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use offload_core::config::{DeviceConfig, LocalRuntimeKind};

use crate::client::{ClientConfig, OffloadClient};
use crate::completion::{CompletionListener, CompletionRecords};
use crate::engine::{InferenceEngine, SimulatedEngine};
use crate::executor::{ExternalWorker, LocalExecutor, LocalRuntime};
use crate::generator::{ArrivalProcess, PayloadSource, TaskGenerator};
use crate::stats::{RunReport, StatsAggregator};

pub struct RunSupervisor {
    config: DeviceConfig,
    local_engine: Option<Arc<dyn InferenceEngine>>,
    seed: Option<u64>,
}

impl RunSupervisor {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            local_engine: None,
            seed: None,
        }
    }

    /// Replace the simulated in-process engine.
    pub fn with_local_engine(mut self, engine: Arc<dyn InferenceEngine>) -> Self {
        self.local_engine = Some(engine);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn local_runtime(
        &self,
        completions: &crate::completion::CompletionSender,
    ) -> anyhow::Result<LocalRuntime> {
        let local = &self.config.local;
        Ok(match local.runtime {
            LocalRuntimeKind::InProcess => LocalRuntime::InProcess {
                engine: self.local_engine.clone().unwrap_or_else(|| {
                    Arc::new(SimulatedEngine::new(Duration::from_millis(
                        local.simulated_latency_ms,
                    )))
                }),
                model: self.config.model.clone(),
            },
            LocalRuntimeKind::External => LocalRuntime::External(
                ExternalWorker::launch(&local.command, &local.args, completions.clone())
                    .context("local inference worker")?,
            ),
        })
    }

    pub async fn run(self, shutdown: broadcast::Sender<()>) -> anyhow::Result<RunReport> {
        let config = &self.config;
        let stats = StatsAggregator::new();
        let records = CompletionRecords::new();

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let listener = CompletionListener::new(completion_rx, records.clone()).spawn();
        let runtime = self.local_runtime(&completion_tx)?;
        let (local, executor) = LocalExecutor::spawn(runtime, completion_tx);

        let client = OffloadClient::new(
            ClientConfig::from(config),
            stats.clone(),
            records.clone(),
            local,
        );

        let mut generator = TaskGenerator::new(
            ArrivalProcess::from_settings(&config.arrival)?,
            PayloadSource::from_settings(&config.payload),
            config.limit,
        );
        if let Some(seed) = self.seed {
            generator = generator.with_seed(seed);
        }

        tracing::info!(
            endpoint = %config.endpoint,
            model = %config.model,
            pool_size = config.pool_size,
            arrival = ?config.arrival,
            limit = ?config.limit,
            "run starting"
        );

        let (task_tx, mut task_rx) = mpsc::unbounded_channel();
        let generator = tokio::spawn(generator.run(task_tx, shutdown.subscribe()));

        // Arrivals are spawned immediately; the permit is taken inside the
        // task so a full pool never delays generation.
        let pool = Arc::new(Semaphore::new(config.pool_size));
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                next = task_rx.recv() => {
                    let Some(task) = next else { break };
                    let client = client.clone();
                    let pool = pool.clone();
                    in_flight.spawn(async move {
                        let _permit = pool.acquire_owned().await.ok()?;
                        Some(client.run_task(task).await)
                    });
                }

                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }
        let generated = generator.await.context("generator task")?;

        drain_in_flight(&mut in_flight, config.drain_timeout(), &stats).await;
        drop(client);

        join_bounded("local executor", executor, config.drain_timeout()).await;
        join_bounded("completion listener", listener, config.drain_timeout()).await;

        let local = records.reconcile();
        if local.orphaned > 0 {
            tracing::warn!(orphaned = local.orphaned, "completions without a recorded start");
        }
        let report = RunReport::build(generated, &stats.snapshot(), &local);
        tracing::info!(
            generated = report.generated,
            sent_to_remote = report.sent_to_remote,
            ran_locally = report.ran_locally,
            dropped = report.dropped,
            failed = report.failed,
            avg_e2e_latency_ms = report.avg_e2e_latency_ms,
            "run finished"
        );
        Ok(report)
    }
}

/// Wait for in-flight tasks; whatever is still running at the deadline is
/// cancelled and counted as failed.
async fn drain_in_flight(
    in_flight: &mut JoinSet<Option<crate::client::TaskOutcome>>,
    limit: Duration,
    stats: &StatsAggregator,
) {
    let drained = tokio::time::timeout(limit, async {
        while let Some(res) = in_flight.join_next().await {
            if let Err(e) = res {
                tracing::warn!(error = %e, "task panicked");
                stats.record_failed();
            }
        }
    })
    .await;
    if drained.is_ok() {
        return;
    }

    in_flight.abort_all();
    let mut cancelled = 0u64;
    while let Some(res) = in_flight.join_next().await {
        if matches!(&res, Err(e) if e.is_cancelled()) {
            cancelled += 1;
            stats.record_failed();
        }
    }
    tracing::warn!(cancelled, "drain timeout, in-flight tasks cancelled");
}

async fn join_bounded(name: &'static str, mut handle: JoinHandle<u64>, limit: Duration) {
    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(n)) => tracing::debug!(component = name, processed = n, "joined"),
        Ok(Err(e)) => tracing::warn!(component = name, error = %e, "component panicked"),
        Err(_) => {
            tracing::warn!(component = name, "did not finish in time, aborting");
            handle.abort();
        }
    }
}
