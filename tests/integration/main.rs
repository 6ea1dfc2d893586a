//! Offload integration test harness.
//!
//! Every test runs a real broker and real clients over loopback TCP. Brokers
//! bind port 0, so tests can run in parallel without sharing state.
//!
//!   cargo test --test integration

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use offload_core::config::{AdmissionMode, AdmissionSettings, BrokerConfig};
use offload_services::{
    Broker, BrokerStats, ClientConfig, CompletionListener, CompletionRecords, Detection,
    EngineError, InferenceEngine, LocalExecutor, LocalRuntime, LocalSummary, OffloadClient,
    SimulatedEngine, StatsAggregator,
};

// ── Harness ───────────────────────────────────────────────────────────────────

/// A broker running on an ephemeral loopback port.
pub struct TestBroker {
    pub addr: String,
    pub broker: Broker,
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<Result<BrokerStats>>,
}

impl TestBroker {
    pub async fn stop(self) -> BrokerStats {
        let _ = self.shutdown.send(());
        self.handle.await.unwrap().unwrap()
    }
}

pub fn broker_config(per_task_cost_ms: f64, latency_budget_ms: f64) -> BrokerConfig {
    BrokerConfig {
        admission: AdmissionSettings {
            per_task_cost_ms,
            latency_budget_ms,
            mode: AdmissionMode::Enforce,
        },
        ack_timeout_ms: 500,
        payload_timeout_ms: 2_000,
        shutdown_grace_ms: 2_000,
        ..Default::default()
    }
}

pub async fn start_broker(config: BrokerConfig, engine_latency: Duration) -> TestBroker {
    let server = Broker::new(config, Arc::new(SimulatedEngine::new(engine_latency)))
        .bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let broker = server.broker().clone();
    let (shutdown, rx) = broadcast::channel(1);
    let handle = tokio::spawn(server.run(rx));
    TestBroker {
        addr,
        broker,
        shutdown,
        handle,
    }
}

/// An address nothing listens on.
pub fn dead_endpoint() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

pub fn client_config(endpoint: &str) -> ClientConfig {
    ClientConfig {
        endpoint: endpoint.to_string(),
        model: "resnet_50".into(),
        device_tag: "PI5".into(),
        connect_timeout: Duration::from_millis(500),
        response_timeout: Duration::from_millis(1_000),
        done_timeout: Duration::from_secs(10),
    }
}

static PAYLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

/// A small payload file unique to this test process.
pub fn payload_file() -> PathBuf {
    let n = PAYLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "offload-it-{}-{n}.jpg",
        std::process::id()
    ));
    std::fs::write(&path, b"\xff\xd8\xff\xe0 test frame").unwrap();
    path
}

/// The ED side without a generator: one client wired to a local executor
/// and a completion listener.
pub struct EdgeDevice {
    pub client: OffloadClient,
    pub stats: StatsAggregator,
    pub records: CompletionRecords,
    executor: JoinHandle<u64>,
    listener: JoinHandle<u64>,
}

impl EdgeDevice {
    pub fn new(endpoint: &str, engine: Arc<dyn InferenceEngine>) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let records = CompletionRecords::new();
        let listener = CompletionListener::new(completion_rx, records.clone()).spawn();
        let (local, executor) = LocalExecutor::spawn(
            LocalRuntime::InProcess {
                engine,
                model: "resnet_50".into(),
            },
            completion_tx,
        );
        let stats = StatsAggregator::new();
        let client = OffloadClient::new(
            client_config(endpoint),
            stats.clone(),
            records.clone(),
            local,
        );
        Self {
            client,
            stats,
            records,
            executor,
            listener,
        }
    }

    pub fn simulated(endpoint: &str) -> Self {
        Self::new(endpoint, Arc::new(SimulatedEngine::new(Duration::from_millis(2))))
    }

    /// Close the local queue, wait for it to drain and reconcile. Returns the
    /// number of jobs the executor dispatched.
    pub async fn finish(self) -> (u64, LocalSummary) {
        drop(self.client);
        let dispatched = self.executor.await.unwrap();
        self.listener.await.unwrap();
        (dispatched, self.records.reconcile())
    }
}

/// A local engine that is never reachable.
pub struct DownEngine;

impl InferenceEngine for DownEngine {
    fn infer(&self, _payload: &[u8], _model: &str) -> Result<Vec<Detection>, EngineError> {
        Err(EngineError::Unavailable("accelerator offline".into()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

mod fallback;
mod local_worker;
mod remote;
mod supervisor;
