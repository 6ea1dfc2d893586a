//! Inference engine boundary.
//!
//! The engine itself is an external collaborator: it takes a payload and a
//! model id and returns detections. `SimulatedEngine` stands in for the
//! accelerator in tests and calibration runs.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Executes one model against one payload. Implementations may block.
pub trait InferenceEngine: Send + Sync {
    fn infer(&self, payload: &[u8], model: &str) -> Result<Vec<Detection>, EngineError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    pub region: BoundingRegion,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    Failed(String),
}

// ── Simulated engine ──────────────────────────────────────────────────────────

const LABELS: [&str; 8] = [
    "person",
    "bicycle",
    "car",
    "dog",
    "cat",
    "bus",
    "traffic light",
    "stop sign",
];

/// Sleeps for a fixed latency and derives one detection from the payload's
/// BLAKE3 digest, so equal payloads always give equal results.
#[derive(Debug, Clone)]
pub struct SimulatedEngine {
    latency: Duration,
}

impl SimulatedEngine {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl InferenceEngine for SimulatedEngine {
    fn infer(&self, payload: &[u8], _model: &str) -> Result<Vec<Detection>, EngineError> {
        if payload.is_empty() {
            return Err(EngineError::EmptyPayload);
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let digest = blake3::hash(payload);
        let b = digest.as_bytes();
        Ok(vec![Detection {
            label: LABELS[b[0] as usize % LABELS.len()].to_string(),
            score: 0.5 + f32::from(b[1]) / 510.0,
            region: BoundingRegion {
                x: f32::from(b[2]),
                y: f32::from(b[3]),
                width: 16.0 + f32::from(b[4]),
                height: 16.0 + f32::from(b[5]),
            },
        }])
    }
}

// ── Serialized access ─────────────────────────────────────────────────────────

/// Funnels every call into one engine through a single lock and runs it on
/// the blocking pool. Connection I/O never touches this lock.
#[derive(Clone)]
pub struct SerializedEngine {
    engine: Arc<dyn InferenceEngine>,
    gate: Arc<Mutex<()>>,
}

impl SerializedEngine {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub async fn infer(
        &self,
        payload: Vec<u8>,
        model: String,
    ) -> Result<Vec<Detection>, EngineError> {
        let held = self.gate.clone().lock_owned().await;
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || {
            let _held = held;
            engine.infer(&payload, &model)
        })
        .await
        .map_err(|e| EngineError::Failed(format!("inference task aborted: {e}")))?
    }
}
