//! Generated tasks and their lifecycle states.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle of one generated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    /// Broker replied GRANT.
    Admitted,
    /// Payload handed to the broker, waiting for DONE.
    Offloaded,
    /// Sitting in (or already drained from) the local fallback queue.
    LocallyQueued,
    Completed,
    /// Broker replied DROP.
    Dropped,
    Failed,
}

/// A unit of inference work. Created by the generator, mutated by whichever
/// path handles it, dropped once its outcome is folded into the stats.
#[derive(Debug, Clone)]
pub struct Task {
    /// Caller-assigned, unique per run.
    pub id: u64,
    /// Unix ms at generation.
    pub arrival_ms: u64,
    pub state: TaskState,
    /// Queue position granted by the broker.
    pub remote_token: Option<u64>,
    /// Input file handed to the engine.
    pub payload: PathBuf,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
}

impl Task {
    pub fn new(id: u64, payload: PathBuf) -> Self {
        Self {
            id,
            arrival_ms: now_ms(),
            state: TaskState::Pending,
            remote_token: None,
            payload,
            start_ms: None,
            end_ms: None,
        }
    }
}

/// Wall-clock Unix milliseconds. Shared clock for both halves of a local
/// completion record, so it must not be monotonic-only.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
