//! Run-level counters and the final reconciled report.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::completion::LocalSummary;

/// Dispatch counters. `completed` counts dispatch decisions (remote finished
/// or local enqueued), not local completions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateStats {
    pub completed: u64,
    pub sent_to_remote: u64,
    pub ran_locally: u64,
    /// Explicit DROP replies. A subset of `ran_locally`.
    pub dropped: u64,
    pub payload_errors: u64,
    pub failed: u64,
    /// Sum of remote end-to-end latencies.
    pub total_latency_ms: u64,
}

/// Shared handle over one `AggregateStats`, all updates under one lock.
#[derive(Clone, Default)]
pub struct StatsAggregator {
    inner: Arc<Mutex<AggregateStats>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_remote(&self, latency_ms: u64) {
        let mut s = self.lock();
        s.completed += 1;
        s.sent_to_remote += 1;
        s.total_latency_ms += latency_ms;
    }

    pub fn record_fallback(&self, dropped: bool) {
        let mut s = self.lock();
        s.completed += 1;
        s.ran_locally += 1;
        if dropped {
            s.dropped += 1;
        }
    }

    pub fn record_payload_error(&self) {
        self.lock().payload_errors += 1;
    }

    pub fn record_failed(&self) {
        self.lock().failed += 1;
    }

    pub fn snapshot(&self) -> AggregateStats {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, AggregateStats> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Report ────────────────────────────────────────────────────────────────────

/// Final run summary across both execution paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub generated: u64,
    pub completed: u64,
    pub sent_to_remote: u64,
    pub ran_locally: u64,
    pub dropped: u64,
    pub payload_errors: u64,
    pub failed: u64,
    pub local_completed: u64,
    pub local_pending: u64,
    pub local_failed: u64,
    pub avg_remote_latency_ms: f64,
    pub avg_local_latency_ms: f64,
    pub avg_local_infer_ms: f64,
    /// Mean over remote-completed and local-completed tasks together.
    pub avg_e2e_latency_ms: f64,
}

impl RunReport {
    pub fn build(generated: u64, stats: &AggregateStats, local: &LocalSummary) -> Self {
        let e2e_count = stats.sent_to_remote + local.completed;
        Self {
            generated,
            completed: stats.completed,
            sent_to_remote: stats.sent_to_remote,
            ran_locally: stats.ran_locally,
            dropped: stats.dropped,
            payload_errors: stats.payload_errors,
            failed: stats.failed,
            local_completed: local.completed,
            local_pending: local.pending,
            local_failed: local.failed,
            avg_remote_latency_ms: mean(stats.total_latency_ms as f64, stats.sent_to_remote),
            avg_local_latency_ms: mean(local.total_latency_ms as f64, local.completed),
            avg_local_infer_ms: mean(local.total_infer_ms, local.infer_samples),
            avg_e2e_latency_ms: mean(
                (stats.total_latency_ms + local.total_latency_ms) as f64,
                e2e_count,
            ),
        }
    }

    /// Tasks that reached some terminal classification.
    pub fn accounted(&self) -> u64 {
        self.sent_to_remote + self.ran_locally + self.payload_errors + self.failed
    }
}

fn mean(total: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "===== FINAL STATS =====")?;
        writeln!(f, "Tasks generated:              {}", self.generated)?;
        writeln!(f, "Total tasks completed:        {}", self.completed)?;
        writeln!(f, "Tasks sent to EC:             {}", self.sent_to_remote)?;
        writeln!(f, "Tasks run locally:            {}", self.ran_locally)?;
        writeln!(f, "  of which DROP:              {}", self.dropped)?;
        writeln!(f, "  local completed:            {}", self.local_completed)?;
        writeln!(f, "  local pending:              {}", self.local_pending)?;
        writeln!(f, "  local failed:               {}", self.local_failed)?;
        writeln!(f, "Payload errors:               {}", self.payload_errors)?;
        writeln!(f, "Failed:                       {}", self.failed)?;
        writeln!(f, "Avg remote latency:           {:.2} ms", self.avg_remote_latency_ms)?;
        writeln!(f, "Avg local latency:            {:.2} ms", self.avg_local_latency_ms)?;
        writeln!(f, "Avg pure local inference:     {:.2} ms", self.avg_local_infer_ms)?;
        writeln!(f, "Avg total E2E latency:        {:.2} ms", self.avg_e2e_latency_ms)?;
        write!(f, "=======================")
    }
}
