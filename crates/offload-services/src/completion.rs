//! Local completion records and the listener that fills them.
//!
//! Two independent writers feed each record: the client stamps
//! `local_start_ms` when it enqueues a fallback task, and the completion
//! listener stamps `local_end_ms`/`infer_ms` when the local engine reports
//! back. A record only counts toward latency once both halves are present.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use offload_core::wire::CompletionLine;

/// One message on the completion notification channel.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionNotice {
    Done(CompletionLine),
    Failed { task_id: u64, error: String },
}

pub type CompletionSender = mpsc::UnboundedSender<CompletionNotice>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<CompletionNotice>;

/// Both halves of a locally executed task's timing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRecord {
    pub local_start_ms: Option<u64>,
    pub local_end_ms: Option<u64>,
    pub infer_ms: Option<f64>,
    pub error: Option<String>,
}

impl CompletionRecord {
    /// `end - start`, only when both halves are present. Clamped at zero if
    /// the wall clock stepped backwards in between.
    pub fn latency_ms(&self) -> Option<u64> {
        match (self.local_start_ms, self.local_end_ms) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            _ => None,
        }
    }
}

/// Totals over every local record, computed at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocalSummary {
    /// Both halves present.
    pub completed: u64,
    /// Enqueued, never reported.
    pub pending: u64,
    /// Engine or payload failure reported.
    pub failed: u64,
    /// Completion reported for a task that never recorded a start.
    pub orphaned: u64,
    pub total_latency_ms: u64,
    pub total_infer_ms: f64,
    pub infer_samples: u64,
}

/// task_id → CompletionRecord
#[derive(Clone, Default)]
pub struct CompletionRecords {
    records: Arc<DashMap<u64, CompletionRecord>>,
}

impl CompletionRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self, task_id: u64, at_ms: u64) {
        self.records.entry(task_id).or_default().local_start_ms = Some(at_ms);
    }

    pub fn record_end(&self, line: &CompletionLine) {
        let mut record = self.records.entry(line.task_id).or_default();
        record.local_end_ms = Some(line.completed_at_ms);
        record.infer_ms = Some(line.infer_ms);
    }

    pub fn record_failure(&self, task_id: u64, error: String) {
        self.records.entry(task_id).or_default().error = Some(error);
    }

    /// Forget a task, e.g. when its enqueue never happened.
    pub fn remove(&self, task_id: u64) {
        self.records.remove(&task_id);
    }

    pub fn get(&self, task_id: u64) -> Option<CompletionRecord> {
        self.records.get(&task_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Join every record. Unmatched halves are counted, never averaged.
    pub fn reconcile(&self) -> LocalSummary {
        let mut summary = LocalSummary::default();
        for entry in self.records.iter() {
            let record = entry.value();
            if let Some(infer_ms) = record.infer_ms {
                summary.total_infer_ms += infer_ms;
                summary.infer_samples += 1;
            }
            if record.error.is_some() {
                summary.failed += 1;
            } else if let Some(latency) = record.latency_ms() {
                summary.completed += 1;
                summary.total_latency_ms += latency;
            } else if record.local_start_ms.is_some() {
                summary.pending += 1;
            } else {
                summary.orphaned += 1;
            }
        }
        summary
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// Drains the completion channel into `CompletionRecords` until every sender
/// is gone.
pub struct CompletionListener {
    rx: CompletionReceiver,
    records: CompletionRecords,
}

impl CompletionListener {
    pub fn new(rx: CompletionReceiver, records: CompletionRecords) -> Self {
        Self { rx, records }
    }

    pub fn spawn(self) -> JoinHandle<u64> {
        tokio::spawn(self.run())
    }

    /// Returns the number of notices processed.
    pub async fn run(mut self) -> u64 {
        let mut seen = 0;
        while let Some(notice) = self.rx.recv().await {
            seen += 1;
            match notice {
                CompletionNotice::Done(line) => {
                    if self
                        .records
                        .get(line.task_id)
                        .and_then(|r| r.local_start_ms)
                        .is_none()
                    {
                        tracing::debug!(task_id = line.task_id, "completion for unknown start");
                    }
                    self.records.record_end(&line);
                    tracing::info!(
                        task_id = line.task_id,
                        infer_ms = line.infer_ms,
                        "local task done"
                    );
                }
                CompletionNotice::Failed { task_id, error } => {
                    tracing::warn!(task_id, %error, "local task failed");
                    self.records.record_failure(task_id, error);
                }
            }
        }
        tracing::debug!(notices = seen, "completion channel closed");
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done(task_id: u64, infer_ms: f64, completed_at_ms: u64) -> CompletionLine {
        CompletionLine {
            task_id,
            infer_ms,
            completed_at_ms,
        }
    }

    #[test]
    fn latency_needs_both_halves() {
        let records = CompletionRecords::new();
        records.record_start(1, 1_000);
        assert_eq!(records.get(1).unwrap().latency_ms(), None);

        records.record_end(&done(1, 40.0, 1_250));
        assert_eq!(records.get(1).unwrap().latency_ms(), Some(250));
    }

    #[test]
    fn halves_join_in_either_order() {
        let records = CompletionRecords::new();
        records.record_end(&done(7, 12.5, 2_000));
        records.record_start(7, 1_900);
        let record = records.get(7).unwrap();
        assert_eq!(record.latency_ms(), Some(100));
        assert_eq!(record.infer_ms, Some(12.5));
    }

    #[test]
    fn clock_step_never_gives_negative_latency() {
        let record = CompletionRecord {
            local_start_ms: Some(5_000),
            local_end_ms: Some(4_000),
            ..Default::default()
        };
        assert_eq!(record.latency_ms(), Some(0));
    }

    #[test]
    fn reconcile_separates_unmatched_halves() {
        let records = CompletionRecords::new();
        records.record_start(1, 100);
        records.record_end(&done(1, 30.0, 400));
        records.record_start(2, 100);
        records.record_end(&done(3, 10.0, 500));
        records.record_start(4, 100);
        records.record_failure(4, "engine down".into());

        let summary = records.reconcile();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.orphaned, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total_latency_ms, 300);
        assert_eq!(summary.infer_samples, 2);
        assert!((summary.total_infer_ms - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn listener_runs_until_channel_closes() {
        let (tx, rx) = mpsc::unbounded_channel();
        let records = CompletionRecords::new();
        records.record_start(1, 1_000);
        records.record_start(2, 1_000);
        let listener = CompletionListener::new(rx, records.clone()).spawn();

        tx.send(CompletionNotice::Done(done(1, 20.0, 1_100))).unwrap();
        tx.send(CompletionNotice::Failed {
            task_id: 2,
            error: "unreadable".into(),
        })
        .unwrap();
        drop(tx);

        assert_eq!(listener.await.unwrap(), 2);
        assert_eq!(records.get(1).unwrap().latency_ms(), Some(100));
        assert_eq!(records.get(2).unwrap().error.as_deref(), Some("unreadable"));
    }
}
