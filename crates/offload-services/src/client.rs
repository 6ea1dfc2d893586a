//! Offload client: drives one task through a remote attempt and falls back
//! to the local executor when the broker cannot take it.
//!
//! Anything short of a GRANT (connect failure, timeout, malformed or
//! unexpected reply, DROP) sends the task to the local queue. The remote
//! path is never retried for the same task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use offload_core::config::DeviceConfig;
use offload_core::wire::{self, Message, WireError};

use crate::completion::CompletionRecords;
use crate::executor::{LocalExecutorHandle, LocalJob};
use crate::stats::StatsAggregator;
use crate::task::{now_ms, Task, TaskState};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub model: String,
    pub device_tag: String,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub done_timeout: Duration,
}

impl From<&DeviceConfig> for ClientConfig {
    fn from(device: &DeviceConfig) -> Self {
        Self {
            endpoint: device.endpoint.clone(),
            model: device.model.clone(),
            device_tag: device.device_tag.clone(),
            connect_timeout: device.connect_timeout(),
            response_timeout: device.response_timeout(),
            done_timeout: device.done_timeout(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("unexpected {0} from broker")]
    Protocol(&'static str),
    #[error("broker answered DROP")]
    Rejection,
    #[error("payload {path} unreadable: {source}")]
    Payload {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl TaskError {
    /// Whether a failure before hand-over sends the task to the local queue.
    /// An unreadable payload cannot run anywhere.
    pub fn routes_to_fallback(&self) -> bool {
        !matches!(self, TaskError::Payload { .. })
    }
}

/// Terminal classification of one task on the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Remote { token: u64, latency_ms: u64 },
    /// Enqueued locally. `dropped` when the broker explicitly refused.
    Fallback { dropped: bool },
    PayloadError,
    Failed,
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Remote { .. } => "remote",
            TaskOutcome::Fallback { dropped: true } => "local-drop",
            TaskOutcome::Fallback { dropped: false } => "local",
            TaskOutcome::PayloadError => "payload-error",
            TaskOutcome::Failed => "failed",
        }
    }
}

#[derive(Clone)]
pub struct OffloadClient {
    config: Arc<ClientConfig>,
    stats: StatsAggregator,
    records: CompletionRecords,
    local: LocalExecutorHandle,
}

impl OffloadClient {
    pub fn new(
        config: ClientConfig,
        stats: StatsAggregator,
        records: CompletionRecords,
        local: LocalExecutorHandle,
    ) -> Self {
        Self {
            config: Arc::new(config),
            stats,
            records,
            local,
        }
    }

    pub async fn run_task(&self, mut task: Task) -> TaskOutcome {
        let started = Instant::now();
        task.start_ms = Some(now_ms());

        let outcome = match self.hand_over(&mut task).await {
            Ok((mut stream, token)) => match self.await_done(&mut stream).await {
                Ok(()) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    task.state = TaskState::Completed;
                    task.end_ms = Some(now_ms());
                    self.stats.record_remote(latency_ms);
                    TaskOutcome::Remote { token, latency_ms }
                }
                Err(e) => {
                    tracing::warn!(task_id = task.id, token, error = %e, "no DONE after hand-over");
                    task.state = TaskState::Failed;
                    self.stats.record_failed();
                    TaskOutcome::Failed
                }
            },
            Err(e) if e.routes_to_fallback() => self.fall_back(&mut task, &e),
            Err(e) => {
                tracing::warn!(task_id = task.id, error = %e, "task aborted");
                task.state = TaskState::Failed;
                self.stats.record_payload_error();
                TaskOutcome::PayloadError
            }
        };

        tracing::info!(
            task_id = task.id,
            outcome = outcome.label(),
            state = ?task.state,
            "task finished"
        );
        outcome
    }

    /// Everything up to and including the payload frame. Errors here happen
    /// before the broker could have started work on the task.
    async fn hand_over(&self, task: &mut Task) -> Result<(TcpStream, u64), TaskError> {
        let mut stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.endpoint),
        )
        .await
        .map_err(|_| TaskError::Timeout("connect"))?
        .map_err(|source| TaskError::Connect {
            endpoint: self.config.endpoint.clone(),
            source,
        })?;
        let _ = stream.set_nodelay(true);

        let request = Message::Req {
            task_id: task.id,
            model: self.config.model.clone(),
            device: self.config.device_tag.clone(),
        };
        wire::write_message(&mut stream, &request).await?;

        let reply = tokio::time::timeout(
            self.config.response_timeout,
            wire::read_message(&mut stream),
        )
        .await
        .map_err(|_| TaskError::Timeout("GRANT/DROP"))??;

        let token = match reply {
            Message::Grant { token } => token,
            Message::Drop => {
                task.state = TaskState::Dropped;
                return Err(TaskError::Rejection);
            }
            other => return Err(TaskError::Protocol(other.tag())),
        };
        task.state = TaskState::Admitted;
        task.remote_token = Some(token);

        let payload = tokio::fs::read(&task.payload)
            .await
            .map_err(|source| TaskError::Payload {
                path: task.payload.clone(),
                source,
            })?;
        tracing::debug!(
            task_id = task.id,
            token,
            bytes = payload.len(),
            digest = %hex::encode(&blake3::hash(&payload).as_bytes()[..8]),
            "GRANT, sending payload"
        );

        wire::write_message(
            &mut stream,
            &Message::Ok {
                token,
                task_id: task.id,
            },
        )
        .await?;
        wire::write_payload(&mut stream, &payload).await?;
        task.state = TaskState::Offloaded;
        Ok((stream, token))
    }

    async fn await_done(&self, stream: &mut TcpStream) -> Result<(), TaskError> {
        let reply = tokio::time::timeout(self.config.done_timeout, wire::read_message(stream))
            .await
            .map_err(|_| TaskError::Timeout("DONE"))??;
        match reply {
            Message::Done => Ok(()),
            other => Err(TaskError::Protocol(other.tag())),
        }
    }

    fn fall_back(&self, task: &mut Task, reason: &TaskError) -> TaskOutcome {
        let dropped = matches!(reason, TaskError::Rejection);
        tracing::debug!(task_id = task.id, reason = %reason, "falling back to local execution");

        self.records.record_start(task.id, now_ms());
        let job = LocalJob {
            task_id: task.id,
            payload_ref: task.payload.clone(),
        };
        match self.local.submit(job) {
            Ok(()) => {
                task.state = TaskState::LocallyQueued;
                self.stats.record_fallback(dropped);
                TaskOutcome::Fallback { dropped }
            }
            Err(e) => {
                tracing::error!(task_id = task.id, error = %e, "local enqueue failed");
                self.records.remove(task.id);
                task.state = TaskState::Failed;
                self.stats.record_failed();
                TaskOutcome::Failed
            }
        }
    }
}
