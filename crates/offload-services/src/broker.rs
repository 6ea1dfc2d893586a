//! Offload broker: the EC side of the admission protocol.
//!
//! Per connection:
//!
//! ```text
//! AwaitRequest ─admit──▶ GRANT ─▶ AwaitAck ─▶ ReceivePayload ─▶ RunInference ─▶ DONE
//!              └reject─▶ DROP
//! ```
//!
//! Connection I/O runs concurrently, one task per connection. Only the
//! inference call itself is serialized, through `SerializedEngine`.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use offload_core::config::BrokerConfig;
use offload_core::wire::{self, Message, WireError};

use crate::admission::{Admission, AdmissionController, SlotGuard};
use crate::engine::{EngineError, InferenceEngine, SerializedEngine};

/// Pause before retrying a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Running broker-side totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub admitted: u64,
    pub completed: u64,
    pub dropped: u64,
    /// Admitted tasks that never reached DONE.
    pub failed: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
    #[error("OK:{got_token}:{got_task} does not match GRANT:{token} for task {task_id}")]
    TokenMismatch {
        token: u64,
        task_id: u64,
        got_token: u64,
        got_task: u64,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Clone)]
pub struct Broker {
    config: Arc<BrokerConfig>,
    admission: AdmissionController,
    engine: SerializedEngine,
    stats: Arc<Mutex<BrokerStats>>,
}

impl Broker {
    pub fn new(config: BrokerConfig, engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            admission: AdmissionController::new(config.admission.clone()),
            engine: SerializedEngine::new(engine),
            config: Arc::new(config),
            stats: Arc::new(Mutex::new(BrokerStats::default())),
        }
    }

    /// Bind the listening socket. Failure here is fatal to the broker.
    pub async fn bind(self, addr: &str) -> Result<BrokerServer, BrokerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BrokerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(BrokerServer {
            listener,
            broker: self,
        })
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock_stats().clone()
    }

    /// Live queue depth.
    pub fn queue_depth(&self) -> u64 {
        self.admission.depth()
    }

    /// Drive one connection through the protocol.
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), BrokerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = within(
            self.config.ack_timeout(),
            "REQ",
            wire::read_message(&mut stream),
        )
        .await?;
        let (task_id, model, device) = match request {
            Message::Req {
                task_id,
                model,
                device,
            } => (task_id, model, device),
            other => {
                return Err(BrokerError::Unexpected {
                    expected: "REQ",
                    got: other.tag(),
                })
            }
        };

        match self.admission.try_admit() {
            Admission::Rejected {
                position,
                estimated_wait_ms,
            } => {
                let dropped = {
                    let mut s = self.lock_stats();
                    s.dropped += 1;
                    s.dropped
                };
                tracing::info!(
                    task_id,
                    device = %device,
                    position,
                    estimated_wait_ms,
                    on_ec = self.admission.depth(),
                    dropped,
                    "DROP"
                );
                wire::write_message(&mut stream, &Message::Drop).await?;
                Ok(())
            }
            Admission::Granted(slot) => {
                self.lock_stats().admitted += 1;
                tracing::info!(
                    task_id,
                    device = %device,
                    token = slot.token(),
                    estimated_wait_ms = slot.estimated_wait_ms(),
                    on_ec = self.admission.depth(),
                    "GRANT"
                );
                let result = self.run_admitted(&mut stream, slot, task_id, model).await;
                if result.is_err() {
                    self.lock_stats().failed += 1;
                }
                result
            }
        }
    }

    async fn run_admitted<S>(
        &self,
        stream: &mut S,
        slot: SlotGuard,
        task_id: u64,
        model: String,
    ) -> Result<(), BrokerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let token = slot.token();
        wire::write_message(stream, &Message::Grant { token }).await?;

        let ack = within(self.config.ack_timeout(), "OK", wire::read_message(stream)).await?;
        match ack {
            Message::Ok {
                token: got_token,
                task_id: got_task,
            } if got_token != token || got_task != task_id => {
                return Err(BrokerError::TokenMismatch {
                    token,
                    task_id,
                    got_token,
                    got_task,
                });
            }
            Message::Ok { .. } => {}
            other => {
                return Err(BrokerError::Unexpected {
                    expected: "OK",
                    got: other.tag(),
                })
            }
        }

        let payload = within(
            self.config.payload_timeout(),
            "payload",
            wire::read_payload(stream, self.config.max_payload_bytes),
        )
        .await?;
        tracing::debug!(task_id, bytes = payload.len(), "payload received");

        let detections = self.engine.infer(payload, model).await?;

        drop(slot);
        wire::write_message(stream, &Message::Done).await?;
        let completed = {
            let mut s = self.lock_stats();
            s.completed += 1;
            s.completed
        };
        tracing::info!(
            task_id,
            token,
            detections = detections.len(),
            on_ec = self.admission.depth(),
            completed,
            "DONE"
        );
        Ok(())
    }

    fn lock_stats(&self) -> MutexGuard<'_, BrokerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn within<T, F>(limit: Duration, stage: &'static str, fut: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, WireError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| BrokerError::Timeout(stage))?
        .map_err(BrokerError::from)
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct BrokerServer {
    listener: TcpListener,
    broker: Broker,
}

impl BrokerServer {
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Accept until shutdown, then give in-flight connections the grace
    /// period before aborting them. Returns the final totals.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<BrokerStats> {
        let mut conns = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(in_flight = conns.len(), "broker shutting down");
                    break;
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let broker = self.broker.clone();
                    conns.spawn(async move {
                        if let Err(e) = broker.serve(stream).await {
                            tracing::warn!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }

                Some(_) = conns.join_next(), if !conns.is_empty() => {}
            }
        }

        let grace = self.broker.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while conns.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = conns.len(), "grace period elapsed, aborting connections");
            conns.shutdown().await;
        }

        Ok(self.broker.stats())
    }
}
