//! Local fallback executor: serializes every fallen-back task onto one
//! long-lived inference engine.
//!
//! The device has a single compute budget, so at most one local inference
//! runs at a time. The consumer loop hands each job to the engine and moves
//! on; completions come back on the completion channel and are joined with
//! their start times by the `CompletionListener`.
//!
//! Two runtimes are supported:
//!   InProcess  a `Semaphore(1)` permit is taken before each dispatch and
//!              released when the blocking inference returns.
//!   External   a persistent worker process reads `<id>:<payload_ref>` job
//!              lines on stdin and reports `<id>,<infer_ms>,<epoch_ms>` on
//!              stdout. It runs jobs one at a time itself. Jobs it never
//!              answers are failed once its stdout closes.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use offload_core::wire::{CompletionLine, JobLine};

use crate::completion::{CompletionNotice, CompletionSender};
use crate::engine::{EngineError, InferenceEngine};
use crate::task::now_ms;

/// One task handed to the local engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalJob {
    pub task_id: u64,
    pub payload_ref: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("local executor has shut down")]
    Closed,
    #[error("failed to launch local worker {command:?}: {source}")]
    Launch {
        command: String,
        source: std::io::Error,
    },
    #[error("local worker {0} not piped")]
    MissingPipe(&'static str),
}

/// Where local inference happens.
pub enum LocalRuntime {
    InProcess {
        engine: Arc<dyn InferenceEngine>,
        model: String,
    },
    External(ExternalWorker),
}

/// Cheap, cloneable submission side of the local queue.
#[derive(Clone)]
pub struct LocalExecutorHandle {
    tx: mpsc::UnboundedSender<LocalJob>,
}

impl LocalExecutorHandle {
    pub fn submit(&self, job: LocalJob) -> Result<(), ExecutorError> {
        self.tx.send(job).map_err(|_| ExecutorError::Closed)
    }
}

pub struct LocalExecutor {
    rx: mpsc::UnboundedReceiver<LocalJob>,
    completions: CompletionSender,
    runtime: LocalRuntime,
}

impl LocalExecutor {
    /// Start the consumer loop. It exits once every handle is dropped and
    /// the queue has been drained; the join value is the number of jobs
    /// dispatched.
    pub fn spawn(
        runtime: LocalRuntime,
        completions: CompletionSender,
    ) -> (LocalExecutorHandle, JoinHandle<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = Self {
            rx,
            completions,
            runtime,
        };
        (LocalExecutorHandle { tx }, tokio::spawn(executor.run()))
    }

    async fn run(self) -> u64 {
        let Self {
            rx,
            completions,
            runtime,
        } = self;
        match runtime {
            LocalRuntime::InProcess { engine, model } => {
                run_in_process(rx, completions, engine, model).await
            }
            LocalRuntime::External(worker) => worker.run(rx, completions).await,
        }
    }
}

// ── In-process runtime ────────────────────────────────────────────────────────

async fn run_in_process(
    mut rx: mpsc::UnboundedReceiver<LocalJob>,
    completions: CompletionSender,
    engine: Arc<dyn InferenceEngine>,
    model: String,
) -> u64 {
    let permit_pool = Arc::new(Semaphore::new(1));
    let mut dispatched = 0;
    tracing::info!(model = %model, "local executor started (in-process)");

    while let Some(job) = rx.recv().await {
        let permit = match permit_pool.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break, // semaphore closed
        };
        dispatched += 1;
        tracing::debug!(task_id = job.task_id, "dispatching local job");

        let engine = engine.clone();
        let model = model.clone();
        let completions = completions.clone();
        tokio::task::spawn_blocking(move || {
            let notice = panic::catch_unwind(AssertUnwindSafe(|| {
                infer_local(engine.as_ref(), &job, &model)
            }))
            .unwrap_or_else(|_| {
                tracing::error!(task_id = job.task_id, "local engine panicked");
                CompletionNotice::Failed {
                    task_id: job.task_id,
                    error: "local engine panicked".to_string(),
                }
            });
            let _ = completions.send(notice);
            drop(permit);
        });
    }

    // Wait for the last inference to hand its permit back.
    let _ = permit_pool.acquire().await;
    tracing::info!(dispatched, "local executor drained");
    dispatched
}

fn infer_local(engine: &dyn InferenceEngine, job: &LocalJob, model: &str) -> CompletionNotice {
    let started = Instant::now();
    let result = std::fs::read(&job.payload_ref)
        .map_err(|e| {
            EngineError::Failed(format!(
                "payload {} unreadable: {e}",
                job.payload_ref.display()
            ))
        })
        .and_then(|payload| engine.infer(&payload, model));

    match result {
        Ok(_) => CompletionNotice::Done(CompletionLine {
            task_id: job.task_id,
            infer_ms: started.elapsed().as_secs_f64() * 1000.0,
            completed_at_ms: now_ms(),
        }),
        Err(e) => CompletionNotice::Failed {
            task_id: job.task_id,
            error: e.to_string(),
        },
    }
}

// ── External worker runtime ───────────────────────────────────────────────────

/// Job ids written to the worker that it has not reported on yet. Whoever
/// removes an id owns its one completion notice.
#[derive(Clone, Default)]
struct InFlight {
    inner: Arc<Mutex<InFlightState>>,
}

#[derive(Default)]
struct InFlightState {
    ids: BTreeSet<u64>,
    closed: bool,
}

impl InFlight {
    /// Returns false once the worker has gone away.
    fn dispatch(&self, task_id: u64) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.ids.insert(task_id);
        true
    }

    fn settle(&self, task_id: u64) -> bool {
        self.lock().ids.remove(&task_id)
    }

    /// Refuse further jobs. Ones already written stay for the reader.
    fn refuse(&self) {
        self.lock().closed = true;
    }

    /// Refuse further jobs and fail every one still outstanding.
    fn close(&self, completions: &CompletionSender, reason: &str) -> usize {
        let orphaned = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.ids)
        };
        for &task_id in &orphaned {
            let _ = completions.send(CompletionNotice::Failed {
                task_id,
                error: reason.to_string(),
            });
        }
        orphaned.len()
    }

    fn lock(&self) -> MutexGuard<'_, InFlightState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A persistent local inference process.
pub struct ExternalWorker {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<u64>,
    in_flight: InFlight,
}

impl ExternalWorker {
    /// Launch the worker and start forwarding its completion lines. Launch
    /// failure is fatal to the run.
    pub fn launch(
        command: &str,
        args: &[String],
        completions: CompletionSender,
    ) -> Result<Self, ExecutorError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Launch {
                command: command.to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(ExecutorError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ExecutorError::MissingPipe("stdout"))?;

        let in_flight = InFlight::default();
        let tracked = in_flight.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut forwarded = 0;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match CompletionLine::parse(&line) {
                        Ok(done) if tracked.settle(done.task_id) => {
                            forwarded += 1;
                            let _ = completions.send(CompletionNotice::Done(done));
                        }
                        Ok(done) => tracing::warn!(
                            task_id = done.task_id,
                            "completion for unknown local job"
                        ),
                        Err(_) => tracing::debug!(line = %line, "local worker output"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "local worker stdout read failed");
                        break;
                    }
                }
            }
            let orphaned = tracked.close(&completions, "local worker exited before reporting");
            if orphaned > 0 {
                tracing::error!(orphaned, "local worker exited with jobs outstanding");
            }
            forwarded
        });

        tracing::info!(command, pid = child.id(), "local worker launched");
        Ok(Self {
            child,
            stdin,
            reader,
            in_flight,
        })
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<LocalJob>,
        completions: CompletionSender,
    ) -> u64 {
        let mut dispatched = 0;

        while let Some(job) = rx.recv().await {
            dispatched += 1;
            if !self.in_flight.dispatch(job.task_id) {
                let _ = completions.send(CompletionNotice::Failed {
                    task_id: job.task_id,
                    error: "local worker unavailable".to_string(),
                });
                continue;
            }
            let line = JobLine {
                task_id: job.task_id,
                payload_ref: job.payload_ref.display().to_string(),
            };
            match self.write_job(&line).await {
                Ok(()) => tracing::debug!(task_id = job.task_id, "job sent to local worker"),
                Err(e) => {
                    tracing::error!(error = %e, "local worker stopped accepting jobs");
                    self.in_flight.refuse();
                    if self.in_flight.settle(job.task_id) {
                        let _ = completions.send(CompletionNotice::Failed {
                            task_id: job.task_id,
                            error: "local worker unavailable".to_string(),
                        });
                    }
                }
            }
        }

        // EOF on stdin tells the worker to finish up and exit.
        drop(self.stdin);
        let forwarded = self.reader.await.unwrap_or(0);
        match self.child.wait().await {
            Ok(status) => tracing::info!(%status, dispatched, forwarded, "local worker exited"),
            Err(e) => tracing::warn!(error = %e, "failed to reap local worker"),
        }
        self.in_flight
            .close(&completions, "local worker exited before reporting");
        dispatched
    }

    async fn write_job(&mut self, line: &JobLine) -> std::io::Result<()> {
        self.stdin.write_all(format!("{line}\n").as_bytes()).await?;
        self.stdin.flush().await
    }
}
