//! Synthetic workload: an arrival process plus a payload picker.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Exp};
use tokio::sync::{broadcast, mpsc};

use offload_core::config::{ArrivalSettings, PayloadSettings, RunLimit};

use crate::task::Task;

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("arrival rate must be positive and finite, got {0}")]
    InvalidRate(f64),
}

/// Inter-arrival time source.
#[derive(Debug, Clone)]
pub enum ArrivalProcess {
    FixedRate(Duration),
    Poisson(Exp<f64>),
}

impl ArrivalProcess {
    pub fn from_settings(settings: &ArrivalSettings) -> Result<Self, GeneratorError> {
        match *settings {
            ArrivalSettings::FixedRate { tasks_per_sec } => {
                if !tasks_per_sec.is_finite() || tasks_per_sec <= 0.0 {
                    return Err(GeneratorError::InvalidRate(tasks_per_sec));
                }
                Ok(Self::FixedRate(Duration::from_secs_f64(1.0 / tasks_per_sec)))
            }
            ArrivalSettings::Poisson { rate_per_sec } => Exp::new(rate_per_sec)
                .ok()
                .filter(|_| rate_per_sec.is_finite() && rate_per_sec > 0.0)
                .map(Self::Poisson)
                .ok_or(GeneratorError::InvalidRate(rate_per_sec)),
        }
    }

    pub fn next_delay<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match self {
            Self::FixedRate(interval) => *interval,
            Self::Poisson(exp) => Duration::from_secs_f64(exp.sample(rng)),
        }
    }
}

/// Where each task's input comes from.
#[derive(Debug, Clone)]
pub enum PayloadSource {
    File(PathBuf),
    Directory { files: Vec<PathBuf> },
}

impl PayloadSource {
    /// A directory is listed once. If it cannot be read or holds no regular
    /// files, every task uses the fixed path instead.
    pub fn from_settings(settings: &PayloadSettings) -> Self {
        let Some(dir) = &settings.directory else {
            return Self::File(settings.path.clone());
        };

        let files = match std::fs::read_dir(dir) {
            Ok(entries) => {
                let mut files: Vec<PathBuf> = entries
                    .filter_map(Result::ok)
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect();
                files.sort();
                files
            }
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "payload directory unreadable");
                Vec::new()
            }
        };

        if files.is_empty() {
            tracing::warn!(
                dir = %dir.display(),
                fallback = %settings.path.display(),
                "no payload files found, using fixed payload"
            );
            return Self::File(settings.path.clone());
        }
        tracing::info!(dir = %dir.display(), files = files.len(), "payload directory loaded");
        Self::Directory { files }
    }

    pub fn pick<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> PathBuf {
        match self {
            Self::File(path) => path.clone(),
            Self::Directory { files } => files.choose(rng).cloned().unwrap_or_default(),
        }
    }
}

pub struct TaskGenerator {
    arrival: ArrivalProcess,
    payloads: PayloadSource,
    limit: RunLimit,
    rng: StdRng,
}

impl TaskGenerator {
    pub fn new(arrival: ArrivalProcess, payloads: PayloadSource, limit: RunLimit) -> Self {
        Self {
            arrival,
            payloads,
            limit,
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible arrivals and payload picks.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Emit tasks with ids 0, 1, 2, ... until the run limit or shutdown.
    /// Returns how many were generated.
    pub async fn run(
        mut self,
        tx: mpsc::UnboundedSender<Task>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> u64 {
        let started = Instant::now();
        let (max_tasks, deadline) = match self.limit {
            RunLimit::Count { tasks } => (Some(tasks), None),
            RunLimit::Duration { secs } => (None, Some(started + Duration::from_secs(secs))),
        };

        let mut generated = 0;
        loop {
            if max_tasks.is_some_and(|max| generated >= max) {
                break;
            }

            let task = Task::new(generated, self.payloads.pick(&mut self.rng));
            if tx.send(task).is_err() {
                tracing::warn!("task consumer gone, stopping generator");
                break;
            }
            generated += 1;

            if max_tasks.is_some_and(|max| generated >= max) {
                break;
            }
            let delay = self.arrival.next_delay(&mut self.rng);
            if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                break;
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(generated, "generator interrupted");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(
            generated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "task generation finished"
        );
        generated
    }
}
