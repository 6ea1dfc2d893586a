//! Admission control: bounds the broker's queueing delay.
//!
//! A request at 0-indexed queue position `p` has an estimated wait of
//! `p * per_task_cost_ms`. In `Enforce` mode it is admitted iff that wait is
//! within `latency_budget_ms`; in `Observe` mode everything is admitted and
//! over-budget estimates are only logged.
//!
//! The position read, the threshold check and the increment happen under one
//! lock, so concurrent requests can never overshoot the threshold.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use offload_core::config::{AdmissionMode, AdmissionSettings};

/// Estimated wait in ms for a request at `position`.
pub fn estimated_wait_ms(position: u64, per_task_cost_ms: f64) -> f64 {
    position as f64 * per_task_cost_ms
}

/// The threshold rule: admitted iff `position * cost <= budget`.
pub fn admits(position: u64, per_task_cost_ms: f64, latency_budget_ms: f64) -> bool {
    estimated_wait_ms(position, per_task_cost_ms) <= latency_budget_ms
}

/// Result of one admission decision.
#[derive(Debug)]
pub enum Admission {
    /// Admitted. The slot is held until the guard is dropped.
    Granted(SlotGuard),
    /// Rejected. No slot was consumed.
    Rejected { position: u64, estimated_wait_ms: f64 },
}

/// Owns the live queue depth.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    depth: Arc<Mutex<u64>>,
    settings: AdmissionSettings,
}

impl AdmissionController {
    pub fn new(settings: AdmissionSettings) -> Self {
        Self {
            depth: Arc::new(Mutex::new(0)),
            settings,
        }
    }

    pub fn settings(&self) -> &AdmissionSettings {
        &self.settings
    }

    /// Current queue depth.
    pub fn depth(&self) -> u64 {
        *lock(&self.depth)
    }

    /// Decide on one incoming request.
    pub fn try_admit(&self) -> Admission {
        let mut depth = lock(&self.depth);
        let position = *depth;
        let wait = estimated_wait_ms(position, self.settings.per_task_cost_ms);
        let within_budget = wait <= self.settings.latency_budget_ms;

        if !within_budget && self.settings.mode == AdmissionMode::Enforce {
            return Admission::Rejected {
                position,
                estimated_wait_ms: wait,
            };
        }

        *depth += 1;
        drop(depth);

        if !within_budget {
            tracing::debug!(
                position,
                estimated_wait_ms = wait,
                budget_ms = self.settings.latency_budget_ms,
                "over budget, admitted in observe mode"
            );
        }

        Admission::Granted(SlotGuard {
            depth: self.depth.clone(),
            position,
            estimated_wait_ms: wait,
        })
    }
}

/// One consumed queue slot. Dropping it releases the slot exactly once,
/// whether the task completed, timed out or the connection died.
#[derive(Debug)]
pub struct SlotGuard {
    depth: Arc<Mutex<u64>>,
    position: u64,
    estimated_wait_ms: f64,
}

impl SlotGuard {
    /// Remote token handed to the client: the admitted position.
    pub fn token(&self) -> u64 {
        self.position
    }

    pub fn estimated_wait_ms(&self) -> f64 {
        self.estimated_wait_ms
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut depth = lock(&self.depth);
        *depth = depth.saturating_sub(1);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
