//! Per-bearer counters.
//!
//! Counters only — export and aggregation belong to the outer layers.

use serde::Serialize;

/// Monotonic counters for one bearer's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BearerStats {
    /// Setup requests handed to the driver.
    pub setup_attempts: u64,
    /// Setups that reached Active.
    pub setup_successes: u64,
    /// Connect attempts resolved with a failure cause.
    pub connect_failures: u64,
    /// Driver replies dropped because their tag no longer matched.
    pub stale_replies: u64,
    /// Handover bring-ups started with this bearer as destination.
    pub handovers_started: u64,
    /// Handovers where this bearer adopted the source's agent.
    pub handovers_completed: u64,
    /// Deactivations requested (excluding fire-and-forget).
    pub teardowns: u64,
}

impl BearerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Setup success ratio over the bearer's lifetime.
    pub fn setup_success_rate(&self) -> f64 {
        if self.setup_attempts == 0 {
            0.0
        } else {
            self.setup_successes as f64 / self.setup_attempts as f64
        }
    }
}
