//! Per-invocation time budget.

use std::time::{Duration, Instant};

/// Wall-clock budget a pass checks itself against.
#[derive(Debug, Clone, Copy)]
pub struct InvocationBudget {
    started: Instant,
    budget: Duration,
}

impl InvocationBudget {
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    pub fn exhausted(&self) -> bool {
        self.elapsed() >= self.budget
    }
}
