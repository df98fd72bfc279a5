//! When to drain a buffer and when to stop.

use std::time::{Duration, Instant};

/// Time budget and size threshold of one worker.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    start: Instant,
    budget: Option<Duration>,
    threshold: usize,
}

impl FlushPolicy {
    /// `minutes == 0` means no time budget.
    pub fn new(start: Instant, minutes: u64, threshold: usize) -> Self {
        let budget = (minutes > 0).then(|| Duration::from_secs(minutes * 60));
        Self::with_budget(start, budget, threshold)
    }

    pub fn with_budget(start: Instant, budget: Option<Duration>, threshold: usize) -> Self {
        Self {
            start,
            budget,
            threshold,
        }
    }

    /// True once the time budget has elapsed. Never true without a budget.
    pub fn should_stop(&self, now: Instant) -> bool {
        self.budget
            .is_some_and(|budget| now.saturating_duration_since(self.start) >= budget)
    }

    pub fn should_flush(&self, buffer_size: usize) -> bool {
        buffer_size >= self.threshold
    }

    /// Whole minutes left in the budget, `None` when unbounded.
    pub fn minutes_left(&self, now: Instant) -> Option<u64> {
        self.budget.map(|budget| {
            budget
                .saturating_sub(now.saturating_duration_since(self.start))
                .as_secs()
                / 60
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}
