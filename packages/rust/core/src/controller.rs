//! Adaptive concurrency limit for bulk runs.
//!
//! The limit starts at the configured ceiling, shrinks whenever the API
//! reports it is over capacity (timeouts, rate limits) and grows back one
//! step at a time after clean batches.

use tracing::{debug, info};

use bulkmapper_shared::{DecreasePolicy, FailureKind};

#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    max: usize,
    current: usize,
    clean_streak: u32,
    grow_after: u32,
    policy: DecreasePolicy,
}

impl ConcurrencyController {
    /// `max` and `grow_after` are floored at 1.
    pub fn new(max: usize, grow_after: u32, policy: DecreasePolicy) -> Self {
        let max = max.max(1);
        Self {
            max,
            current: max,
            clean_streak: 0,
            grow_after: grow_after.max(1),
            policy,
        }
    }

    /// Current in-flight request limit.
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// React to a failure. Returns `true` if the limit was lowered.
    ///
    /// Only capacity failures (timeouts and rate limits) count.
    pub fn record_failure(&mut self, kind: FailureKind) -> bool {
        if !kind.is_capacity() {
            return false;
        }

        let before = self.current;
        self.current = match self.policy {
            DecreasePolicy::Step if before > 4 => before - 2,
            DecreasePolicy::Step => before.saturating_sub(1).max(1),
            DecreasePolicy::Halve => before.div_ceil(2).max(1),
        };
        self.clean_streak = 0;

        if self.current < before {
            info!(
                from = before,
                to = self.current,
                cause = ?kind,
                "decreasing number of threads"
            );
            true
        } else {
            debug!(current = self.current, cause = ?kind, "concurrency already at floor");
            false
        }
    }

    /// Close out a batch, growing the limit after enough clean batches.
    ///
    /// Once the streak reaches `grow_after`, every further clean batch grows
    /// the limit by one. Only a capacity failure resets the streak.
    pub fn finish_batch(&mut self, had_capacity_failure: bool) {
        if had_capacity_failure {
            self.clean_streak = 0;
            return;
        }

        self.clean_streak += 1;
        if self.clean_streak >= self.grow_after && self.current < self.max {
            self.current += 1;
            info!(to = self.current, max = self.max, "increasing number of threads");
        }
    }

    /// Submissions allowed for the batch about to start.
    ///
    /// Lower limits get fewer attempts: 8 → 16, 4 → 14, 1 → 12.
    pub fn max_batch_attempts(&self) -> u32 {
        let current = self.current as i64;
        let extra = (current - 4).div_euclid(2) + 3;
        let attempts = (extra + 10).max(10) + 1;
        attempts as u32
    }
}
