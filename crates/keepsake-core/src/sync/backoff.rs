//! Retry backoff for entity types whose last pass hit a transient failure.

use std::time::{Duration, Instant};

use crate::models::SyncPhase;

/// Exponential backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    ///
    /// `min(base * 2^(failures - 1), max)`; zero failures means no delay.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1_u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Pass state of one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeState {
    pub phase: SyncPhase,
    pub failures: u32,
    pub retry_at: Option<Instant>,
}

impl Default for TypeState {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            failures: 0,
            retry_at: None,
        }
    }
}

impl TypeState {
    /// Whether a pass may start at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        match (self.phase, self.retry_at) {
            (SyncPhase::Failed, Some(retry_at)) => now >= retry_at,
            _ => true,
        }
    }

    /// Enter `Failed` and schedule the next attempt.
    pub fn fail(&mut self, now: Instant, policy: &RetryPolicy) {
        self.failures = self.failures.saturating_add(1);
        self.phase = SyncPhase::Failed;
        self.retry_at = Some(now + policy.delay(self.failures));
    }

    /// Return to `Idle` after a pass without transient failures.
    pub fn succeed(&mut self) {
        *self = Self::default();
    }
}
