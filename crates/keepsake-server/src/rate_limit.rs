//! Fixed-window request limits per account and endpoint class.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Upload, update and delete.
    Mutation,
    /// Change feed and status reads.
    Feed,
}

impl EndpointClass {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Mutation => "mutation",
            Self::Feed => "feed",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Mutation => 0,
            Self::Feed => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

impl RateWindow {
    fn expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.started_at) >= window
    }
}

#[derive(Default)]
struct ClassCounters {
    allowed: AtomicU64,
    limited: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub mutation_allowed: u64,
    pub mutation_limited: u64,
    pub feed_allowed: u64,
    pub feed_limited: u64,
    /// Windows currently held in memory.
    pub tracked_windows: usize,
}

/// Shared limiter; clones see the same windows.
///
/// Windows live in a sharded map so concurrent accounts do not contend on one
/// lock. Once per window length, `check` sweeps windows that have expired.
#[derive(Clone)]
pub struct EndpointRateLimiter {
    windows: Arc<DashMap<(EndpointClass, String), RateWindow>>,
    last_sweep: Arc<Mutex<Instant>>,
    window: Duration,
    limits: [u32; 2],
    counters: Arc<[ClassCounters; 2]>,
}

impl EndpointRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_window,
            config.mutation_rate_limit_per_window,
            config.feed_rate_limit_per_window,
        )
    }

    fn new(window: Duration, mutation_limit: u32, feed_limit: u32) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            last_sweep: Arc::new(Mutex::new(Instant::now())),
            window,
            limits: [mutation_limit, feed_limit],
            counters: Arc::new([ClassCounters::default(), ClassCounters::default()]),
        }
    }

    pub fn check(&self, endpoint: EndpointClass, user_id: &str) -> Result<(), AppError> {
        self.check_at(endpoint, user_id, Instant::now())
    }

    fn check_at(&self, endpoint: EndpointClass, user_id: &str, now: Instant) -> Result<(), AppError> {
        self.sweep_if_due(now);

        let limit = self.limits[endpoint.index()];
        let counters = &self.counters[endpoint.index()];
        let retry_after = {
            let mut entry = self
                .windows
                .entry((endpoint, user_id.to_string()))
                .or_insert(RateWindow {
                    started_at: now,
                    count: 0,
                });
            if entry.expired(now, self.window) {
                *entry = RateWindow {
                    started_at: now,
                    count: 0,
                };
            }
            if entry.count < limit {
                entry.count += 1;
                None
            } else {
                Some(
                    self.window
                        .saturating_sub(now.saturating_duration_since(entry.started_at)),
                )
            }
        };

        let Some(retry_after) = retry_after else {
            counters.allowed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        counters.limited.fetch_add(1, Ordering::Relaxed);
        let retry_after_secs = retry_after.as_secs().max(1);
        tracing::warn!(
            endpoint = endpoint.label(),
            user = user_fingerprint(user_id),
            retry_after_secs,
            "Rate limit exceeded"
        );
        Err(AppError::too_many_requests(
            "Rate limit exceeded for sync endpoint",
            retry_after_secs,
        ))
    }

    fn sweep_if_due(&self, now: Instant) {
        {
            let mut last_sweep = self.last_sweep.lock();
            if now.saturating_duration_since(*last_sweep) < self.window {
                return;
            }
            *last_sweep = now;
        }

        let before = self.windows.len();
        self.windows
            .retain(|_, window| !window.expired(now, self.window));
        let evicted = before.saturating_sub(self.windows.len());
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted expired rate limit windows");
        }
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        let [mutation, feed] = &*self.counters;
        RateLimitMetricsSnapshot {
            mutation_allowed: mutation.allowed.load(Ordering::Relaxed),
            mutation_limited: mutation.limited.load(Ordering::Relaxed),
            feed_allowed: feed.allowed.load(Ordering::Relaxed),
            feed_limited: feed.limited.load(Ordering::Relaxed),
            tracked_windows: self.windows.len(),
        }
    }
}

/// Stable, non-reversible tag for logging an account.
pub fn user_fingerprint(user_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn blocks_after_limit_until_window_rolls_over() {
        let limiter = EndpointRateLimiter::new(WINDOW, 2, 2);
        let start = Instant::now();

        limiter.check_at(EndpointClass::Mutation, "user-a", start).unwrap();
        limiter.check_at(EndpointClass::Mutation, "user-a", start).unwrap();
        let err = limiter
            .check_at(EndpointClass::Mutation, "user-a", start + Duration::from_secs(15))
            .unwrap_err();
        assert!(matches!(err, AppError::TooManyRequests(_, 45)));

        limiter
            .check_at(EndpointClass::Mutation, "user-a", start + WINDOW)
            .unwrap();

        let metrics = limiter.metrics_snapshot();
        assert_eq!(metrics.mutation_allowed, 3);
        assert_eq!(metrics.mutation_limited, 1);
    }

    #[test]
    fn classes_and_users_have_separate_windows() {
        let limiter = EndpointRateLimiter::new(WINDOW, 1, 1);
        let now = Instant::now();

        limiter.check_at(EndpointClass::Mutation, "user-a", now).unwrap();
        limiter.check_at(EndpointClass::Feed, "user-a", now).unwrap();
        limiter.check_at(EndpointClass::Mutation, "user-b", now).unwrap();
        assert!(limiter.check_at(EndpointClass::Feed, "user-a", now).is_err());

        let metrics = limiter.metrics_snapshot();
        assert_eq!(metrics.feed_allowed, 1);
        assert_eq!(metrics.feed_limited, 1);
        assert_eq!(metrics.tracked_windows, 3);
    }

    #[test]
    fn expired_windows_are_evicted() {
        let limiter = EndpointRateLimiter::new(WINDOW, 5, 5);
        let start = Instant::now();
        for user in ["user-a", "user-b", "user-c"] {
            limiter.check_at(EndpointClass::Feed, user, start).unwrap();
        }
        assert_eq!(limiter.metrics_snapshot().tracked_windows, 3);

        let later = start + WINDOW + Duration::from_secs(1);
        limiter.check_at(EndpointClass::Mutation, "user-d", later).unwrap();
        assert_eq!(limiter.metrics_snapshot().tracked_windows, 1);
    }
}
