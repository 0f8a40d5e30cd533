//! Sliding window log.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::clock::{to_datetime, Clock, SystemClock};
use super::decision::{Decision, Reason};
use super::rules::{valid_window, LimiterConfig};

/// Read-only view of a sliding window limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlidingWindowState {
    pub limit: u64,
    pub window_ms: u64,
    /// Admissions retained as of the last decision
    pub current: u64,
}

struct Log {
    limit: u64,
    window_ms: u64,
    /// Admission timestamps, oldest first
    admitted: VecDeque<u64>,
}

impl Log {
    /// Drop admissions strictly older than the window.
    fn evict(&mut self, now: u64) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_sub(oldest) <= self.window_ms {
                break;
            }
            self.admitted.pop_front();
        }
    }
}

/// A rate limiter over a continuously moving trailing window.
///
/// Each admission is remembered until it falls out of the window, so at any
/// instant the number of admissions within the trailing `window_ms` never
/// exceeds `limit`.
pub struct SlidingWindowLimiter {
    log: Mutex<Log>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Create a sliding window limiter on the system clock.
    pub fn new(limit: u64, window_ms: u64) -> Self {
        Self::with_clock(limit, window_ms, Arc::new(SystemClock))
    }

    /// Create a sliding window limiter reading time from `clock`.
    pub fn with_clock(limit: u64, window_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            log: Mutex::new(Log {
                limit,
                window_ms,
                admitted: VecDeque::new(),
            }),
            clock,
        }
    }

    /// Decide whether to admit `request_id`.
    pub fn decide(&self, request_id: &str) -> Decision {
        let now = self.clock.now_millis();
        let mut log = self.log.lock();
        log.evict(now);

        let current = log.admitted.len() as u64;
        if current < log.limit {
            log.admitted.push_back(now);
            return Decision::allowed(request_id, to_datetime(now), Some(current + 1));
        }

        debug!(
            request_id = request_id,
            count = current,
            limit = log.limit,
            "Sliding window limit exceeded"
        );
        Decision::rejected(request_id, to_datetime(now), Some(current), Reason::LimitExceeded)
    }

    /// Snapshot the window.
    pub fn state(&self) -> SlidingWindowState {
        let log = self.log.lock();
        SlidingWindowState {
            limit: log.limit,
            window_ms: log.window_ms,
            current: log.admitted.len() as u64,
        }
    }

    /// Current `(limit, window_ms)`.
    pub fn settings(&self) -> (u64, u64) {
        let log = self.log.lock();
        (log.limit, log.window_ms)
    }

    /// Merge `limit` and `window_ms` from `config`.
    pub fn update_config(&self, config: &LimiterConfig) {
        let mut log = self.log.lock();
        if let Some(limit) = config.limit {
            log.limit = limit;
        }
        if let Some(window_ms) = config.window_ms.filter(|ms| valid_window(*ms)) {
            log.window_ms = window_ms;
        }
        debug!(
            limit = log.limit,
            window_ms = log.window_ms,
            "Sliding window config updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn limiter(limit: u64, window_ms: u64) -> (SlidingWindowLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(50_000));
        (SlidingWindowLimiter::with_clock(limit, window_ms, clock.clone()), clock)
    }

    #[test]
    fn test_counts_reflect_window_length() {
        let (limiter, _) = limiter(3, 1_000);

        assert_eq!(limiter.decide("a").count(), Some(1));
        assert_eq!(limiter.decide("b").count(), Some(2));
        assert_eq!(limiter.decide("c").count(), Some(3));

        let rejected = limiter.decide("d");
        assert_eq!(rejected.reason(), Some(Reason::LimitExceeded));
        assert_eq!(rejected.count(), Some(3));
    }

    #[test]
    fn test_eviction_is_strictly_older_than_window() {
        let (limiter, clock) = limiter(1, 1_000);
        assert!(limiter.decide("a").is_allowed());

        // Exactly one window old is still retained
        clock.advance(1_000);
        assert!(!limiter.decide("b").is_allowed());

        clock.advance(1);
        assert!(limiter.decide("c").is_allowed());
    }

    #[test]
    fn test_no_boundary_burst() {
        let (limiter, clock) = limiter(4, 1_000);

        clock.advance(900);
        for _ in 0..4 {
            assert!(limiter.decide("late").is_allowed());
        }

        // A fixed window would reset here; the sliding window still sees 4
        clock.advance(200);
        assert!(!limiter.decide("early").is_allowed());
    }

    #[test]
    fn test_trailing_window_never_exceeds_limit() {
        let (limiter, clock) = limiter(5, 100);
        let mut admitted_at = Vec::new();

        for step in 0..500u64 {
            if limiter.decide("r").is_allowed() {
                admitted_at.push(clock.now_millis());
            }
            clock.advance(step % 7);
        }

        for &t in &admitted_at {
            let in_window = admitted_at
                .iter()
                .filter(|&&a| a <= t && t - a < 100)
                .count();
            assert!(in_window <= 5, "{} admissions in window ending {}", in_window, t);
        }
    }

    #[test]
    fn test_lowered_limit_keeps_existing_entries() {
        let (limiter, clock) = limiter(5, 1_000);
        for _ in 0..4 {
            limiter.decide("r");
        }

        limiter.update_config(&LimiterConfig::new().with_limit(2));
        assert_eq!(limiter.state().current, 4);
        assert!(!limiter.decide("r").is_allowed());

        clock.advance(1_001);
        assert!(limiter.decide("r").is_allowed());
        assert_eq!(limiter.state().current, 1);
    }
}
