//! Fixed window counter.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use super::clock::{to_datetime, Clock, SystemClock};
use super::decision::{Decision, Reason};
use super::rules::{valid_window, LimiterConfig};

/// Read-only view of a fixed window limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedWindowState {
    pub limit: u64,
    pub window_ms: u64,
    pub count: u64,
    pub window_start: DateTime<Utc>,
}

struct Window {
    limit: u64,
    window_ms: u64,
    count: u64,
    /// Epoch millis at which the current window opened
    window_start: u64,
}

/// A rate limiter that counts admissions in non-overlapping windows.
///
/// The window resets lazily: the first decision that observes the window has
/// expired starts a new one at its own timestamp. Config changes never reset
/// the current window, so bursts straddling a boundary can reach twice the
/// limit.
pub struct FixedWindowLimiter {
    window: Mutex<Window>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    /// Create a fixed window limiter on the system clock.
    pub fn new(limit: u64, window_ms: u64) -> Self {
        Self::with_clock(limit, window_ms, Arc::new(SystemClock))
    }

    /// Create a fixed window limiter reading time from `clock`.
    pub fn with_clock(limit: u64, window_ms: u64, clock: Arc<dyn Clock>) -> Self {
        let window_start = clock.now_millis();
        Self {
            window: Mutex::new(Window {
                limit,
                window_ms,
                count: 0,
                window_start,
            }),
            clock,
        }
    }

    /// Decide whether to admit `request_id`.
    pub fn decide(&self, request_id: &str) -> Decision {
        let now = self.clock.now_millis();
        let mut window = self.window.lock();

        if now.saturating_sub(window.window_start) >= window.window_ms {
            trace!(count = window.count, "Fixed window expired, resetting");
            window.window_start = now;
            window.count = 0;
        }

        if window.count < window.limit {
            window.count += 1;
            return Decision::allowed(request_id, to_datetime(now), Some(window.count));
        }

        debug!(
            request_id = request_id,
            count = window.count,
            limit = window.limit,
            "Fixed window limit exceeded"
        );
        Decision::rejected(
            request_id,
            to_datetime(now),
            Some(window.count),
            Reason::LimitExceeded,
        )
    }

    /// Snapshot the current window.
    pub fn state(&self) -> FixedWindowState {
        let window = self.window.lock();
        FixedWindowState {
            limit: window.limit,
            window_ms: window.window_ms,
            count: window.count,
            window_start: to_datetime(window.window_start),
        }
    }

    /// Current `(limit, window_ms)`.
    pub fn settings(&self) -> (u64, u64) {
        let window = self.window.lock();
        (window.limit, window.window_ms)
    }

    /// Merge `limit` and `window_ms` from `config`.
    pub fn update_config(&self, config: &LimiterConfig) {
        let mut window = self.window.lock();
        if let Some(limit) = config.limit {
            window.limit = limit;
        }
        if let Some(window_ms) = config.window_ms.filter(|ms| valid_window(*ms)) {
            window.window_ms = window_ms;
        }
        debug!(
            limit = window.limit,
            window_ms = window.window_ms,
            "Fixed window config updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::decision::DecisionStatus;

    fn limiter(limit: u64, window_ms: u64) -> (FixedWindowLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000));
        (FixedWindowLimiter::with_clock(limit, window_ms, clock.clone()), clock)
    }

    #[test]
    fn test_allows_within_limit() {
        let (limiter, _) = limiter(3, 1_000);

        for expected in 1..=3 {
            let decision = limiter.decide("req");
            assert_eq!(decision.status(), DecisionStatus::Allowed);
            assert_eq!(decision.count(), Some(expected));
        }
    }

    #[test]
    fn test_rejects_over_limit() {
        let (limiter, clock) = limiter(2, 1_000);

        limiter.decide("a");
        limiter.decide("b");
        clock.advance(999);

        let decision = limiter.decide("c");
        assert_eq!(decision.status(), DecisionStatus::Rejected);
        assert_eq!(decision.reason(), Some(Reason::LimitExceeded));
        assert_eq!(decision.count(), Some(2));
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let (limiter, clock) = limiter(1, 1_000);

        assert!(limiter.decide("a").is_allowed());
        assert!(!limiter.decide("b").is_allowed());

        clock.advance(1_000);
        let decision = limiter.decide("c");
        assert!(decision.is_allowed());
        assert_eq!(decision.count(), Some(1));
        assert_eq!(limiter.state().window_start, to_datetime(11_000));
    }

    #[test]
    fn test_admitted_never_exceeds_limit_per_window() {
        let (limiter, clock) = limiter(5, 100);

        for _ in 0..10 {
            let admitted = (0..20).filter(|_| limiter.decide("r").is_allowed()).count();
            assert_eq!(admitted, 5);
            clock.advance(100);
        }
    }

    #[test]
    fn test_lowering_limit_mid_window_rejects_until_reset() {
        let (limiter, clock) = limiter(10, 1_000);
        for _ in 0..5 {
            limiter.decide("r");
        }

        limiter.update_config(&LimiterConfig::new().with_limit(3));
        assert_eq!(limiter.state().count, 5);

        clock.advance(500);
        for _ in 0..3 {
            let decision = limiter.decide("r");
            assert_eq!(decision.reason(), Some(Reason::LimitExceeded));
            assert_eq!(decision.count(), Some(5));
        }

        clock.advance(500);
        assert!(limiter.decide("r").is_allowed());
    }

    #[test]
    fn test_raising_limit_mid_window_admits_immediately() {
        let (limiter, _) = limiter(1, 1_000);
        limiter.decide("a");
        assert!(!limiter.decide("b").is_allowed());

        limiter.update_config(&LimiterConfig::new().with_limit(2));
        let decision = limiter.decide("c");
        assert!(decision.is_allowed());
        assert_eq!(decision.count(), Some(2));
    }

    #[test]
    fn test_update_ignores_unrelated_fields() {
        let (limiter, _) = limiter(4, 1_000);
        limiter.update_config(&LimiterConfig::new().with_capacity(99).with_window_ms(250));

        let state = limiter.state();
        assert_eq!(state.limit, 4);
        assert_eq!(state.window_ms, 250);
    }

    #[test]
    fn test_zero_limit_rejects_everything() {
        let (limiter, _) = limiter(0, 1_000);
        assert_eq!(limiter.decide("r").count(), Some(0));
        assert!(!limiter.decide("r").is_allowed());
    }

    #[test]
    fn test_update_ignores_unusable_windows() {
        let (limiter, _) = limiter(4, 1_000);
        limiter.update_config(&LimiterConfig::new().with_window_ms(0));
        limiter.update_config(&LimiterConfig::new().with_window_ms(u64::MAX));
        assert_eq!(limiter.state().window_ms, 1_000);
    }

    #[test]
    fn test_concurrent_decisions_admit_limit_exactly() {
        let (limiter, _) = limiter(100, 1_000);

        let allowed: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let limiter = &limiter;
                    scope.spawn(move || (0..50).filter(|_| limiter.decide("r").is_allowed()).count())
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        assert_eq!(allowed, 100);
        assert_eq!(limiter.state().count, 100);
    }
}
