//! Token bucket with lazy, time-based refill.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::clock::{to_datetime, Clock, SystemClock};
use super::decision::{Decision, Reason};
use super::rules::{valid_rate, LimiterConfig};

/// Read-only view of a token bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketState {
    pub capacity: u64,
    /// Fractional tokens as of the last refill
    pub tokens: f64,
    pub refill_per_second: f64,
    pub last_refill: DateTime<Utc>,
}

struct Bucket {
    capacity: u64,
    tokens: f64,
    refill_per_second: f64,
    /// Epoch millis of the last refill
    last_refill: u64,
}

impl Bucket {
    /// Accrue tokens up to `now`. A clock that steps back accrues nothing
    /// and leaves `last_refill` where it was.
    fn refill(&mut self, now: u64) {
        if now > self.last_refill {
            let elapsed_ms = (now - self.last_refill) as f64;
            self.tokens += elapsed_ms * self.refill_per_second / 1000.0;
            self.last_refill = now;
        }
        self.tokens = self.tokens.min(self.capacity as f64);
    }
}

/// A continuous-refill credit limiter.
///
/// Tokens are a real quantity internally and accrue at `refill_per_second`
/// whenever a decision runs; only the reported count is floored. Each
/// decision consumes one token.
pub struct TokenBucketLimiter {
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Create a full bucket on the system clock.
    pub fn new(capacity: u64, refill_per_second: f64) -> Self {
        Self::with_clock(capacity, refill_per_second, Arc::new(SystemClock))
    }

    /// Create a full bucket reading time from `clock`.
    pub fn with_clock(capacity: u64, refill_per_second: f64, clock: Arc<dyn Clock>) -> Self {
        let refill_per_second = if valid_rate(refill_per_second) {
            refill_per_second
        } else {
            warn!(refill_per_second, "Invalid refill rate, bucket will not refill");
            0.0
        };
        let last_refill = clock.now_millis();
        Self {
            bucket: Mutex::new(Bucket {
                capacity,
                tokens: capacity as f64,
                refill_per_second,
                last_refill,
            }),
            clock,
        }
    }

    /// Decide whether to admit `request_id`, consuming one token.
    pub fn decide(&self, request_id: &str) -> Decision {
        let now = self.clock.now_millis();
        let mut bucket = self.bucket.lock();
        bucket.refill(now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            let remaining = bucket.tokens.floor() as u64;
            return Decision::allowed(request_id, to_datetime(now), Some(remaining));
        }

        debug!(
            request_id = request_id,
            tokens = bucket.tokens,
            "Token bucket empty"
        );
        Decision::rejected(
            request_id,
            to_datetime(now),
            Some(bucket.tokens.floor() as u64),
            Reason::NoTokens,
        )
    }

    /// Snapshot the bucket without refilling it.
    pub fn state(&self) -> TokenBucketState {
        let bucket = self.bucket.lock();
        TokenBucketState {
            capacity: bucket.capacity,
            tokens: bucket.tokens,
            refill_per_second: bucket.refill_per_second,
            last_refill: to_datetime(bucket.last_refill),
        }
    }

    /// Current `(capacity, refill_per_second)`.
    pub fn settings(&self) -> (u64, f64) {
        let bucket = self.bucket.lock();
        (bucket.capacity, bucket.refill_per_second)
    }

    /// Merge `capacity` and `refill_per_second` from `config`.
    ///
    /// A lowered capacity clamps held tokens at the next refill, not here.
    pub fn update_config(&self, config: &LimiterConfig) {
        let mut bucket = self.bucket.lock();
        if let Some(capacity) = config.capacity {
            bucket.capacity = capacity;
        }
        if let Some(rate) = config.refill_per_second.filter(|rate| valid_rate(*rate)) {
            bucket.refill_per_second = rate;
        }
        debug!(
            capacity = bucket.capacity,
            refill_per_second = bucket.refill_per_second,
            "Token bucket config updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::decision::DecisionStatus;

    fn bucket(capacity: u64, rate: f64) -> (TokenBucketLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (TokenBucketLimiter::with_clock(capacity, rate, clock.clone()), clock)
    }

    #[test]
    fn test_burst_drains_then_rejects() {
        let (limiter, _) = bucket(5, 5.0);

        let counts: Vec<_> = (0..5).map(|_| limiter.decide("r").count()).collect();
        assert_eq!(counts, vec![Some(4), Some(3), Some(2), Some(1), Some(0)]);

        let sixth = limiter.decide("r");
        assert_eq!(sixth.status(), DecisionStatus::Rejected);
        assert_eq!(sixth.reason(), Some(Reason::NoTokens));
        assert_eq!(sixth.count(), Some(0));
    }

    #[test]
    fn test_refill_is_fractional() {
        let (limiter, clock) = bucket(2, 5.0);
        limiter.decide("a");
        limiter.decide("b");

        // 100ms at 5/s accrues half a token
        clock.advance(100);
        assert!(!limiter.decide("c").is_allowed());
        assert!((limiter.state().tokens - 0.5).abs() < 1e-9);

        clock.advance(100);
        let decision = limiter.decide("d");
        assert!(decision.is_allowed());
        assert_eq!(decision.count(), Some(0));
    }

    #[test]
    fn test_accrual_is_independent_of_call_frequency() {
        let (frequent, frequent_clock) = bucket(100, 3.0);
        let (rare, rare_clock) = bucket(100, 3.0);
        for _ in 0..50 {
            frequent.decide("r");
            rare.decide("r");
        }

        for _ in 0..10 {
            frequent_clock.advance(130);
            frequent.decide("check");
        }
        rare_clock.advance(1_300);
        for _ in 0..10 {
            rare.decide("check");
        }

        let a = frequent.state().tokens;
        let b = rare.state().tokens;
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_tokens_never_exceed_capacity() {
        let (limiter, clock) = bucket(3, 10.0);
        clock.advance(60_000);
        let decision = limiter.decide("r");
        assert_eq!(decision.count(), Some(2));
        assert!(limiter.state().tokens <= 3.0);
    }

    #[test]
    fn test_lowered_capacity_clamps_lazily() {
        let (limiter, _) = bucket(10, 1.0);
        limiter.update_config(&LimiterConfig::new().with_capacity(4));

        assert_eq!(limiter.state().tokens, 10.0);
        assert_eq!(limiter.decide("r").count(), Some(3));
    }

    #[test]
    fn test_new_rate_applies_from_next_refill() {
        let (limiter, clock) = bucket(10, 1.0);
        for _ in 0..10 {
            limiter.decide("r");
        }

        limiter.update_config(&LimiterConfig::new().with_refill_per_second(20.0));
        clock.advance(100);
        assert_eq!(limiter.decide("r").count(), Some(1));
    }

    #[test]
    fn test_invalid_rate_is_ignored() {
        let (limiter, _) = bucket(10, 1.0);
        limiter.update_config(&LimiterConfig::new().with_refill_per_second(f64::NAN));
        assert_eq!(limiter.settings(), (10, 1.0));
    }

    #[test]
    fn test_clock_stepping_back_accrues_nothing() {
        let (limiter, clock) = bucket(1, 1.0);
        limiter.decide("r");
        clock.set(0);
        assert!(!limiter.decide("r").is_allowed());

        // Returning to the original time must not credit the same span twice
        let (limiter, clock) = bucket(10, 1.0);
        for _ in 0..10 {
            assert!(limiter.decide("r").is_allowed());
        }
        clock.set(990_000);
        assert!(!limiter.decide("r").is_allowed());
        clock.set(1_000_000);
        assert!(!limiter.decide("r").is_allowed());
        assert_eq!(limiter.state().last_refill, to_datetime(1_000_000));

        clock.advance(1_000);
        assert!(limiter.decide("r").is_allowed());
        assert!(!limiter.decide("r").is_allowed());
    }

    #[test]
    fn test_concurrent_decisions_spend_capacity_exactly() {
        let (limiter, _) = bucket(100, 0.0);

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
        assert_eq!(limiter.state().tokens, 0.0);
    }
}
