//! Limiter configuration records and algorithm identifiers.
//!
//! [`LimiterConfig`] is the sparse update applied to a running limiter. Only
//! the fields a given algorithm understands are consulted; everything else is
//! ignored. Parsing from JSON is lenient: a malformed field is dropped with a
//! warning and the limiter keeps its previous value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// The four supported admission algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

impl Algorithm {
    /// All algorithms, in display order.
    pub const ALL: [Algorithm; 4] = [
        Algorithm::FixedWindow,
        Algorithm::SlidingWindow,
        Algorithm::TokenBucket,
        Algorithm::LeakyBucket,
    ];

    /// The wire identifier, e.g. `token-bucket`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed-window",
            Algorithm::SlidingWindow => "sliding-window",
            Algorithm::TokenBucket => "token-bucket",
            Algorithm::LeakyBucket => "leaky-bucket",
        }
    }

    /// Short name used in shared store keys.
    pub fn key_segment(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed",
            Algorithm::SlidingWindow => "sliding",
            Algorithm::TokenBucket => "token",
            Algorithm::LeakyBucket => "leaky",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str() == s)
            .ok_or_else(|| format!("unknown algorithm: {}", s))
    }
}

/// A partial limiter configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterConfig {
    /// Requests per window (fixed and sliding window)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Window length in milliseconds (fixed and sliding window)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
    /// Bucket capacity (token bucket, advisory for leaky bucket)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
    /// Tokens added per second (token bucket)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_per_second: Option<f64>,
    /// Queue entries drained per second (leaky bucket)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leak_per_second: Option<f64>,
    /// Queue bound (leaky bucket)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,
}

impl LimiterConfig {
    /// Create an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = Some(window_ms);
        self
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_refill_per_second(mut self, rate: f64) -> Self {
        self.refill_per_second = Some(rate);
        self
    }

    pub fn with_leak_per_second(mut self, rate: f64) -> Self {
        self.leak_per_second = Some(rate);
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Parse an update from loosely-typed JSON.
    ///
    /// Fields must be finite, non-negative numbers, and `windowMs` must also
    /// fall within `1..=MAX_WINDOW_MS`. Anything else is skipped. Integer
    /// fields truncate fractional input.
    pub fn from_json(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            warn!(value = %value, "Ignoring non-object limiter config");
            return Self::default();
        };

        Self {
            limit: number_field(object, "limit").map(|n| n as u64),
            window_ms: number_field(object, "windowMs")
                .map(|n| n as u64)
                .filter(|ms| {
                    let valid = valid_window(*ms);
                    if !valid {
                        warn!(window_ms = *ms, "Ignoring out of range windowMs");
                    }
                    valid
                }),
            capacity: number_field(object, "capacity").map(|n| n as u64),
            refill_per_second: number_field(object, "refillPerSecond"),
            leak_per_second: number_field(object, "leakPerSecond"),
            max_queue_size: number_field(object, "maxQueueSize").map(|n| n as usize),
        }
    }
}

fn number_field(object: &serde_json::Map<String, Value>, name: &str) -> Option<f64> {
    let value = object.get(name)?;
    match value.as_f64() {
        Some(n) if n.is_finite() && n >= 0.0 => Some(n),
        _ => {
            warn!(field = name, value = %value, "Ignoring malformed limiter config field");
            None
        }
    }
}

/// Longest accepted window: one day.
pub const MAX_WINDOW_MS: u64 = 86_400_000;

/// Whether a window length is usable: positive and at most [`MAX_WINDOW_MS`].
pub(crate) fn valid_window(window_ms: u64) -> bool {
    (1..=MAX_WINDOW_MS).contains(&window_ms)
}

/// Whether a rate is usable as a refill or leak rate.
pub(crate) fn valid_rate(rate: f64) -> bool {
    rate.is_finite() && rate >= 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_algorithm_round_trips_through_str() {
        for algorithm in Algorithm::ALL {
            assert_eq!(algorithm.as_str().parse::<Algorithm>(), Ok(algorithm));
        }
        assert!("bucket".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_from_json_reads_known_fields() {
        let config = LimiterConfig::from_json(&json!({
            "limit": 3,
            "windowMs": 500,
            "refillPerSecond": 2.5,
            "maxQueueSize": 10,
        }));

        assert_eq!(config.limit, Some(3));
        assert_eq!(config.window_ms, Some(500));
        assert_eq!(config.refill_per_second, Some(2.5));
        assert_eq!(config.max_queue_size, Some(10));
        assert_eq!(config.capacity, None);
        assert_eq!(config.leak_per_second, None);
    }

    #[test]
    fn test_from_json_ignores_malformed_fields() {
        let config = LimiterConfig::from_json(&json!({
            "limit": "ten",
            "windowMs": -5,
            "capacity": null,
            "leakPerSecond": 4,
            "unknown": 1,
        }));

        assert_eq!(config, LimiterConfig::new().with_leak_per_second(4.0));
    }

    #[test]
    fn test_from_json_drops_out_of_range_windows() {
        assert_eq!(LimiterConfig::from_json(&json!({"windowMs": 0})).window_ms, None);
        assert_eq!(LimiterConfig::from_json(&json!({"windowMs": 1e20})).window_ms, None);
        assert_eq!(
            LimiterConfig::from_json(&json!({"windowMs": 86_400_000})).window_ms,
            Some(MAX_WINDOW_MS)
        );
    }

    #[test]
    fn test_from_json_non_object_is_empty() {
        assert!(LimiterConfig::from_json(&json!([1, 2, 3])).is_empty());
        assert!(LimiterConfig::from_json(&json!("limit")).is_empty());
    }

    #[test]
    fn test_deserialize_camel_case() {
        let config: LimiterConfig = serde_json::from_str(r#"{"leakPerSecond": 2}"#).unwrap();
        assert_eq!(config.leak_per_second, Some(2.0));
    }
}
