//! Shared key-value store used by the cross-process limiter variants.
//!
//! Each operation is the store-side half of one limiter algorithm and must be
//! atomic per key, except for the queue length/push pair used by the leaky
//! bucket, which callers combine into a non-atomic check-then-act.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// How long token bucket state survives without traffic.
pub const TOKEN_STATE_TTL_MS: u64 = 86_400_000;

/// Extra lifetime given to sliding window keys beyond the window itself.
pub const WINDOW_CLEANUP_GRACE_MS: u64 = 1_000;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(#[from] ::redis::RedisError),
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Key {0} holds a value of the wrong type")]
    WrongType(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Outcome of a token bucket consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenTake {
    pub allowed: bool,
    /// Tokens left after the consume
    pub tokens: f64,
}

/// Store operations backing the shared limiter variants.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically increment `key` and return the new value. When the value
    /// becomes 1 the key expires after `window_ms`.
    async fn incr_window(&self, key: &str, window_ms: u64) -> StoreResult<u64>;

    /// In one atomic unit: add `member` scored `now_ms`, drop members scored
    /// below `now_ms - window_ms`, refresh the key expiry, and return the
    /// resulting cardinality.
    async fn record_in_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        member: &str,
    ) -> StoreResult<u64>;

    /// In one atomic unit: read `{tokens, last}` (default `{capacity, now}`),
    /// refill at `refill_per_ms`, consume `requested` if available, write the
    /// pair back and extend the key expiry.
    async fn take_tokens(
        &self,
        key: &str,
        capacity: f64,
        refill_per_ms: f64,
        now_ms: u64,
        requested: f64,
    ) -> StoreResult<TokenTake>;

    /// Length of the list at `key`.
    async fn queue_len(&self, key: &str) -> StoreResult<u64>;

    /// Append `item` to the list at `key`.
    async fn queue_push(&self, key: &str, item: &str) -> StoreResult<()>;

    /// Remove and return the oldest item of the list at `key`.
    async fn queue_pop(&self, key: &str) -> StoreResult<Option<String>>;
}

/// Refill-then-consume arithmetic shared by every store.
pub(crate) fn refill_and_take(
    tokens: f64,
    last: u64,
    capacity: f64,
    refill_per_ms: f64,
    now_ms: u64,
    requested: f64,
) -> TokenTake {
    let elapsed = now_ms.saturating_sub(last) as f64;
    let tokens = (tokens + elapsed * refill_per_ms).min(capacity);
    if tokens >= requested {
        TokenTake {
            allowed: true,
            tokens: tokens - requested,
        }
    } else {
        TokenTake {
            allowed: false,
            tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refill_and_take() {
        let take = refill_and_take(0.0, 0, 5.0, 0.005, 400, 1.0);
        assert!(take.allowed);
        assert!((take.tokens - 1.0).abs() < 1e-9);

        let take = refill_and_take(0.5, 100, 5.0, 0.005, 100, 1.0);
        assert!(!take.allowed);
        assert_eq!(take.tokens, 0.5);
    }

    #[test]
    fn test_refill_clamps_to_capacity() {
        let take = refill_and_take(4.0, 0, 5.0, 1.0, 10_000, 1.0);
        assert_eq!(take.tokens, 4.0);
    }
}
