//! Redis-backed shared store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info};

use super::{
    SharedStore, StoreError, StoreResult, TokenTake, TOKEN_STATE_TTL_MS, WINDOW_CLEANUP_GRACE_MS,
};

/// Refill-then-consume over a `{tokens, last}` hash.
///
/// ARGV: capacity, refill_per_ms, now_ms, requested, ttl_ms.
/// Returns `{allowed, tokens}` with tokens as a string so fractions survive
/// the Lua to Redis integer conversion.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local refill_per_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])

local data = redis.call('HMGET', KEYS[1], 'tokens', 'last')
local tokens = tonumber(data[1]) or capacity
local last = tonumber(data[2]) or now

local elapsed = math.max(0, now - last)
tokens = math.min(capacity, tokens + elapsed * refill_per_ms)

local allowed = 0
if tokens >= requested then
  tokens = tokens - requested
  allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last', math.max(last, now))
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return {allowed, tostring(tokens)}
"#;

/// A [`SharedStore`] on a Redis server.
///
/// The connection manager reconnects on its own; each call clones the handle.
pub struct RedisStore {
    conn: ConnectionManager,
    token_script: Script,
}

impl RedisStore {
    /// Connect to `url`, giving up after `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;

        info!(url = url, "Connected to Redis store");

        Ok(Self {
            conn,
            token_script: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn incr_window(&self, key: &str, window_ms: u64) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let value: u64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        if value == 1 {
            let _: bool = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(window_ms)
                .query_async(&mut conn)
                .await?;
        }
        Ok(value)
    }

    async fn record_in_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        member: &str,
    ) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let min_score = now_ms.saturating_sub(window_ms);

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({}", min_score))
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(window_ms.saturating_add(WINDOW_CLEANUP_GRACE_MS))
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn take_tokens(
        &self,
        key: &str,
        capacity: f64,
        refill_per_ms: f64,
        now_ms: u64,
        requested: f64,
    ) -> StoreResult<TokenTake> {
        let mut conn = self.conn.clone();
        let (allowed, tokens): (i64, String) = self
            .token_script
            .key(key)
            .arg(capacity)
            .arg(refill_per_ms)
            .arg(now_ms)
            .arg(requested)
            .arg(TOKEN_STATE_TTL_MS)
            .invoke_async(&mut conn)
            .await?;

        let tokens = tokens.parse::<f64>().map_err(|_| {
            debug!(key = key, tokens = %tokens, "Unparseable token count from script");
            StoreError::WrongType(key.to_string())
        })?;

        Ok(TokenTake {
            allowed: allowed == 1,
            tokens,
        })
    }

    async fn queue_len(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("LLEN").arg(key).query_async(&mut conn).await?)
    }

    async fn queue_push(&self, key: &str, item: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("RPUSH").arg(key).arg(item).query_async(&mut conn).await?;
        Ok(())
    }

    async fn queue_pop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("LPOP").arg(key).query_async(&mut conn).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let result = RedisStore::connect("not-a-url", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }
}
