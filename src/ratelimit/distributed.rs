//! Shared-store limiter variants.
//!
//! Each variant keeps its state in a [`SharedStore`] so several processes
//! enforce one limit per client. Parameters are read from the wrapped local
//! limiter, so one config update governs both modes, and the local limiter
//! also answers whenever the store fails or is too slow.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, trace, warn};

use super::backend::AdmissionBackend;
use super::clock::{to_datetime, Clock, SystemClock};
use super::decision::{Decision, Reason};
use super::fixed_window::FixedWindowLimiter;
use super::leaky_bucket::LeakyBucketLimiter;
use super::rules::{Algorithm, LimiterConfig};
use super::scheduler::{leak_period, tick_fn, LeakScheduler};
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;
use crate::sink::DecisionSink;
use crate::store::{SharedStore, StoreError, StoreResult};

/// Default key prefix for shared state.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";
/// Default bound on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Options for the shared variants.
#[derive(Debug, Clone)]
pub struct SharedOptions {
    /// Leading segment of every store key
    pub key_prefix: String,
    /// Bound on each store call before falling back
    pub timeout: Duration,
}

impl Default for SharedOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

/// Store handle, key scheme and fallback accounting shared by all variants.
pub struct SharedContext {
    store: Arc<dyn SharedStore>,
    options: SharedOptions,
    clock: Arc<dyn Clock>,
    fallbacks: AtomicU64,
}

impl SharedContext {
    pub fn new(store: Arc<dyn SharedStore>, options: SharedOptions) -> Self {
        Self::with_clock(store, options, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn SharedStore>,
        options: SharedOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            options,
            clock,
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Store key for `algorithm` and `client_id`.
    pub fn key(&self, algorithm: Algorithm, client_id: &str) -> String {
        format!(
            "{}:{}:{}",
            self.options.key_prefix,
            algorithm.key_segment(),
            client_id
        )
    }

    /// Number of calls answered by a local limiter because the store failed.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Run a store call under the timeout.
    async fn bounded<T>(&self, call: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        tokio::time::timeout(self.options.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.options.timeout))?
    }

    /// Run a store call, recording a fallback if it fails.
    async fn attempt<T>(
        &self,
        algorithm: Algorithm,
        key: &str,
        call: impl Future<Output = StoreResult<T>>,
    ) -> Option<T> {
        match self.bounded(call).await {
            Ok(value) => Some(value),
            Err(err) => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    algorithm = %algorithm,
                    key = key,
                    error = %err,
                    "Shared store call failed, using local limiter"
                );
                None
            }
        }
    }
}

/// Sorted-set member for one sliding window admission: `<now>-<6 random
/// alphanumerics>`, unique even when several requests share a millisecond.
fn window_member(now_ms: u64) -> String {
    let tag: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{}-{}", now_ms, tag)
}

/// Fixed window over an expiring counter.
pub struct SharedFixedWindow {
    ctx: Arc<SharedContext>,
    local: Arc<FixedWindowLimiter>,
}

impl SharedFixedWindow {
    pub fn new(ctx: Arc<SharedContext>, local: Arc<FixedWindowLimiter>) -> Self {
        Self { ctx, local }
    }
}

#[async_trait]
impl AdmissionBackend for SharedFixedWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    async fn admit(&self, request_id: &str, client_id: &str) -> Decision {
        let key = self.ctx.key(Algorithm::FixedWindow, client_id);
        let (limit, window_ms) = self.local.settings();

        let call = self.ctx.store.incr_window(&key, window_ms);
        let Some(count) = self.ctx.attempt(Algorithm::FixedWindow, &key, call).await else {
            return self.local.decide(request_id);
        };

        let timestamp = to_datetime(self.ctx.clock.now_millis());
        if count <= limit {
            trace!(key = %key, count = count, "Shared fixed window allowed");
            Decision::allowed(request_id, timestamp, Some(count))
        } else {
            debug!(key = %key, count = count, limit = limit, "Shared fixed window exceeded");
            Decision::rejected(request_id, timestamp, Some(count), Reason::LimitExceeded)
        }
    }
}

/// Sliding log over a scored set.
///
/// The member is recorded before the limit check, so rejected requests also
/// occupy the window.
pub struct SharedSlidingWindow {
    ctx: Arc<SharedContext>,
    local: Arc<SlidingWindowLimiter>,
}

impl SharedSlidingWindow {
    pub fn new(ctx: Arc<SharedContext>, local: Arc<SlidingWindowLimiter>) -> Self {
        Self { ctx, local }
    }
}

#[async_trait]
impl AdmissionBackend for SharedSlidingWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    async fn admit(&self, request_id: &str, client_id: &str) -> Decision {
        let key = self.ctx.key(Algorithm::SlidingWindow, client_id);
        let (limit, window_ms) = self.local.settings();
        let now = self.ctx.clock.now_millis();
        let member = window_member(now);

        let call = self.ctx.store.record_in_window(&key, now, window_ms, &member);
        let Some(count) = self.ctx.attempt(Algorithm::SlidingWindow, &key, call).await else {
            return self.local.decide(request_id);
        };

        if count <= limit {
            Decision::allowed(request_id, to_datetime(now), Some(count))
        } else {
            debug!(key = %key, count = count, limit = limit, "Shared sliding window exceeded");
            Decision::rejected(request_id, to_datetime(now), Some(count), Reason::LimitExceeded)
        }
    }
}

/// Token bucket evaluated atomically by the store.
pub struct SharedTokenBucket {
    ctx: Arc<SharedContext>,
    local: Arc<TokenBucketLimiter>,
}

impl SharedTokenBucket {
    pub fn new(ctx: Arc<SharedContext>, local: Arc<TokenBucketLimiter>) -> Self {
        Self { ctx, local }
    }
}

#[async_trait]
impl AdmissionBackend for SharedTokenBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    async fn admit(&self, request_id: &str, client_id: &str) -> Decision {
        let key = self.ctx.key(Algorithm::TokenBucket, client_id);
        let (capacity, refill_per_second) = self.local.settings();
        let now = self.ctx.clock.now_millis();

        let call = self.ctx.store.take_tokens(
            &key,
            capacity as f64,
            refill_per_second / 1000.0,
            now,
            1.0,
        );
        let Some(take) = self.ctx.attempt(Algorithm::TokenBucket, &key, call).await else {
            return self.local.decide(request_id);
        };

        let count = Some(take.tokens.max(0.0).floor() as u64);
        if take.allowed {
            Decision::allowed(request_id, to_datetime(now), count)
        } else {
            debug!(key = %key, tokens = take.tokens, "Shared token bucket empty");
            Decision::rejected(request_id, to_datetime(now), count, Reason::NoTokens)
        }
    }
}

/// Leaky bucket over a store list, drained by one worker per client key.
///
/// A worker starts when a request is first queued for its key and retires
/// once it finds the queue empty.
pub struct SharedLeakyBucket {
    local: Arc<LeakyBucketLimiter>,
    workers: Arc<DrainWorkers>,
}

/// The drain workers of one shared leaky bucket.
struct DrainWorkers {
    ctx: Arc<SharedContext>,
    local: Arc<LeakyBucketLimiter>,
    sink: Arc<dyn DecisionSink>,
    scheduler: LeakScheduler,
}

impl DrainWorkers {
    fn ensure(self: &Arc<Self>, key: &str) -> bool {
        if self.scheduler.is_running(key) {
            return false;
        }

        let (leak_per_second, _) = self.local.settings();
        let workers = Arc::downgrade(self);
        let queue_key = key.to_string();
        let tick = tick_fn(move || {
            let workers = workers.clone();
            let queue_key = queue_key.clone();
            async move {
                match workers.upgrade() {
                    Some(workers) => workers.drain_one(&queue_key).await,
                    None => ControlFlow::Break(()),
                }
            }
        });

        self.scheduler.start(key, leak_period(leak_per_second), tick)
    }

    async fn drain_one(self: &Arc<Self>, key: &str) -> ControlFlow<()> {
        let ctx = &self.ctx;
        match ctx.bounded(ctx.store.queue_pop(key)).await {
            Ok(Some(request_id)) => {
                trace!(key = key, request_id = %request_id, "Leaked shared request");
                let now = ctx.clock.now_millis();
                self.sink.publish(Decision::allowed(request_id, to_datetime(now), None));
                ControlFlow::Continue(())
            }
            Ok(None) => {
                self.scheduler.retire(key);
                // A push that raced the empty pop saw this worker still
                // registered, so look once more before going idle.
                if let Ok(depth) = ctx.bounded(ctx.store.queue_len(key)).await {
                    if depth > 0 {
                        self.ensure(key);
                    }
                }
                trace!(key = key, "Shared leak queue empty, worker retired");
                ControlFlow::Break(())
            }
            Err(err) => {
                warn!(key = key, error = %err, "Shared leak failed");
                ControlFlow::Continue(())
            }
        }
    }
}

impl SharedLeakyBucket {
    pub fn new(
        ctx: Arc<SharedContext>,
        local: Arc<LeakyBucketLimiter>,
        sink: Arc<dyn DecisionSink>,
    ) -> Self {
        let workers = Arc::new(DrainWorkers {
            ctx,
            local: local.clone(),
            sink,
            scheduler: LeakScheduler::new(),
        });
        Self { local, workers }
    }

    /// Start the drain worker for `key` unless one is running.
    pub fn ensure_worker(&self, key: &str) -> bool {
        self.workers.ensure(key)
    }

    /// Merge `config` into the local bucket and move every worker to the new
    /// leak rate.
    pub fn update_config(&self, config: &LimiterConfig) {
        self.local.update_config(config);
        let (leak_per_second, _) = self.local.settings();
        self.workers.scheduler.reschedule_all(leak_period(leak_per_second));
    }

    /// Number of running drain workers.
    pub fn worker_count(&self) -> usize {
        self.workers.scheduler.len()
    }

    /// Stop every drain worker. Queued entries stay in the store.
    pub fn shutdown(&self) {
        self.workers.scheduler.stop_all();
    }
}

#[async_trait]
impl AdmissionBackend for SharedLeakyBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }

    async fn admit(&self, request_id: &str, client_id: &str) -> Decision {
        let ctx = &self.workers.ctx;
        let key = ctx.key(Algorithm::LeakyBucket, client_id);
        let (_, max_queue_size) = self.local.settings();

        // Length check and push are separate store calls, so concurrent
        // enqueuers can overshoot max_queue_size by their number.
        let call = ctx.store.queue_len(&key);
        let Some(depth) = ctx.attempt(Algorithm::LeakyBucket, &key, call).await else {
            return self.local.enqueue(request_id);
        };

        let timestamp = to_datetime(ctx.clock.now_millis());
        if depth >= max_queue_size as u64 {
            // A full queue left behind by a stopped worker still drains
            self.ensure_worker(&key);
            debug!(key = %key, depth = depth, "Shared leaky bucket queue full");
            return Decision::rejected(request_id, timestamp, Some(depth), Reason::QueueFull);
        }

        let call = ctx.store.queue_push(&key, request_id);
        match ctx.attempt(Algorithm::LeakyBucket, &key, call).await {
            Some(()) => {
                self.ensure_worker(&key);
                Decision::queued(request_id, timestamp, Some(depth + 1))
            }
            None => self.local.enqueue(request_id),
        }
    }
}
