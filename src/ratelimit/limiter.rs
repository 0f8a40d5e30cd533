//! Limiter registry: one instance per algorithm behind a single entry point.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::backend::AdmissionBackend;
use super::clock::{to_datetime, Clock, SystemClock};
use super::decision::{new_request_id, Decision};
use super::distributed::{
    SharedContext, SharedFixedWindow, SharedLeakyBucket, SharedOptions, SharedSlidingWindow,
    SharedTokenBucket,
};
use super::fixed_window::{FixedWindowLimiter, FixedWindowState};
use super::leaky_bucket::{LeakyBucketLimiter, LeakyBucketState};
use super::rules::{Algorithm, LimiterConfig};
use super::sliding_window::{SlidingWindowLimiter, SlidingWindowState};
use super::token_bucket::{TokenBucketLimiter, TokenBucketState};
use crate::config::LimitersConfig;
use crate::sink::DecisionSink;
use crate::store::SharedStore;

/// Client id used when the caller supplies none.
pub const DEFAULT_CLIENT_ID: &str = "demo";

/// Outcome of [`LimiterRegistry::update_config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigUpdate {
    /// The update was merged into the named limiter
    Applied(Algorithm),
    /// No limiter has this name; nothing changed
    UnknownAlgorithm(String),
}

/// Snapshot of one limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LimiterState {
    FixedWindow(FixedWindowState),
    SlidingWindow(SlidingWindowState),
    TokenBucket(TokenBucketState),
    LeakyBucket(LeakyBucketState),
}

/// Snapshot of all four limiters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStates {
    pub fixed_window: FixedWindowState,
    pub sliding_window: SlidingWindowState,
    pub token_bucket: TokenBucketState,
    pub leaky_bucket: LeakyBucketState,
}

struct SharedLimiters {
    ctx: Arc<SharedContext>,
    fixed: SharedFixedWindow,
    sliding: SharedSlidingWindow,
    token: SharedTokenBucket,
    leaky: SharedLeakyBucket,
}

/// Routes decisions to the configured limiters and publishes every result.
///
/// Each decision is published to the sink exactly once: direct results here,
/// leaked leaky bucket admissions by the ticker that produced them.
pub struct LimiterRegistry {
    fixed: Arc<FixedWindowLimiter>,
    sliding: Arc<SlidingWindowLimiter>,
    token: Arc<TokenBucketLimiter>,
    leaky: Arc<LeakyBucketLimiter>,
    shared: Option<SharedLimiters>,
    sink: Arc<dyn DecisionSink>,
    clock: Arc<dyn Clock>,
}

impl LimiterRegistry {
    /// Create a registry of local limiters on the system clock.
    pub fn new(settings: &LimitersConfig, sink: Arc<dyn DecisionSink>) -> Self {
        Self::with_clock(settings, sink, Arc::new(SystemClock))
    }

    /// Create a registry of local limiters reading time from `clock`.
    pub fn with_clock(
        settings: &LimitersConfig,
        sink: Arc<dyn DecisionSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let fixed = &settings.fixed_window;
        let sliding = &settings.sliding_window;
        let token = &settings.token_bucket;
        let leaky = &settings.leaky_bucket;

        let registry = Self {
            fixed: Arc::new(FixedWindowLimiter::with_clock(
                fixed.limit,
                fixed.window_ms,
                clock.clone(),
            )),
            sliding: Arc::new(SlidingWindowLimiter::with_clock(
                sliding.limit,
                sliding.window_ms,
                clock.clone(),
            )),
            token: Arc::new(TokenBucketLimiter::with_clock(
                token.capacity,
                token.refill_per_second,
                clock.clone(),
            )),
            leaky: Arc::new(LeakyBucketLimiter::with_clock(
                leaky.capacity,
                leaky.leak_per_second,
                leaky.max_queue_size,
                clock.clone(),
                sink.clone(),
            )),
            shared: None,
            sink,
            clock,
        };

        info!("Limiter registry initialized");
        registry
    }

    /// Route decisions through `store`, keeping the local limiters as
    /// fallback.
    pub fn with_shared_store(mut self, store: Arc<dyn SharedStore>, options: SharedOptions) -> Self {
        let ctx = Arc::new(SharedContext::with_clock(store, options, self.clock.clone()));
        self.shared = Some(SharedLimiters {
            fixed: SharedFixedWindow::new(ctx.clone(), self.fixed.clone()),
            sliding: SharedSlidingWindow::new(ctx.clone(), self.sliding.clone()),
            token: SharedTokenBucket::new(ctx.clone(), self.token.clone()),
            leaky: SharedLeakyBucket::new(ctx.clone(), self.leaky.clone(), self.sink.clone()),
            ctx,
        });

        info!("Shared store enabled");
        self
    }

    pub fn is_shared(&self) -> bool {
        self.shared.is_some()
    }

    fn backend(&self, algorithm: Algorithm) -> &dyn AdmissionBackend {
        match (&self.shared, algorithm) {
            (Some(shared), Algorithm::FixedWindow) => &shared.fixed,
            (Some(shared), Algorithm::SlidingWindow) => &shared.sliding,
            (Some(shared), Algorithm::TokenBucket) => &shared.token,
            (Some(shared), Algorithm::LeakyBucket) => &shared.leaky,
            (None, Algorithm::FixedWindow) => self.fixed.as_ref(),
            (None, Algorithm::SlidingWindow) => self.sliding.as_ref(),
            (None, Algorithm::TokenBucket) => self.token.as_ref(),
            (None, Algorithm::LeakyBucket) => self.leaky.as_ref(),
        }
    }

    /// Decide on one request and publish the result.
    ///
    /// A missing request id is generated; a missing client id means
    /// [`DEFAULT_CLIENT_ID`].
    pub async fn decide(
        &self,
        algorithm: Algorithm,
        request_id: Option<&str>,
        client_id: Option<&str>,
    ) -> Decision {
        let request_id = request_id.map_or_else(new_request_id, str::to_string);
        let client_id = client_id.unwrap_or(DEFAULT_CLIENT_ID);

        trace!(
            algorithm = %algorithm,
            request_id = %request_id,
            client_id = client_id,
            "Deciding request"
        );

        let decision = self.backend(algorithm).admit(&request_id, client_id).await;
        self.sink.publish(decision.clone());
        decision
    }

    /// Decide on one request for an algorithm given by name.
    ///
    /// Unknown names produce and publish an `ignored` decision.
    pub async fn decide_named(
        &self,
        name: &str,
        request_id: Option<&str>,
        client_id: Option<&str>,
    ) -> Decision {
        match name.parse::<Algorithm>() {
            Ok(algorithm) => self.decide(algorithm, request_id, client_id).await,
            Err(_) => {
                warn!(algorithm = name, "Unknown algorithm, request ignored");
                let request_id = request_id.map_or_else(new_request_id, str::to_string);
                let decision = Decision::ignored(request_id, to_datetime(self.clock.now_millis()));
                self.sink.publish(decision.clone());
                decision
            }
        }
    }

    /// Merge `config` into the limiter named `name`.
    ///
    /// The update takes effect on that limiter's next decision and covers
    /// local and shared mode alike.
    pub fn update_config(&self, name: &str, config: &LimiterConfig) -> ConfigUpdate {
        let Ok(algorithm) = name.parse::<Algorithm>() else {
            warn!(algorithm = name, "Config update for unknown algorithm");
            return ConfigUpdate::UnknownAlgorithm(name.to_string());
        };

        debug!(algorithm = %algorithm, config = ?config, "Applying config update");
        match algorithm {
            Algorithm::FixedWindow => self.fixed.update_config(config),
            Algorithm::SlidingWindow => self.sliding.update_config(config),
            Algorithm::TokenBucket => self.token.update_config(config),
            Algorithm::LeakyBucket => match &self.shared {
                Some(shared) => shared.leaky.update_config(config),
                None => self.leaky.update_config(config),
            },
        }
        ConfigUpdate::Applied(algorithm)
    }

    /// Snapshot one limiter.
    pub fn state(&self, algorithm: Algorithm) -> LimiterState {
        match algorithm {
            Algorithm::FixedWindow => LimiterState::FixedWindow(self.fixed.state()),
            Algorithm::SlidingWindow => LimiterState::SlidingWindow(self.sliding.state()),
            Algorithm::TokenBucket => LimiterState::TokenBucket(self.token.state()),
            Algorithm::LeakyBucket => LimiterState::LeakyBucket(self.leaky.state()),
        }
    }

    /// Snapshot all four limiters.
    pub fn states(&self) -> LimiterStates {
        LimiterStates {
            fixed_window: self.fixed.state(),
            sliding_window: self.sliding.state(),
            token_bucket: self.token.state(),
            leaky_bucket: self.leaky.state(),
        }
    }

    /// Number of decisions answered locally because the shared store failed.
    pub fn fallback_count(&self) -> u64 {
        self.shared
            .as_ref()
            .map_or(0, |shared| shared.ctx.fallback_count())
    }

    /// Stop all leak tickers and drain workers.
    pub fn shutdown(&self) {
        self.leaky.shutdown();
        if let Some(shared) = &self.shared {
            shared.leaky.shutdown();
        }
        info!("Limiter registry shut down");
    }
}
