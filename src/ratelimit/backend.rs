//! Admission trait for abstracting local and shared-store implementations.

use async_trait::async_trait;

use super::decision::Decision;
use super::fixed_window::FixedWindowLimiter;
use super::leaky_bucket::LeakyBucketLimiter;
use super::rules::Algorithm;
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;

/// Trait for admission engines.
///
/// This trait abstracts over the in-process limiters and their shared-store
/// variants so the registry can route to either. Local limiters ignore the
/// client id; shared variants key their store state by it.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// The algorithm this backend implements.
    fn algorithm(&self) -> Algorithm;

    /// Decide on one request.
    async fn admit(&self, request_id: &str, client_id: &str) -> Decision;
}

#[async_trait]
impl AdmissionBackend for FixedWindowLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    async fn admit(&self, request_id: &str, _client_id: &str) -> Decision {
        self.decide(request_id)
    }
}

#[async_trait]
impl AdmissionBackend for SlidingWindowLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    async fn admit(&self, request_id: &str, _client_id: &str) -> Decision {
        self.decide(request_id)
    }
}

#[async_trait]
impl AdmissionBackend for TokenBucketLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    async fn admit(&self, request_id: &str, _client_id: &str) -> Decision {
        self.decide(request_id)
    }
}

#[async_trait]
impl AdmissionBackend for LeakyBucketLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }

    async fn admit(&self, request_id: &str, _client_id: &str) -> Decision {
        self.enqueue(request_id)
    }
}
