//! The decision value produced by every limiter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    /// The request was admitted
    Allowed,
    /// The request was refused
    Rejected,
    /// The request was deferred to a queue
    Queued,
    /// The request was not evaluated
    Ignored,
}

/// Machine-readable rejection reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// The window already admitted `limit` requests
    LimitExceeded,
    /// The token bucket held less than one token
    NoTokens,
    /// The leaky bucket queue was at its bound
    QueueFull,
}

impl Reason {
    /// The stable code string for this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::LimitExceeded => "limit_exceeded",
            Reason::NoTokens => "no_tokens",
            Reason::QueueFull => "queue_full",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable admission decision for one request.
///
/// `count` carries algorithm-specific occupancy: the window count for the
/// window limiters, the floored remaining tokens for the token bucket, and the
/// queue depth for the leaky bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    request_id: String,
    status: DecisionStatus,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<Reason>,
}

impl Decision {
    fn new(
        request_id: impl Into<String>,
        status: DecisionStatus,
        timestamp: DateTime<Utc>,
        count: Option<u64>,
        reason: Option<Reason>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            timestamp,
            count,
            reason,
        }
    }

    /// An admitted request.
    pub fn allowed(request_id: impl Into<String>, timestamp: DateTime<Utc>, count: Option<u64>) -> Self {
        Self::new(request_id, DecisionStatus::Allowed, timestamp, count, None)
    }

    /// A refused request.
    pub fn rejected(
        request_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        count: Option<u64>,
        reason: Reason,
    ) -> Self {
        Self::new(request_id, DecisionStatus::Rejected, timestamp, count, Some(reason))
    }

    /// A request placed on a queue.
    pub fn queued(request_id: impl Into<String>, timestamp: DateTime<Utc>, count: Option<u64>) -> Self {
        Self::new(request_id, DecisionStatus::Queued, timestamp, count, None)
    }

    /// A request that was not evaluated.
    pub fn ignored(request_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(request_id, DecisionStatus::Ignored, timestamp, None, None)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn status(&self) -> DecisionStatus {
        self.status
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn count(&self) -> Option<u64> {
        self.count
    }

    pub fn reason(&self) -> Option<Reason> {
        self.reason
    }

    /// Whether the request was admitted.
    pub fn is_allowed(&self) -> bool {
        self.status == DecisionStatus::Allowed
    }
}

/// Generate a request id for callers that did not supply one.
pub fn new_request_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("req_{}", &id[..8])
}
