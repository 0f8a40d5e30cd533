//! Decision log.
//!
//! Every decision, whether returned to a caller or produced later by a leak
//! scheduler, is published here exactly once. The log keeps the most recent
//! entries in publish order for polling and fans each entry out to live
//! subscribers.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::ratelimit::Decision;

/// Default number of decisions retained by a [`DecisionLog`].
pub const DEFAULT_LOG_CAPACITY: usize = 2000;

/// Buffered events per subscriber before it starts lagging.
const SUBSCRIBER_BUFFER: usize = 1024;

/// A consumer of published decisions.
pub trait DecisionSink: Send + Sync {
    /// Publish one decision.
    fn publish(&self, decision: Decision);
}

/// Append-only, size-bounded log of decisions.
pub struct DecisionLog {
    entries: Mutex<VecDeque<Decision>>,
    capacity: usize,
    events: broadcast::Sender<Decision>,
}

impl DecisionLog {
    /// Create a log retaining the most recent `capacity` decisions.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY))),
            capacity,
            events,
        }
    }

    /// Copy of the retained decisions, oldest first.
    pub fn entries(&self) -> Vec<Decision> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Stream of decisions published after this call.
    ///
    /// A subscriber that falls more than the buffer behind receives a lag
    /// error item and resumes from the oldest buffered decision.
    pub fn subscribe(&self) -> BroadcastStream<Decision> {
        BroadcastStream::new(self.events.subscribe())
    }
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl DecisionSink for DecisionLog {
    fn publish(&self, decision: Decision) {
        trace!(
            request_id = decision.request_id(),
            status = ?decision.status(),
            "Publishing decision"
        );

        {
            let mut entries = self.entries.lock();
            entries.push_back(decision.clone());
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }

        // No subscribers is not an error
        let _ = self.events.send(decision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::to_datetime;
    use tokio_stream::StreamExt;

    fn allowed(id: &str) -> Decision {
        Decision::allowed(id, to_datetime(0), None)
    }

    #[test]
    fn test_retains_most_recent() {
        let log = DecisionLog::new(3);
        for id in ["a", "b", "c", "d", "e"] {
            log.publish(allowed(id));
        }

        let ids: Vec<_> = log.entries().iter().map(|d| d.request_id().to_string()).collect();
        assert_eq!(ids, vec!["c", "d", "e"]);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let log = DecisionLog::default();
        log.publish(allowed("a"));
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_publish_order() {
        let log = DecisionLog::default();
        let mut stream = log.subscribe();

        log.publish(allowed("first"));
        log.publish(allowed("second"));

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.request_id(), "first");
        assert_eq!(second.request_id(), "second");
    }
}
