//! Leaky bucket: a bounded queue drained at a fixed rate.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::clock::{to_datetime, Clock, SystemClock};
use super::decision::{Decision, Reason};
use super::queue::BoundedQueue;
use super::rules::{valid_rate, LimiterConfig};
use super::scheduler::{leak_period, tick_fn, LeakScheduler};
use crate::sink::DecisionSink;

/// Scheduler key of the in-process queue.
const LOCAL_QUEUE_KEY: &str = "local";

/// Read-only view of a leaky bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakyBucketState {
    pub capacity: u64,
    pub leak_per_second: f64,
    pub max_queue_size: usize,
    pub queue_size: usize,
}

/// A queued request awaiting admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub request_id: String,
    /// Epoch millis at which the request was queued
    pub enqueued_at: u64,
}

struct Drain {
    /// Advisory; the queue bound is what is enforced
    capacity: u64,
    leak_per_second: f64,
    queue: BoundedQueue<Ticket>,
}

struct LeakyCore {
    drain: Mutex<Drain>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn DecisionSink>,
}

impl LeakyCore {
    fn leak_once(&self) -> Option<Decision> {
        let ticket = self.drain.lock().queue.dequeue()?;
        let now = self.clock.now_millis();

        trace!(
            request_id = %ticket.request_id,
            waited_ms = now.saturating_sub(ticket.enqueued_at),
            "Leaked queued request"
        );

        let decision = Decision::allowed(ticket.request_id, to_datetime(now), None);
        self.sink.publish(decision.clone());
        Some(decision)
    }
}

/// A limiter that defers admission through a FIFO queue.
///
/// [`enqueue`](Self::enqueue) only ever answers `queued` or `rejected`. A
/// ticker owned by the limiter pops one request per period and publishes its
/// `allowed` decision to the sink; callers observe admission only there.
pub struct LeakyBucketLimiter {
    core: Arc<LeakyCore>,
    scheduler: LeakScheduler,
}

impl LeakyBucketLimiter {
    /// Create a leaky bucket on the system clock and start draining it.
    pub fn new(
        capacity: u64,
        leak_per_second: f64,
        max_queue_size: usize,
        sink: Arc<dyn DecisionSink>,
    ) -> Self {
        Self::with_clock(capacity, leak_per_second, max_queue_size, Arc::new(SystemClock), sink)
    }

    /// Create a leaky bucket reading time from `clock` and start draining it.
    ///
    /// Draining needs a tokio runtime; without one the queue only fills until
    /// [`leak_once`](Self::leak_once) is called.
    pub fn with_clock(
        capacity: u64,
        leak_per_second: f64,
        max_queue_size: usize,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn DecisionSink>,
    ) -> Self {
        let leak_per_second = if valid_rate(leak_per_second) {
            leak_per_second
        } else {
            warn!(leak_per_second, "Invalid leak rate, draining at the minimum rate");
            1.0
        };

        let core = Arc::new(LeakyCore {
            drain: Mutex::new(Drain {
                capacity,
                leak_per_second,
                queue: BoundedQueue::new(max_queue_size),
            }),
            clock,
            sink,
        });

        let limiter = Self {
            core,
            scheduler: LeakScheduler::new(),
        };
        limiter.start();
        limiter
    }

    /// Queue `request_id` for admission.
    pub fn enqueue(&self, request_id: &str) -> Decision {
        let now = self.core.clock.now_millis();
        let mut drain = self.core.drain.lock();

        let ticket = Ticket {
            request_id: request_id.to_string(),
            enqueued_at: now,
        };
        if drain.queue.enqueue(ticket) {
            return Decision::queued(request_id, to_datetime(now), Some(drain.queue.len() as u64));
        }

        debug!(
            request_id = request_id,
            queue_size = drain.queue.len(),
            max_queue_size = drain.queue.max_size(),
            "Leaky bucket queue full"
        );
        Decision::rejected(
            request_id,
            to_datetime(now),
            Some(drain.queue.len() as u64),
            Reason::QueueFull,
        )
    }

    /// Admit the oldest queued request, if any, publishing its decision.
    pub fn leak_once(&self) -> Option<Decision> {
        self.core.leak_once()
    }

    /// Snapshot the bucket.
    pub fn state(&self) -> LeakyBucketState {
        let drain = self.core.drain.lock();
        LeakyBucketState {
            capacity: drain.capacity,
            leak_per_second: drain.leak_per_second,
            max_queue_size: drain.queue.max_size(),
            queue_size: drain.queue.len(),
        }
    }

    /// Current `(leak_per_second, max_queue_size)`.
    pub fn settings(&self) -> (f64, usize) {
        let drain = self.core.drain.lock();
        (drain.leak_per_second, drain.queue.max_size())
    }

    /// Merge `capacity`, `leak_per_second` and `max_queue_size` from `config`.
    ///
    /// A new leak rate replaces the running ticker; a stopped bucket stays
    /// stopped.
    pub fn update_config(&self, config: &LimiterConfig) {
        let period = {
            let mut drain = self.core.drain.lock();
            if let Some(capacity) = config.capacity {
                drain.capacity = capacity;
            }
            if let Some(rate) = config.leak_per_second.filter(|rate| valid_rate(*rate)) {
                drain.leak_per_second = rate;
            }
            if let Some(max_queue_size) = config.max_queue_size {
                drain.queue.set_max_size(max_queue_size);
            }
            debug!(
                capacity = drain.capacity,
                leak_per_second = drain.leak_per_second,
                max_queue_size = drain.queue.max_size(),
                "Leaky bucket config updated"
            );
            leak_period(drain.leak_per_second)
        };

        self.scheduler.reschedule(LOCAL_QUEUE_KEY, period);
    }

    /// Period of the running ticker, if draining.
    pub fn tick_period(&self) -> Option<Duration> {
        self.scheduler.period(LOCAL_QUEUE_KEY)
    }

    pub fn is_leaking(&self) -> bool {
        self.scheduler.is_running(LOCAL_QUEUE_KEY)
    }

    /// Stop draining. Queued requests stay queued.
    pub fn shutdown(&self) {
        self.scheduler.stop(LOCAL_QUEUE_KEY);
    }

    /// Start draining at the configured rate.
    ///
    /// Returns `false` if already draining or no tokio runtime is available.
    pub fn start(&self) -> bool {
        let period = leak_period(self.core.drain.lock().leak_per_second);
        let core = self.core.clone();
        let tick = tick_fn(move || {
            core.leak_once();
            std::future::ready(ControlFlow::Continue(()))
        });
        self.scheduler.start(LOCAL_QUEUE_KEY, period, tick)
    }
}
