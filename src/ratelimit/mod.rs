//! Admission algorithms, their shared-store variants, and the registry that
//! routes between them.

mod backend;
pub(crate) mod clock;
pub(crate) mod decision;
mod distributed;
mod fixed_window;
mod leaky_bucket;
mod limiter;
mod queue;
mod rules;
mod scheduler;
mod sliding_window;
mod token_bucket;

pub use backend::AdmissionBackend;
pub use clock::{to_datetime, Clock, ManualClock, SystemClock};
pub use decision::{new_request_id, Decision, DecisionStatus, Reason};
pub use distributed::{
    SharedContext, SharedFixedWindow, SharedLeakyBucket, SharedOptions, SharedSlidingWindow,
    SharedTokenBucket, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT,
};
pub use fixed_window::{FixedWindowLimiter, FixedWindowState};
pub use leaky_bucket::{LeakyBucketLimiter, LeakyBucketState, Ticket};
pub use limiter::{ConfigUpdate, LimiterRegistry, LimiterState, LimiterStates, DEFAULT_CLIENT_ID};
pub use queue::BoundedQueue;
pub use rules::{Algorithm, LimiterConfig, MAX_WINDOW_MS};
pub use scheduler::{leak_period, tick_fn, LeakScheduler, TickFn};
pub use sliding_window::{SlidingWindowLimiter, SlidingWindowState};
pub use token_bucket::{TokenBucketLimiter, TokenBucketState};
