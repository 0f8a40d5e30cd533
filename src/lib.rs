//! Ratelab - Admission Control Core
//!
//! This crate implements four classic rate limiting strategies (fixed window,
//! sliding window, token bucket and leaky bucket) behind one registry, with
//! optional shared-store variants so several processes enforce one limit.
//! Every decision is published to a bounded decision log.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod sink;
pub mod store;
