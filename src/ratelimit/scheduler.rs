//! Keyed, cancelable recurring tickers for draining leaky bucket queues.

use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

type TickFuture = Pin<Box<dyn Future<Output = ControlFlow<()>> + Send>>;

/// One unit of work run on every tick. Returning `Break` ends the ticker.
pub type TickFn = Arc<dyn Fn() -> TickFuture + Send + Sync>;

/// Wrap an async closure as a [`TickFn`].
pub fn tick_fn<F, Fut>(f: F) -> TickFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ControlFlow<()>> + Send + 'static,
{
    Arc::new(move || -> TickFuture { Box::pin(f()) })
}

/// Tick period for a leak rate: `1000 / max(1, leak_per_second)` ms.
pub fn leak_period(leak_per_second: f64) -> Duration {
    let rate = if leak_per_second.is_finite() {
        leak_per_second.max(1.0)
    } else {
        1.0
    };
    Duration::from_micros((1_000_000.0 / rate).round() as u64)
}

struct Ticker {
    period: Duration,
    tick: TickFn,
    handle: JoinHandle<()>,
}

/// Owns at most one ticker per queue key.
///
/// Starting a key that already has a ticker is a no-op, and changing a
/// ticker's period replaces the task rather than adding a second one.
/// Tickers are aborted on [`stop`](Self::stop) and when the scheduler drops.
#[derive(Default)]
pub struct LeakScheduler {
    tickers: DashMap<String, Ticker>,
}

impl LeakScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start ticking `key` every `period`.
    ///
    /// Returns `false` if `key` already has a ticker or no tokio runtime is
    /// available.
    pub fn start(&self, key: &str, period: Duration, tick: TickFn) -> bool {
        match self.tickers.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => match spawn_ticker(key, period, tick.clone()) {
                Some(handle) => {
                    debug!(key = key, period_ms = period.as_millis() as u64, "Started leak ticker");
                    vacant.insert(Ticker { period, tick, handle });
                    true
                }
                None => false,
            },
        }
    }

    /// Replace the ticker for `key` with one running every `period`.
    ///
    /// Returns `false` if `key` has no ticker or already runs at `period`.
    pub fn reschedule(&self, key: &str, period: Duration) -> bool {
        let Some(mut ticker) = self.tickers.get_mut(key) else {
            return false;
        };
        if ticker.period == period {
            return false;
        }

        ticker.handle.abort();
        match spawn_ticker(key, period, ticker.tick.clone()) {
            Some(handle) => {
                debug!(key = key, period_ms = period.as_millis() as u64, "Rescheduled leak ticker");
                ticker.handle = handle;
                ticker.period = period;
                true
            }
            None => {
                drop(ticker);
                self.tickers.remove(key);
                false
            }
        }
    }

    /// Reschedule every ticker to `period`.
    pub fn reschedule_all(&self, period: Duration) {
        let keys: Vec<String> = self.tickers.iter().map(|t| t.key().clone()).collect();
        for key in keys {
            self.reschedule(&key, period);
        }
    }

    /// Cancel the ticker for `key`.
    pub fn stop(&self, key: &str) -> bool {
        match self.tickers.remove(key) {
            Some((_, ticker)) => {
                ticker.handle.abort();
                debug!(key = key, "Stopped leak ticker");
                true
            }
            None => false,
        }
    }

    /// Forget the ticker for `key` without aborting it.
    ///
    /// Called by a tick that is about to return `Break`, so the key can be
    /// started again while the finishing task winds down.
    pub fn retire(&self, key: &str) -> bool {
        let retired = self.tickers.remove(key).is_some();
        if retired {
            debug!(key = key, "Retired leak ticker");
        }
        retired
    }

    /// Cancel every ticker.
    pub fn stop_all(&self) {
        self.tickers.retain(|_, ticker| {
            ticker.handle.abort();
            false
        });
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.tickers.contains_key(key)
    }

    /// The period `key` currently ticks at.
    pub fn period(&self, key: &str) -> Option<Duration> {
        self.tickers.get(key).map(|ticker| ticker.period)
    }

    /// Number of live tickers.
    pub fn len(&self) -> usize {
        self.tickers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty()
    }
}

impl Drop for LeakScheduler {
    fn drop(&mut self) {
        for ticker in self.tickers.iter() {
            ticker.handle.abort();
        }
    }
}

fn spawn_ticker(key: &str, period: Duration, tick: TickFn) -> Option<JoinHandle<()>> {
    let Ok(runtime) = Handle::try_current() else {
        warn!(key = key, "No async runtime, leak ticker not started");
        return None;
    };

    Some(runtime.spawn(async move {
        // First tick one period after start, like a plain interval timer
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if (tick)().await.is_break() {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_tick() -> (TickFn, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let tick = tick_fn(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            }
        });
        (tick, ticks)
    }

    #[test]
    fn test_leak_period() {
        assert_eq!(leak_period(5.0), Duration::from_millis(200));
        assert_eq!(leak_period(1.0), Duration::from_secs(1));
        assert_eq!(leak_period(0.0), Duration::from_secs(1));
        assert_eq!(leak_period(0.25), Duration::from_secs(1));
        assert_eq!(leak_period(f64::INFINITY), Duration::from_secs(1));
    }

    #[test]
    fn test_start_without_runtime_idles() {
        let scheduler = LeakScheduler::new();
        let (tick, _) = counting_tick();
        assert!(!scheduler.start("q", Duration::from_millis(10), tick));
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_at_period() {
        let scheduler = LeakScheduler::new();
        let (tick, ticks) = counting_tick();
        assert!(scheduler.start("q", Duration::from_millis(100), tick));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_per_key() {
        let scheduler = LeakScheduler::new();
        let (tick, ticks) = counting_tick();

        assert!(scheduler.start("q", Duration::from_millis(100), tick.clone()));
        assert!(!scheduler.start("q", Duration::from_millis(100), tick.clone()));
        assert!(scheduler.start("other", Duration::from_millis(100), tick));
        assert_eq!(scheduler.len(), 2);

        tokio::time::sleep(Duration::from_millis(350)).await;
        // Two keys, three ticks each
        assert_eq!(ticks.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_ticker() {
        let scheduler = LeakScheduler::new();
        let (tick, ticks) = counting_tick();
        scheduler.start("q", Duration::from_millis(100), tick);

        assert!(!scheduler.reschedule("q", Duration::from_millis(100)));
        assert!(scheduler.reschedule("q", Duration::from_millis(250)));
        assert_eq!(scheduler.period("q"), Some(Duration::from_millis(250)));
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_millis(1_010)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels() {
        let scheduler = LeakScheduler::new();
        let (tick, ticks) = counting_tick();
        scheduler.start("q", Duration::from_millis(100), tick);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(scheduler.stop("q"));
        assert!(!scheduler.stop("q"));

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_running("q"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_all() {
        let (tick, ticks) = counting_tick();
        {
            let scheduler = LeakScheduler::new();
            scheduler.start("a", Duration::from_millis(100), tick.clone());
            scheduler.start("b", Duration::from_millis(100), tick);
        }

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_break_ends_ticker_after_retire() {
        let scheduler = Arc::new(LeakScheduler::new());
        let ticks = Arc::new(AtomicUsize::new(0));

        let owner = Arc::downgrade(&scheduler);
        let counter = ticks.clone();
        let tick = tick_fn(move || {
            let owner = owner.clone();
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 < 3 {
                    return ControlFlow::Continue(());
                }
                if let Some(scheduler) = owner.upgrade() {
                    scheduler.retire("q");
                }
                ControlFlow::Break(())
            }
        });
        assert!(scheduler.start("q", Duration::from_millis(100), tick));

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_running("q"));
        assert!(!scheduler.retire("q"));
    }
}
