//! Injectable time source
//!
//! Every delay and timestamp in the subsystem goes through a [`Clock`] so tests
//! can run on virtual time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

/// Time source and sleeper
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Shared handle to a clock
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by tokio's timer.
///
/// Wall time is derived from tokio's monotonic clock, so a paused tokio runtime
/// (`start_paused = true`) also moves `now()` forward as timers fire.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall_origin: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            wall_origin: Utc::now(),
            origin: tokio::time::Instant::now(),
        }
    }

    /// Shared handle
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_origin + elapsed
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: time only moves when advanced or set.
///
/// `sleep` records the requested duration and stays pending until `advance` or
/// `set` carries the clock past its deadline. Background loops sleeping on a
/// `ManualClock` therefore never move time on their own.
#[derive(Debug)]
pub struct ManualClock {
    now: watch::Sender<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    /// Clock starting at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        let (now, _) = watch::channel(start);
        Self {
            now,
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Clock at 2026-01-15 12:00:00 UTC
    pub fn fixed() -> Self {
        let start = DateTime::parse_from_rfc3339("2026-01-15T12:00:00Z")
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Self::new(start)
    }

    /// Move time forward, waking sleepers whose deadline has passed
    pub fn advance(&self, duration: Duration) {
        let delta = to_chrono(duration);
        self.now.send_modify(|now| *now += delta);
    }

    /// Jump to a point in time
    pub fn set(&self, at: DateTime<Utc>) {
        self.now.send_replace(at);
    }

    /// Every duration passed to `sleep`, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::fixed()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.borrow()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        let mut rx = self.now.subscribe();
        let deadline = *rx.borrow() + to_chrono(duration);
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|now| *now >= deadline).await;
    }
}

/// Virtual clock whose `sleep` moves time forward by the slept duration and
/// returns after a yield.
///
/// Suited to driving a single retry loop through its backoff without a
/// separate task advancing time. Do not share it with background maintenance
/// loops: each of their sleeps would push the clock forward.
#[derive(Debug, Default)]
pub struct AutoAdvanceClock {
    inner: ManualClock,
}

impl AutoAdvanceClock {
    /// Clock starting at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: ManualClock::new(start),
        }
    }

    /// Clock at 2026-01-15 12:00:00 UTC
    pub fn fixed() -> Self {
        Self {
            inner: ManualClock::fixed(),
        }
    }

    /// Move time forward
    pub fn advance(&self, duration: Duration) {
        self.inner.advance(duration);
    }

    /// Every duration passed to `sleep`, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner.sleeps()
    }
}

#[async_trait]
impl Clock for AutoAdvanceClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.inner.sleeps.lock().push(duration);
        self.inner.advance(duration);
        tokio::task::yield_now().await;
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}
