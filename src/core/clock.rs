//! Time source for trial and recorder loops.
//!
//! Every wait the rig performs (quiet-window polling, priming delay, decision
//! polling, ITI, fixed-rate recorders) goes through a [`Clock`]. The
//! [`ManualClock`] makes those loops deterministic in tests: sleeping simply
//! advances virtual time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created.
    fn now(&self) -> Duration;

    fn sleep(&self, d: Duration);

    /// Wall-clock Unix time in seconds, used for log timestamps.
    fn wall_secs(&self) -> f64;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn sleep(&self, d: Duration) {
        (**self).sleep(d)
    }

    fn wall_secs(&self) -> f64 {
        (**self).wall_secs()
    }
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
    wall_origin: f64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: chrono::Utc::now().timestamp_micros() as f64 / 1e6,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, d: Duration) {
        if !d.is_zero() {
            std::thread::sleep(d);
        }
    }

    /// Anchored once at construction and advanced by the monotonic clock, so
    /// a host time correction never moves log timestamps backwards.
    fn wall_secs(&self) -> f64 {
        self.wall_origin + self.origin.elapsed().as_secs_f64()
    }
}

/// Virtual clock. Cloning shares the same timeline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
    epoch_secs: f64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::with_epoch(1_700_000_000.0)
    }

    pub fn with_epoch(epoch_secs: f64) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(0)),
            epoch_secs,
        }
    }

    pub fn advance(&self, d: Duration) {
        self.nanos
            .fetch_add(d.as_nanos().min(u64::MAX as u128) as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    fn sleep(&self, d: Duration) {
        self.advance(d);
    }

    fn wall_secs(&self) -> f64 {
        self.epoch_secs + self.now().as_secs_f64()
    }
}
