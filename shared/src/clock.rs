//! Wall-clock abstraction.
//!
//! Drift rates are computed from wall-clock intervals, so the time source is
//! injected rather than read ambiently. Simulations and tests drive a
//! [`ManualClock`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of the current UTC time
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    origin: DateTime<Utc>,
    /// Microseconds elapsed since `origin`
    offset_us: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at `origin`
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            offset_us: AtomicI64::new(0),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let micros = i64::try_from(by.as_micros()).unwrap_or(i64::MAX);
        self.offset_us.fetch_add(micros, Ordering::SeqCst);
    }

    /// Move the clock forward by fractional seconds
    pub fn advance_secs(&self, secs: f64) {
        self.advance(Duration::from_secs_f64(secs.max(0.0)));
    }

    /// Time elapsed since the clock was created
    pub fn elapsed(&self) -> Duration {
        let micros = self.offset_us.load(Ordering::SeqCst).max(0);
        Duration::from_micros(micros as u64)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.origin + ChronoDuration::microseconds(self.offset_us.load(Ordering::SeqCst))
    }
}
