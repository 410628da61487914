//! Time sources.
//!
//! The ledger needs two clocks that must never be mixed: wall-clock unix
//! seconds stamped into transactions and headers, and a monotonic
//! millisecond counter used only for "how long since" questions. The counter
//! is a wrapping `u32` like a microcontroller tick register; intervals are
//! computed with wrapping subtraction so a wrap between two readings is
//! harmless as long as the interval itself is shorter than ~49 days.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A reading of the monotonic millisecond counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Ticks(pub u32);

impl Ticks {
    pub fn elapsed_since(self, earlier: Ticks) -> Duration {
        Duration::from_millis(u64::from(self.0.wrapping_sub(earlier.0)))
    }
}

pub trait Clock: Send {
    /// Wall-clock time in unix seconds.
    fn unix_time(&self) -> u64;

    /// Monotonic wrapping millisecond counter.
    fn ticks(&self) -> Ticks;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn unix_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }

    fn ticks(&self) -> Ticks {
        // truncation is the wrap
        Ticks(self.origin.elapsed().as_millis() as u32)
    }
}

/// Hand-driven clock for tests and simulations. Clones share state, so a
/// test can keep one handle while the ledger owns another.
#[derive(Clone, Debug)]
pub struct ManualClock {
    unix: Arc<AtomicU64>,
    ticks: Arc<AtomicU32>,
}

impl ManualClock {
    pub fn new(unix_time: u64) -> Self {
        Self {
            unix: Arc::new(AtomicU64::new(unix_time)),
            ticks: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Move both clocks forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.unix.fetch_add(by.as_secs(), Ordering::SeqCst);
        let ms = by.as_millis() as u32;
        // fetch_add on atomics wraps
        self.ticks.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set_ticks(&self, ticks: u32) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn unix_time(&self) -> u64 {
        self.unix.load(Ordering::SeqCst)
    }

    fn ticks(&self) -> Ticks {
        Ticks(self.ticks.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_survives_wraparound() {
        let before = Ticks(u32::MAX - 499);
        let after = Ticks(500);
        assert_eq!(after.elapsed_since(before), Duration::from_millis(1000));
    }

    #[test]
    fn manual_clock_advances_both_sources() {
        let clock = ManualClock::new(1_700_000_000);
        let handle = clock.clone();
        let t0 = clock.ticks();
        handle.advance(Duration::from_secs(90));
        assert_eq!(clock.unix_time(), 1_700_000_090);
        assert_eq!(clock.ticks().elapsed_since(t0), Duration::from_secs(90));
    }

    #[test]
    fn manual_ticks_wrap() {
        let clock = ManualClock::new(0);
        clock.set_ticks(u32::MAX - 9);
        let t0 = clock.ticks();
        clock.advance(Duration::from_millis(20));
        assert_eq!(clock.ticks(), Ticks(10));
        assert_eq!(clock.ticks().elapsed_since(t0), Duration::from_millis(20));
    }

    #[test]
    fn system_clock_is_sane() {
        let clock = SystemClock::new();
        assert!(clock.unix_time() > 1_600_000_000);
        let t0 = clock.ticks();
        assert!(clock.ticks().elapsed_since(t0) < Duration::from_secs(60));
    }
}
