//! Engine time sources.
//!
//! Two distinct notions of time:
//!
//! - [`Clock`]: the logical clock every deadline derives from. It only moves
//!   when the loop's tick entrypoint calls [`Clock::update`]; packet
//!   processing never reads the wall clock.
//! - [`TimeSource`]: monotonic milliseconds used to measure how long the
//!   loop's phases actually took. Injectable so tests can advance it from
//!   inside a handler.

use std::cell::Cell;
use std::time::Instant;

/// Externally advanced monotonic clock in microseconds.
#[derive(Debug, Default)]
pub struct Clock {
    micros: Cell<u64>,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock. Called only from the loop's tick path.
    #[inline]
    pub fn update(&self, micros: u64) {
        self.micros.set(micros);
    }

    #[inline]
    pub fn now_us(&self) -> u64 {
        self.micros.get()
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.micros.get() / 1000
    }

    #[inline]
    pub fn now_sec(&self) -> u64 {
        self.micros.get() / 1_000_000
    }
}

/// Monotonic milliseconds for phase accounting.
pub trait TimeSource {
    fn now_ms(&self) -> u64;
}

/// `TimeSource` over `std::time::Instant`.
pub struct MonotonicTime {
    base: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self { base: Instant::now() }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now_ms(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_units() {
        let clock = Clock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.update(2_500_000);
        assert_eq!(clock.now_us(), 2_500_000);
        assert_eq!(clock.now_ms(), 2500);
        assert_eq!(clock.now_sec(), 2);
    }

    #[test]
    fn monotonic_time_does_not_regress() {
        let t = MonotonicTime::new();
        let a = t.now_ms();
        let b = t.now_ms();
        assert!(b >= a);
    }
}
