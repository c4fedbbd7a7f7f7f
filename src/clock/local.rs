//! Local clock abstraction.
//!
//! The rest of the service only needs three things from the platform: a
//! monotonic counter, its nominal frequency, and (optionally) a hardware
//! frequency trim.  Platforms with a slewable oscillator implement
//! [`LocalClock::set_slew`]; everyone else reports
//! [`TimeServiceError::SlewNotSupported`] and the recovery loop falls back
//! to slewing the software transform instead.

use std::time::Instant;

use parking_lot::Mutex;

use crate::{Result, TimeServiceError};

/// Read access to the device's monotonic clock.
pub trait LocalClock: Send + Sync {
    /// Current counter value.  Monotonic and non-decreasing.
    fn now(&self) -> i64;

    /// Counter frequency in Hz.
    fn frequency(&self) -> u64;

    /// Engage a hardware frequency trim, in slew-control counts
    /// (roughly 327.66 counts per ppm).  Fails when the platform has no
    /// trimmable oscillator.
    fn set_slew(&self, counts: i16) -> Result<()>;
}

/// Local clock backed by the OS monotonic clock at 1 GHz.
///
/// No mainstream host exposes a trimmable oscillator to userspace, so
/// `set_slew` always reports software-only operation.
pub struct SystemLocalClock {
    origin: Instant,
}

impl SystemLocalClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemLocalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalClock for SystemLocalClock {
    fn now(&self) -> i64 {
        let nanos = self.origin.elapsed().as_nanos();
        nanos.min(i64::MAX as u128) as i64
    }

    fn frequency(&self) -> u64 {
        1_000_000_000
    }

    fn set_slew(&self, _counts: i16) -> Result<()> {
        Err(TimeServiceError::SlewNotSupported)
    }
}

/// A local clock whose reading is advanced by hand.
///
/// Used by simulations and tests that need deterministic control over the
/// timeline, including exercising the hardware-slew path on hosts without
/// a trimmable oscillator.
pub struct ManualLocalClock {
    inner: Mutex<ManualState>,
    frequency: u64,
    hardware_slew: bool,
}

struct ManualState {
    now: i64,
    last_slew: i16,
}

impl ManualLocalClock {
    pub fn new(frequency: u64, hardware_slew: bool) -> Self {
        Self {
            inner: Mutex::new(ManualState {
                now: 0,
                last_slew: 0,
            }),
            frequency,
            hardware_slew,
        }
    }

    /// Set the absolute counter value.
    pub fn set_now(&self, now: i64) {
        self.inner.lock().now = now;
    }

    /// Advance the counter by `delta` ticks.
    pub fn advance(&self, delta: i64) {
        let mut state = self.inner.lock();
        state.now = state.now.saturating_add(delta);
    }

    /// The most recent slew-control value accepted by `set_slew`.
    pub fn last_slew(&self) -> i16 {
        self.inner.lock().last_slew
    }
}

impl LocalClock for ManualLocalClock {
    fn now(&self) -> i64 {
        self.inner.lock().now
    }

    fn frequency(&self) -> u64 {
        self.frequency
    }

    fn set_slew(&self, counts: i16) -> Result<()> {
        if !self.hardware_slew {
            return Err(TimeServiceError::SlewNotSupported);
        }
        self.inner.lock().last_slew = counts;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemLocalClock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let now = clock.now();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn system_clock_has_no_hardware_slew() {
        let clock = SystemLocalClock::new();
        assert!(matches!(
            clock.set_slew(0),
            Err(TimeServiceError::SlewNotSupported)
        ));
    }

    #[test]
    fn manual_clock_tracks_slew_and_time() {
        let clock = ManualLocalClock::new(1_000_000_000, true);
        clock.set_now(500);
        clock.advance(250);
        assert_eq!(clock.now(), 750);

        clock.set_slew(-1234).unwrap();
        assert_eq!(clock.last_slew(), -1234);

        let fixed = ManualLocalClock::new(1_000_000_000, false);
        assert!(fixed.set_slew(1).is_err());
    }
}
