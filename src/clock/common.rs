//! The common clock: a software timeline derived from the local clock.
//!
//! Common time is defined by a linear transform from local ticks to a
//! 1 MHz timeline shared across the network.  The transform has a basis
//! point (set when sync is first established) and a slope equal to the
//! reduced frequency ratio scaled by the current software slew.  Rewriting
//! the basis whenever the slew changes keeps the resulting piecewise
//! linear function continuous.

use parking_lot::Mutex;

use crate::clock::transform::{reduce, LinearTransform};
use crate::{Result, TimeServiceError};

/// Frequency of the common timeline, in Hz.
pub const COMMON_FREQ: u64 = 1_000_000;

struct CommonClockState {
    cur_slew_ppm: i32,
    freq_numer: u32,
    freq_denom: u32,
    duration_trans: LinearTransform,
    cur_trans: LinearTransform,
    valid: bool,
}

/// Holds the local-to-common transform and its inverse.
///
/// All operations are serialized by an internal lock so that time queries
/// from application threads never contend with the state machine lock.
pub struct CommonClock {
    inner: Mutex<CommonClockState>,
}

impl CommonClock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CommonClockState {
                cur_slew_ppm: 0,
                freq_numer: 1,
                freq_denom: 1,
                duration_trans: LinearTransform::identity(),
                cur_trans: LinearTransform::identity(),
                valid: false,
            }),
        }
    }

    /// Establish the frequency ratio between the local clock and common
    /// time.  Fails when `common / local` cannot be reduced to a ratio of
    /// 32-bit terms.
    pub fn init(&self, local_freq: u64) -> Result<()> {
        let mut state = self.inner.lock();

        if local_freq == 0 {
            return Err(TimeServiceError::ClockInit(
                "local clock frequency is zero".to_string(),
            ));
        }

        let mut numer = COMMON_FREQ;
        let mut denom = local_freq;
        reduce(&mut numer, &mut denom);
        if numer > u32::MAX as u64 || denom > u32::MAX as u64 {
            return Err(TimeServiceError::ClockInit(format!(
                "cannot reduce {COMMON_FREQ}/{local_freq} to 32-bit terms"
            )));
        }

        state.freq_numer = numer as u32;
        state.freq_denom = denom as u32;
        state.duration_trans.numer = numer as i32;
        state.duration_trans.denom = denom as u32;
        state.cur_trans.numer = numer as i32;
        state.cur_trans.denom = denom as u32;
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.inner.lock().valid
    }

    pub fn common_freq(&self) -> u64 {
        COMMON_FREQ
    }

    /// Transform a local clock reading into common time.
    pub fn local_to_common(&self, local: i64) -> Result<i64> {
        let state = self.inner.lock();
        if !state.valid {
            return Err(TimeServiceError::NotSynced);
        }
        state
            .cur_trans
            .forward(local)
            .ok_or(TimeServiceError::Overflow)
    }

    /// Transform a common time value into a local clock reading.
    pub fn common_to_local(&self, common: i64) -> Result<i64> {
        let state = self.inner.lock();
        if !state.valid {
            return Err(TimeServiceError::NotSynced);
        }
        state
            .cur_trans
            .reverse(common)
            .ok_or(TimeServiceError::Overflow)
    }

    /// Convert a local clock duration into common time units using the
    /// nominal frequency ratio (slew excluded).
    pub fn local_duration_to_common_duration(&self, local_dur: i64) -> Result<i64> {
        let state = self.inner.lock();
        state
            .duration_trans
            .forward(local_dur)
            .ok_or(TimeServiceError::Overflow)
    }

    /// Set the basis point and mark common time valid.
    pub fn set_basis(&self, local: i64, common: i64) {
        let mut state = self.inner.lock();
        state.cur_trans.a_zero = local;
        state.cur_trans.b_zero = common;
        state.valid = true;
    }

    /// Invalidate the timeline.  Transforms fail until the next
    /// `set_basis`.
    pub fn reset_basis(&self) {
        let mut state = self.inner.lock();
        state.cur_trans.a_zero = 0;
        state.cur_trans.b_zero = 0;
        state.valid = false;
    }

    /// Change the software slew, rebasing at `change_time` so the mapping
    /// stays continuous.  The new slope is the nominal ratio scaled by
    /// `(10^6 + ppm) / 10^6`, kept in reduced 32-bit terms.
    pub fn set_slew(&self, change_time: i64, ppm: i32) -> Result<()> {
        let mut state = self.inner.lock();

        let (new_local_basis, new_common_basis) = if state.valid {
            let common = state
                .cur_trans
                .forward(change_time)
                .ok_or(TimeServiceError::Overflow)?;
            (change_time, common)
        } else {
            (0, 0)
        };

        state.cur_slew_ppm = ppm;

        let mut n1 = state.freq_numer as u64;
        let mut n2 = (1_000_000i64 + ppm as i64) as u64;
        let mut d1 = state.freq_denom as u64;
        let mut d2 = 1_000_000u64;

        // n1/d1 is already reduced; cross-reduce the remaining pairs.
        reduce(&mut n1, &mut d2);
        reduce(&mut n2, &mut d1);
        reduce(&mut n2, &mut d2);

        let numer = n1
            .checked_mul(n2)
            .filter(|n| *n <= i32::MAX as u64)
            .ok_or(TimeServiceError::Overflow)?;
        let denom = d1
            .checked_mul(d2)
            .filter(|d| *d <= u32::MAX as u64)
            .ok_or(TimeServiceError::Overflow)?;

        state.cur_trans.a_zero = new_local_basis;
        state.cur_trans.b_zero = new_common_basis;
        state.cur_trans.numer = numer as i32;
        state.cur_trans.denom = denom as u32;
        Ok(())
    }
}

impl Default for CommonClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gigahertz_clock() -> CommonClock {
        let clock = CommonClock::new();
        clock.init(1_000_000_000).unwrap();
        clock
    }

    #[test]
    fn transforms_fail_until_basis_is_set() {
        let clock = gigahertz_clock();
        assert!(!clock.is_valid());
        assert!(matches!(
            clock.local_to_common(0),
            Err(TimeServiceError::NotSynced)
        ));
        assert!(matches!(
            clock.common_to_local(0),
            Err(TimeServiceError::NotSynced)
        ));

        clock.set_basis(0, 0);
        assert!(clock.is_valid());
        assert_eq!(clock.local_to_common(0).unwrap(), 0);
    }

    #[test]
    fn init_reduces_frequency_ratio() {
        let clock = gigahertz_clock();
        clock.set_basis(0, 0);
        // 1MHz common over 1GHz local: 1000 local ticks per common tick.
        assert_eq!(clock.local_to_common(1_000_000).unwrap(), 1_000);
        assert_eq!(clock.common_to_local(1_000).unwrap(), 1_000_000);
    }

    #[test]
    fn init_rejects_zero_frequency() {
        let clock = CommonClock::new();
        assert!(clock.init(0).is_err());
    }

    #[test]
    fn basis_offsets_apply() {
        let clock = gigahertz_clock();
        clock.set_basis(5_000_000, 12_345);
        assert_eq!(clock.local_to_common(5_000_000).unwrap(), 12_345);
        assert_eq!(clock.local_to_common(6_000_000).unwrap(), 13_345);
    }

    #[test]
    fn reset_basis_invalidates() {
        let clock = gigahertz_clock();
        clock.set_basis(0, 0);
        clock.reset_basis();
        assert!(!clock.is_valid());
        assert!(clock.local_to_common(0).is_err());
    }

    #[test]
    fn slew_change_is_continuous() {
        let clock = gigahertz_clock();
        clock.set_basis(0, 0);

        let change_time = 10_000_000_000; // 10s of local time
        let before = clock.local_to_common(change_time).unwrap();
        clock.set_slew(change_time, 75).unwrap();
        let after = clock.local_to_common(change_time).unwrap();
        assert!((after - before).abs() <= 1);

        // And again when slewing back the other way.
        let change_time = 20_000_000_000;
        let before = clock.local_to_common(change_time).unwrap();
        clock.set_slew(change_time, -100).unwrap();
        let after = clock.local_to_common(change_time).unwrap();
        assert!((after - before).abs() <= 1);
    }

    #[test]
    fn slew_changes_rate() {
        let clock = gigahertz_clock();
        clock.set_basis(0, 0);
        clock.set_slew(0, 100).unwrap();

        // +100ppm over one local second: 100 extra common-time ticks.
        let one_sec = clock.local_to_common(1_000_000_000).unwrap();
        assert_eq!(one_sec, 1_000_100);
    }

    #[test]
    fn zero_slew_is_idempotent() {
        let clock = gigahertz_clock();
        clock.set_basis(0, 0);

        clock.set_slew(1_000_000, 0).unwrap();
        let probe = clock.local_to_common(2_000_000).unwrap();
        clock.set_slew(1_000_000, 0).unwrap();
        assert_eq!(clock.local_to_common(2_000_000).unwrap(), probe);
    }

    #[test]
    fn common_time_is_monotonic_across_slew_changes() {
        let clock = gigahertz_clock();
        clock.set_basis(0, 0);

        let mut local = 0i64;
        let mut prev = clock.local_to_common(local).unwrap();
        for (i, ppm) in [100, -100, 50, -50, 0, 100].iter().enumerate() {
            local = (i as i64 + 1) * 1_000_000_000;
            clock.set_slew(local, *ppm).unwrap();
            for step in 0..10 {
                let probe = local + step * 100_000_000;
                let now = clock.local_to_common(probe).unwrap();
                assert!(now >= prev - 1, "common time went backwards at {probe}");
                prev = now;
            }
        }
    }

    #[test]
    fn duration_conversion_uses_nominal_rate() {
        let clock = gigahertz_clock();
        clock.set_basis(0, 0);
        clock.set_slew(0, 100).unwrap();

        // Durations ignore slew: exactly 1000 local ns per common us.
        assert_eq!(
            clock.local_duration_to_common_duration(5_000_000).unwrap(),
            5_000
        );
    }
}
