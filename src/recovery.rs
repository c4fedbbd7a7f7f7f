//! Clock recovery: turns noisy round-trip measurements into a smooth
//! correction of the local timeline.
//!
//! A velocity-form PI controller (tuned with the "Good Gain" method)
//! produces a parts-per-million correction from the filtered offset
//! between observed and nominal common time.  The correction is applied
//! either as a hardware frequency trim, ramped no faster than full range
//! per 300 ms, or as a software slew of the common clock transform when no
//! trimmable oscillator is available.

use std::sync::Arc;

use log::{error, trace, warn};
use parking_lot::Mutex;

use crate::clock::transform::{reduce, LinearTransform};
use crate::clock::{CommonClock, LocalClock};
use crate::diag::{DiagEvent, DiagSink};
use crate::util::Deadline;

// Controller period (1Hz).
const DT: f32 = 1.0;

// Controller gain.  Larger values converge faster but can oscillate.
const KC: f32 = 1.0;

// Integral reset time.
const TI: f32 = 15.0;

// Output filter time constant, range (0-1).
const TF: f32 = 0.05;

// Low-pass corner for the bias tracker, in Hz.
const BIAS_FC: f32 = 0.01;
const BIAS_RC: f32 = DT / (2.0 * std::f32::consts::PI * BIAS_FC);
const BIAS_ALPHA: f32 = DT / (BIAS_RC + DT);

// Controller output bounds, in ppm offset from center.
const CO_MIN: f32 = -100.0;
const CO_MAX: f32 = 100.0;

// Slew-control counts per ppm of correction (16-bit full scale / 200ppm,
// with a little guard band against fp weirdness).
const SLEW_COUNTS_PER_PPM: f32 = 327.66;

// Data points with an RTT above this (common-time units) are only used
// for control when they are the best of the filter window.
const CONTROL_THRESH: i64 = 10_000;

/// Default panic threshold, in common-time units.
pub const DEFAULT_PANIC_THRESH: i64 = 50_000;

// Outlier-rejection window sizes.
const FILTER_SIZE: usize = 16;
const STARTUP_FILTER_SIZE: usize = 4;

// Minimum milliseconds for a rail-to-rail change of the slew control
// signal.  Some HDMI sinks misbehave when the clock rate moves faster.
const MIN_FULL_RANGE_SLEW_CHANGE_MS: u64 = 300;

// Interval between steps of an ongoing slew ramp.
const SLEW_CHANGE_STEP_PERIOD_MS: u32 = 10;

#[derive(Debug, Clone, Copy, Default)]
struct DisciplineDataPoint {
    local_time: i64,
    observed_common_time: i64,
    nominal_common_time: i64,
    rtt: i64,
}

fn find_min_rtt(points: &[DisciplineDataPoint]) -> usize {
    let mut best = 0;
    for (i, point) in points.iter().enumerate().skip(1) {
        if point.rtt < points[best].rtt {
            best = i;
        }
    }
    best
}

struct RecoveryState {
    last_error_est: Option<i32>,
    last_delta: f32,
    co: f32,
    co_bias: f32,

    tgt_correction: i32,
    cur_correction: i32,
    time_to_cur_slew: LinearTransform,
    slew_change_end: i64,
    next_slew_step: Deadline,

    filter: [DisciplineDataPoint; FILTER_SIZE],
    filter_wr: usize,
    filter_full: bool,

    startup_filter: [DisciplineDataPoint; STARTUP_FILTER_SIZE],
    startup_wr: usize,

    panic_thresh: i64,

    diag: Option<DiagSink>,
}

/// PI discipline loop driving either the local clock trim or the common
/// clock software slew.
pub struct ClockRecoveryLoop {
    local_clock: Arc<dyn LocalClock>,
    common_clock: Arc<CommonClock>,
    local_clock_can_slew: bool,
    state: Mutex<RecoveryState>,
}

impl ClockRecoveryLoop {
    pub fn new(local_clock: Arc<dyn LocalClock>, common_clock: Arc<CommonClock>) -> Self {
        let local_clock_can_slew = local_clock.set_slew(0).is_ok();

        // Precompute the max rate at which the slew control may move:
        // full 16-bit range over no less than 300ms of local time.
        let mut numer = 0x10000u64 * 1000;
        let mut denom = local_clock.frequency() * MIN_FULL_RANGE_SLEW_CHANGE_MS;
        reduce(&mut numer, &mut denom);
        while numer > i32::MAX as u64 || denom > u32::MAX as u64 {
            numer >>= 1;
            denom >>= 1;
            reduce(&mut numer, &mut denom);
        }

        let frequency = local_clock.frequency();
        let this = Self {
            local_clock,
            common_clock,
            local_clock_can_slew,
            state: Mutex::new(RecoveryState {
                last_error_est: None,
                last_delta: 0.0,
                co: 0.0,
                co_bias: 0.0,
                tgt_correction: 0,
                cur_correction: 0,
                time_to_cur_slew: LinearTransform {
                    a_zero: 0,
                    b_zero: 0,
                    numer: numer.max(1) as i32,
                    denom: denom.max(1) as u32,
                },
                slew_change_end: 0,
                next_slew_step: Deadline::new(frequency),
                filter: [DisciplineDataPoint::default(); FILTER_SIZE],
                filter_wr: 0,
                filter_full: false,
                startup_filter: [DisciplineDataPoint::default(); STARTUP_FILTER_SIZE],
                startup_wr: 0,
                panic_thresh: DEFAULT_PANIC_THRESH,
                diag: None,
            }),
        };

        this.reset(true, true);
        this
    }

    /// Whether corrections go to a hardware frequency trim.
    pub fn local_clock_can_slew(&self) -> bool {
        self.local_clock_can_slew
    }

    /// Reset position (the common clock basis and startup filter) and/or
    /// frequency (the controller and slew state).  The main filter window
    /// is always cleared.
    pub fn reset(&self, position: bool, frequency: bool) {
        let mut st = self.state.lock();
        self.reset_locked(&mut st, position, frequency);
    }

    fn reset_locked(&self, st: &mut RecoveryState, position: bool, frequency: bool) {
        if position {
            self.common_clock.reset_basis();
            st.startup_wr = 0;
        }

        if frequency {
            st.last_error_est = None;
            st.last_delta = 0.0;
            st.co = 0.0;
            st.co_bias = 0.0;
            self.set_target_correction_locked(st, 0);
            self.apply_slew_locked(st);
        }

        st.filter_wr = 0;
        st.filter_full = false;
    }

    /// Feed one sync observation into the discipline loop.
    ///
    /// Returns `false` when the observed error exceeds the panic bound;
    /// the caller is expected to reset position and start over.
    pub fn push_discipline_event(
        &self,
        local_time: i64,
        nominal_common_time: i64,
        rtt: i64,
    ) -> bool {
        let mut st = self.state.lock();

        // Before a basis exists, collect a handful of points and derive
        // the basis from the best of them, so a bad first sample does not
        // put the whole timeline off by its asymmetry.
        if !self.common_clock.is_valid() {
            if st.startup_wr < STARTUP_FILTER_SIZE {
                let wr = st.startup_wr;
                st.startup_filter[wr] = DisciplineDataPoint {
                    local_time,
                    observed_common_time: 0,
                    nominal_common_time,
                    rtt,
                };
                st.startup_wr += 1;
            }

            if st.startup_wr == STARTUP_FILTER_SIZE {
                let best = find_min_rtt(&st.startup_filter);
                self.common_clock.set_basis(
                    st.startup_filter[best].local_time,
                    st.startup_filter[best].nominal_common_time,
                );
            }

            return true;
        }

        let observed_common = match self.common_clock.local_to_common(local_time) {
            Ok(value) => value,
            Err(e) => {
                // Validity was just checked; a failure here means the
                // transform itself broke.
                error!("local to common conversion failed mid-discipline: {e}");
                return false;
            }
        };
        let raw_delta = nominal_common_time - observed_common;

        // Best-of-N outlier rejection in the NTP style: data points only
        // drive the controller when they are the lowest-RTT packet in the
        // window or when their RTT is low in absolute terms.
        let wr = st.filter_wr;
        st.filter[wr] = DisciplineDataPoint {
            local_time,
            observed_common_time: observed_common,
            nominal_common_time,
            rtt,
        };
        let current_point = st.filter_wr;
        st.filter_wr = (st.filter_wr + 1) % FILTER_SIZE;
        if st.filter_wr == 0 {
            st.filter_full = true;
        }

        let scan_end = if st.filter_full {
            FILTER_SIZE
        } else {
            st.filter_wr
        };
        let min_rtt = find_min_rtt(&st.filter[..scan_end]);

        let delta_f = if current_point == min_rtt || rtt < CONTROL_THRESH {
            let delta = nominal_common_time - observed_common;

            st.last_error_est = Some(delta.clamp(i32::MIN as i64, i32::MAX as i64) as i32);

            // The measurement of the error can itself be off by as much
            // as the packet RTT, so the panic bound is threshold + rtt:
            // only panic when even the best case sync is out of range.
            let effective_panic_thresh = st.panic_thresh + rtt;
            if delta > effective_panic_thresh || delta < -effective_panic_thresh {
                self.reset_locked(&mut st, false, true);
                return false;
            }

            delta as f32
        } else {
            // No usable packet.  Estimate the trajectory from the last
            // controller output and the tracked bias, so CO decays toward
            // CObias during an extended feedback outage instead of
            // free-running at an arbitrary rate.
            st.last_delta - DT * (st.co - st.co_bias)
        };

        // Velocity form PI control equation.
        let d_co = KC * (1.0 + DT / TI) * delta_f - KC * st.last_delta;
        st.co += d_co * TF;

        st.last_delta = delta_f;

        if st.co < CO_MIN {
            st.co = CO_MIN;
        } else if st.co > CO_MAX {
            st.co = CO_MAX;
        }

        st.co_bias = BIAS_ALPHA * st.co + (1.0 - BIAS_ALPHA) * st.co_bias;

        let tgt_correction = (st.co * SLEW_COUNTS_PER_PPM) as i32;
        self.set_target_correction_locked(&mut st, tgt_correction);

        trace!(
            "clock_loop raw_delta={raw_delta} delta={delta_f} co={} bias={} tgt={tgt_correction}",
            st.co,
            st.co_bias
        );

        if let Some(diag) = &st.diag {
            diag.push(DiagEvent::Discipline {
                local_time,
                observed_common_time: observed_common,
                nominal_common_time,
                correction: tgt_correction,
                rtt,
            });
        }

        true
    }

    /// The most recent usable offset, in common-time units.  `None`
    /// before the first usable point or after a frequency reset.
    pub fn last_error_estimate(&self) -> Option<i32> {
        self.state.lock().last_error_est
    }

    /// Set the panic bound, in common-time units.
    pub fn set_panic_threshold(&self, threshold: i64) {
        self.state.lock().panic_thresh = threshold;
    }

    /// Attach a diagnostic sink that receives discipline events.
    pub fn attach_diag(&self, sink: DiagSink) {
        self.state.lock().diag = Some(sink);
    }

    /// Advance any ongoing slew ramp.  Returns the number of milliseconds
    /// until the next step, or `None` when no step is pending.
    pub fn apply_rate_limited_slew(&self) -> Option<u64> {
        let mut st = self.state.lock();

        let now = self.local_clock.now();
        let mut ret = st.next_slew_step.ms_until(now);
        if ret == Some(0) {
            if self.apply_slew_locked(&mut st) {
                st.next_slew_step.clear();
            }
            ret = st.next_slew_step.ms_until(self.local_clock.now());
        }

        ret
    }

    fn set_target_correction_locked(&self, st: &mut RecoveryState, tgt: i32) {
        // Moving the control signal rail to rail too quickly upsets some
        // HDMI sinks, so target changes start a linear ramp instead of
        // jumping: full range in no less than 300ms.
        if st.tgt_correction == tgt {
            return;
        }

        let now = self.local_clock.now();
        st.tgt_correction = tgt;

        st.time_to_cur_slew.a_zero = now;
        st.time_to_cur_slew.b_zero = st.cur_correction as i64;

        let needs_increase = st.cur_correction < st.tgt_correction;
        let is_increasing = st.time_to_cur_slew.numer > 0;
        if needs_increase != is_increasing {
            st.time_to_cur_slew.numer = -st.time_to_cur_slew.numer;
        }

        st.slew_change_end = st
            .time_to_cur_slew
            .reverse(st.tgt_correction as i64)
            .unwrap_or(now);

        self.apply_slew_locked(st);
    }

    // Returns true when the ramp has reached its target.
    fn apply_slew_locked(&self, st: &mut RecoveryState) -> bool {
        if st.cur_correction == st.tgt_correction {
            return true;
        }

        let mut finished = true;
        if self.local_clock_can_slew {
            let now = self.local_clock.now();

            if now >= st.slew_change_end {
                st.cur_correction = st.tgt_correction;
                st.next_slew_step.clear();
            } else {
                let ramp = st
                    .time_to_cur_slew
                    .forward(now)
                    .unwrap_or(st.tgt_correction as i64);
                st.cur_correction = ramp.clamp(i16::MIN as i64, i16::MAX as i64) as i32;
                st.next_slew_step.set(now, SLEW_CHANGE_STEP_PERIOD_MS);
                finished = false;
            }

            if let Err(e) = self.local_clock.set_slew(st.cur_correction as i16) {
                warn!("hardware slew rejected mid-ramp: {e}");
            }

            if let Some(diag) = &st.diag {
                diag.push(DiagEvent::SlewApplied {
                    local_time: now,
                    correction: st.cur_correction,
                });
            }
        } else {
            // Software slew does not drive external hardware, so the rate
            // limit does not apply; jump straight to the target.
            st.cur_correction = st.tgt_correction;
            st.next_slew_step.clear();

            if let Err(e) = self
                .common_clock
                .set_slew(self.local_clock.now(), st.co as i32)
            {
                warn!("software slew update failed: {e}");
            }
        }

        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualLocalClock;

    fn software_loop() -> (Arc<ManualLocalClock>, Arc<CommonClock>, ClockRecoveryLoop) {
        let local = Arc::new(ManualLocalClock::new(1_000_000_000, false));
        let common = Arc::new(CommonClock::new());
        common.init(local.frequency()).unwrap();
        let recovery = ClockRecoveryLoop::new(local.clone() as Arc<dyn LocalClock>, common.clone());
        (local, common, recovery)
    }

    fn hardware_loop() -> (Arc<ManualLocalClock>, Arc<CommonClock>, ClockRecoveryLoop) {
        let local = Arc::new(ManualLocalClock::new(1_000_000_000, true));
        let common = Arc::new(CommonClock::new());
        common.init(local.frequency()).unwrap();
        let recovery = ClockRecoveryLoop::new(local.clone() as Arc<dyn LocalClock>, common.clone());
        (local, common, recovery)
    }

    const MS: i64 = 1_000_000; // local ticks per millisecond at 1GHz

    #[test]
    fn startup_filter_selects_lowest_rtt_basis() {
        let (_, common, recovery) = software_loop();

        let points = [
            (1_000 * MS, 10_000, 5_000),
            (2_000 * MS, 20_000, 1_500), // best rtt
            (3_000 * MS, 30_000, 8_000),
            (4_000 * MS, 40_000, 2_500),
        ];
        for (local, nominal, rtt) in points.iter().take(3) {
            assert!(recovery.push_discipline_event(*local, *nominal, *rtt));
            assert!(!common.is_valid(), "basis must wait for a full window");
        }
        let (local, nominal, rtt) = points[3];
        assert!(recovery.push_discipline_event(local, nominal, rtt));

        assert!(common.is_valid());
        assert_eq!(common.local_to_common(2_000 * MS).unwrap(), 20_000);
    }

    #[test]
    fn position_reset_discards_partial_startup_window() {
        let (_, common, recovery) = software_loop();

        recovery.push_discipline_event(MS, 1_000, 100);
        recovery.push_discipline_event(2 * MS, 2_000, 100);
        recovery.reset(true, false);
        assert!(!common.is_valid());

        // The window starts over: three more points are not enough.
        recovery.push_discipline_event(3 * MS, 3_000, 100);
        recovery.push_discipline_event(4 * MS, 4_000, 100);
        recovery.push_discipline_event(5 * MS, 5_000, 100);
        assert!(!common.is_valid());
        recovery.push_discipline_event(6 * MS, 6_000, 100);
        assert!(common.is_valid());
    }

    #[test]
    fn usable_event_updates_error_estimate() {
        let (_, common, recovery) = software_loop();
        common.set_basis(0, 0);

        // Observed common at 1s local = 1_000_000; nominal 200us ahead.
        assert!(recovery.push_discipline_event(1_000_000 * 1_000, 1_000_200, 500));
        assert_eq!(recovery.last_error_estimate(), Some(200));
    }

    #[test]
    fn panic_when_error_exceeds_threshold_plus_rtt() {
        let (_, common, recovery) = software_loop();
        common.set_basis(0, 0);

        // 60ms of error against a 50ms threshold with 2ms rtt: panic.
        let result = recovery.push_discipline_event(1_000 * MS, 1_000 * 1_000 + 60_000, 2_000);
        assert!(!result);
        assert_eq!(recovery.last_error_estimate(), None);
        // Position is the caller's to reset.
        assert!(common.is_valid());
    }

    #[test]
    fn error_within_rtt_margin_does_not_panic() {
        let (_, common, recovery) = software_loop();
        common.set_basis(0, 0);

        // 54ms of error but 5ms rtt: inside threshold + rtt.
        assert!(recovery.push_discipline_event(1_000 * MS, 1_000 * 1_000 + 54_000, 5_000));
    }

    #[test]
    fn configurable_panic_threshold() {
        let (_, common, recovery) = software_loop();
        common.set_basis(0, 0);
        recovery.set_panic_threshold(1_000);

        assert!(!recovery.push_discipline_event(1_000 * MS, 1_000 * 1_000 + 5_000, 100));
    }

    #[test]
    fn software_slew_tracks_controller_sign() {
        let (local, common, recovery) = software_loop();
        common.set_basis(0, 0);

        // Persistently positive offsets: the controller must speed the
        // clock up (positive slew), visible as common time running ahead
        // of nominal rate.
        let mut local_now = 0i64;
        for i in 1..=20 {
            local_now = i * 1_000 * MS;
            local.set_now(local_now);
            let nominal = common.local_to_common(local_now).unwrap() + 400;
            assert!(recovery.push_discipline_event(local_now, nominal, 500));
        }

        let probe_base = common.local_to_common(local_now).unwrap();
        let probe_later = common.local_to_common(local_now + 1_000 * MS).unwrap();
        assert!(
            probe_later - probe_base > 1_000_000,
            "positive error must speed up the common clock"
        );
    }

    #[test]
    fn frequency_reset_zeroes_controller() {
        let (local, common, recovery) = software_loop();
        common.set_basis(0, 0);

        for i in 1..=10 {
            let local_now = i * 1_000 * MS;
            local.set_now(local_now);
            let nominal = common.local_to_common(local_now).unwrap() + 400;
            recovery.push_discipline_event(local_now, nominal, 500);
        }
        assert!(recovery.last_error_estimate().is_some());

        recovery.reset(false, true);
        assert_eq!(recovery.last_error_estimate(), None);

        // After the reset the transform must run at nominal rate again.
        let base = common.local_to_common(20_000 * MS).unwrap();
        let later = common.local_to_common(21_000 * MS).unwrap();
        assert_eq!(later - base, 1_000_000);
    }

    #[test]
    fn hardware_slew_ramp_is_rate_limited() {
        let (local, _, recovery) = hardware_loop();
        assert!(recovery.local_clock_can_slew());

        // Drive the target to +full scale and let the ramp finish.
        {
            let mut st = recovery.state.lock();
            recovery.set_target_correction_locked(&mut st, i16::MAX as i32);
        }
        local.set_now(400 * MS);
        assert_eq!(recovery.apply_rate_limited_slew(), None);
        assert_eq!(local.last_slew(), i16::MAX);

        // Now demand full negative scale and watch the ramp.
        {
            let mut st = recovery.state.lock();
            recovery.set_target_correction_locked(&mut st, i16::MIN as i32 + 2);
        }

        let start = local.now();
        let mut prev = local.last_slew();
        let mut reached_at = None;
        for step in 1..=40 {
            local.set_now(start + step * 10 * MS);
            let next = recovery.apply_rate_limited_slew();

            let cur = local.last_slew();
            assert!(cur <= prev, "ramp must move monotonically toward target");
            prev = cur;

            if cur == i16::MIN + 2 {
                reached_at = Some(step * 10);
                break;
            }
            // While ramping, the next step is never further than one step
            // period away.
            let until = next.expect("ramp in progress must schedule a step");
            assert!(until <= 10, "step interval was {until}ms");
        }

        let reached_at = reached_at.expect("ramp never reached its target");
        assert!(
            reached_at >= 300,
            "full range swing finished in {reached_at}ms, rate limit violated"
        );
        assert!(reached_at <= 320, "ramp took too long: {reached_at}ms");
    }

    #[test]
    fn outlier_is_extrapolated_not_tracked() {
        let (local, common, recovery) = software_loop();
        common.set_basis(0, 0);

        // Seed with one good low-rtt point.
        local.set_now(1_000 * MS);
        assert!(recovery.push_discipline_event(1_000 * MS, 1_000_000, 500));

        // A wildly wrong observation with a huge RTT (not the window
        // minimum, above the control threshold) must not register as the
        // current error estimate.
        local.set_now(2_000 * MS);
        assert!(recovery.push_discipline_event(2_000 * MS, 2_030_000, 40_000));
        assert_eq!(recovery.last_error_estimate(), Some(0));
    }
}
