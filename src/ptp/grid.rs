// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Synthetic gPTP clock sampled once per scheduler tick
//!
//! The gPTP clock can only be read at tick boundaries and the reading jitters
//! by tens of microseconds. The grid advances its own clock by an estimated
//! tick period instead. The phase error of every tick is accumulated, and
//! every [`SCALING_FACTOR`] ticks its mean over the window is fed to a PI
//! controller that yields the period for the next window with a resolution of
//! 1/[`SCALING_FACTOR`] ns. The fractional nanoseconds are spread evenly over
//! the window, Bresenham style.
//!
//! ```
//! use netqos::ptp::{GridConfig, PtpGrid};
//!
//! let mut grid = PtpGrid::new(GridConfig::default());
//! assert!(grid.update(1_000_000)); // first sample always resets
//! assert!(!grid.update(1_125_000));
//! assert_eq!(grid.now(), 1_125_000);
//! assert_eq!(grid.stats().resets, 1);
//! ```
#![allow(clippy::as_conversions)] // modulo 2^32 clock arithmetic

use crate::pi::{Pi, PiGains};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Ticks per controller window, also the sub-nanosecond resolution
pub const SCALING_FACTOR: u32 = 1024;

/// Largest tolerated deviation of a sampled tick from the nominal period
pub const PTP_MAX_ERROR_NS: u32 = 50_000;

/// Largest tolerated deviation of the estimated period from the nominal period
pub const PI_MAX_ERROR_NS: u32 = 1000;

/// Default scheduler tick
pub const DEFAULT_PERIOD_NS: u32 = 125_000;

/// Parameters of a grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GridConfig {
    /// Nominal tick period in nanoseconds
    pub period_ns: u32,

    /// Controller gains
    pub gains: PiGains,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            period_ns: DEFAULT_PERIOD_NS,
            gains: PiGains::default(),
        }
    }
}

/// Snapshot of the grid for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GridStats {
    /// Synthetic time of the last tick
    pub now: u32,

    /// Estimated period, integer part
    pub period: u32,

    /// Estimated period, fractional part in 1/1024 ns
    pub period_frac: u32,

    /// Number of resets
    pub resets: u32,

    /// Samples since the last reset
    pub total: u64,

    /// Last mean phase error fed to the controller
    pub err: i32,
}

/// PI disciplined synthetic clock
#[derive(Debug, Clone)]
pub struct PtpGrid {
    nominal: u32,
    now: u32,
    last: u32,
    ptp_last: u32,
    count: u32,
    total: u64,
    period: u32,
    period_frac: u32,
    period_frac_cur: u32,
    d: i32,
    phase_sum: i64,
    resets: u32,
    pi: Pi,
    reset_requested: bool,
}

impl PtpGrid {
    /// Creates a grid that will reset on its first sample
    #[must_use]
    pub fn new(config: GridConfig) -> Self {
        let nominal = config.period_ns;
        Self {
            nominal,
            now: 0,
            last: 0,
            ptp_last: 0,
            count: 0,
            total: 0,
            period: nominal,
            period_frac: 0,
            period_frac_cur: 0,
            d: 0,
            phase_sum: 0,
            resets: 0,
            pi: Pi::new(config.gains, i64::from(nominal) * i64::from(SCALING_FACTOR)),
            reset_requested: true,
        }
    }

    /// Forces a reset on the next update, e.g. after a clock discontinuity
    pub fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    /// Synthetic time of the last tick
    #[must_use]
    pub const fn now(&self) -> u32 {
        self.now
    }

    /// Estimated tick period, integer part
    #[must_use]
    pub const fn period(&self) -> u32 {
        self.period
    }

    /// Nominal tick period
    #[must_use]
    pub const fn nominal(&self) -> u32 {
        self.nominal
    }

    /// Diagnostics
    #[must_use]
    pub const fn stats(&self) -> GridStats {
        GridStats {
            now: self.now,
            period: self.period,
            period_frac: self.period_frac,
            resets: self.resets,
            total: self.total,
            err: self.pi.error(),
        }
    }

    fn reset(&mut self, ptp_now: u32) {
        self.count = 0;
        self.total = 0;
        self.period = self.nominal;
        self.period_frac = 0;
        self.period_frac_cur = 0;
        self.phase_sum = 0;
        self.pi
            .reset(i64::from(self.nominal) * i64::from(SCALING_FACTOR));
        self.resets = self.resets.wrapping_add(1);
        self.now = ptp_now;
        self.reset_requested = false;
    }

    const fn outside(&self, value: u32, tolerance: u32) -> bool {
        value > self.nominal.saturating_add(tolerance)
            || value < self.nominal.saturating_sub(tolerance)
    }

    /// Advances the grid by one tick given the sampled gPTP time.
    ///
    /// Returns true if the grid was reset, in which case [`PtpGrid::now`]
    /// equals the sample.
    pub fn update(&mut self, ptp_now: u32) -> bool {
        let sampled_period = ptp_now.wrapping_sub(self.ptp_last);
        let mut reset = false;

        if self.reset_requested {
            debug!("grid reset requested at {ptp_now}");
            reset = true;
        } else if self.outside(sampled_period, PTP_MAX_ERROR_NS) {
            warn!(
                "sampled period {sampled_period} ns out of tolerance, resetting grid at {ptp_now}"
            );
            reset = true;
        } else if self.outside(self.period, PI_MAX_ERROR_NS) {
            warn!(
                "estimated period {} ns out of tolerance, resetting grid at {ptp_now}",
                self.period
            );
            reset = true;
        }

        if reset {
            self.reset(ptp_now);
        } else {
            self.track(ptp_now);
        }

        self.ptp_last = ptp_now;
        self.last = self.now;
        self.total += 1;

        reset
    }

    fn track(&mut self, ptp_now: u32) {
        self.now = self.last.wrapping_add(self.period);

        if self.period_frac_cur != 0 {
            self.d += self.period_frac as i32;
            if self.d > 0 {
                self.now = self.now.wrapping_add(1);
                self.d -= SCALING_FACTOR as i32;
                self.period_frac_cur -= 1;
            }
        }

        self.count += 1;
        self.phase_sum += i64::from(ptp_now.wrapping_sub(self.now) as i32);
        if self.count < SCALING_FACTOR {
            return;
        }

        // remainder of the window that did not fit into the even spread
        self.now = self.now.wrapping_add(self.period_frac_cur);

        let scaling = i64::from(SCALING_FACTOR);
        let err = i32::try_from(std::mem::take(&mut self.phase_sum) / scaling).unwrap_or(0);
        let u = self.pi.update(err);

        self.count = 0;
        self.period = u32::try_from(u.div_euclid(scaling)).unwrap_or(0);
        self.period_frac = u.rem_euclid(scaling) as u32;
        self.d = self.period_frac as i32 - (SCALING_FACTOR / 2) as i32;
        self.period_frac_cur = self.period_frac;

        debug!(
            "grid window done: now {} period {} + {}/{} err {}",
            self.now,
            self.period,
            self.period_frac,
            SCALING_FACTOR,
            self.pi.error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const NOM: u32 = DEFAULT_PERIOD_NS;
    const START: u64 = 1_000_000;

    /// True gPTP time of tick `k` for a timer running `ppm` fast or slow
    fn true_time(k: u64, ppm: i64) -> u32 {
        let nominal = i64::try_from(k * u64::from(NOM)).unwrap();
        let drift = nominal * ppm / 1_000_000;
        u64::try_from(i64::try_from(START).unwrap() + nominal + drift).unwrap() as u32
    }

    fn diff(a: u32, b: u32) -> i64 {
        i64::from(a.wrapping_sub(b) as i32)
    }

    #[test]
    fn test_first_sample_resets() {
        let mut grid = PtpGrid::new(GridConfig::default());
        assert!(grid.update(42));
        assert_eq!(grid.now(), 42);
        assert_eq!(grid.stats().resets, 1);
        assert_eq!(grid.stats().total, 1);
    }

    #[test]
    fn test_tracks_drifting_clock() {
        for ppm in [0, 10, -10, 100, -100] {
            let mut grid = PtpGrid::new(GridConfig::default());
            let windows = 40;
            let ticks = u64::from(SCALING_FACTOR) * windows;

            for k in 0..ticks {
                let t = true_time(k, ppm);
                grid.update(t);

                if k > u64::from(SCALING_FACTOR) * 30 {
                    let err = diff(grid.now(), t);
                    assert!(err.abs() <= 10, "ppm {ppm} tick {k} error {err}");
                }
            }

            assert_eq!(grid.stats().resets, 1, "ppm {ppm}");
        }
    }

    #[test]
    fn test_filters_sampling_jitter() {
        for seed in [7, 8, 9] {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut grid = PtpGrid::new(GridConfig::default());
            let mut prev: Option<u32> = None;
            let mut square_sum = 0;
            let mut samples = 0;

            for k in 0..u64::from(SCALING_FACTOR) * 40 {
                let t = true_time(k, 20);
                let jitter: i32 = rng.gen_range(-20_000..=20_000);
                grid.update(t.wrapping_add_signed(jitter));

                if k > u64::from(SCALING_FACTOR) * 10 {
                    let err = diff(grid.now(), t);
                    assert!(err.abs() <= 2_000, "seed {seed} tick {k} phase error {err}");
                    square_sum += err * err;
                    samples += 1;

                    if let Some(prev) = prev {
                        let step = diff(grid.now(), prev) - i64::from(NOM);
                        assert!(step.abs() <= 16, "seed {seed} tick {k} step deviation {step}");
                    }
                }
                prev = Some(grid.now());
            }

            // readings jitter by 20 us, the grid stays within 1 us rms
            assert!(
                square_sum / samples <= 1_000 * 1_000,
                "seed {seed} mean square phase error {}",
                square_sum / samples
            );
            assert_eq!(grid.stats().resets, 1);
        }
    }

    #[test]
    fn test_jump_resets_once() {
        let mut grid = PtpGrid::new(GridConfig::default());
        let mut k = 0;
        for _ in 0..3000 {
            grid.update(true_time(k, 0));
            k += 1;
        }
        assert_eq!(grid.stats().resets, 1);

        let jump = 5_000_000;
        let jumped = true_time(k, 0).wrapping_add(jump);
        assert!(grid.update(jumped));
        assert_eq!(grid.now(), jumped);
        assert_eq!(grid.stats().resets, 2);

        for _ in 0..10 {
            k += 1;
            let t = true_time(k, 0).wrapping_add(jump);
            assert!(!grid.update(t));
            assert_eq!(grid.now(), t);
        }
        assert_eq!(grid.stats().resets, 2);
    }

    #[test]
    fn test_wraps_around_32_bit() {
        let mut grid = PtpGrid::new(GridConfig::default());
        let mut t = u32::MAX - 10 * NOM;
        for _ in 0..20 {
            grid.update(t);
            assert_eq!(grid.now(), t);
            t = t.wrapping_add(NOM);
        }
        assert_eq!(grid.stats().resets, 1);
    }

    #[test]
    fn test_requested_reset() {
        let mut grid = PtpGrid::new(GridConfig::default());
        grid.update(1_000_000);
        assert!(!grid.update(1_125_000));
        grid.request_reset();
        assert!(grid.update(1_250_000));
        assert_eq!(grid.stats().resets, 2);
        assert_eq!(grid.stats().total, 1);
    }

    #[test]
    fn test_failed_reads_keep_resetting() {
        let mut grid = PtpGrid::new(GridConfig::default());
        grid.update(1_000_000);
        assert!(grid.update(0));
        assert!(grid.update(0));
        assert_eq!(grid.stats().resets, 3);
    }
}
