// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fixed-point PI controller
//!
//! The integral and proportional terms are divided by powers of two
//! (`2^ki` and `2^kp`), so the controller never needs floating point.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest accepted shift of either term
pub const GAIN_SHIFT_MAX: u32 = 16;

/// Gain shift out of range
#[derive(Error, Debug, PartialEq, Eq)]
#[error("PI gain shifts ki={ki} kp={kp} exceed {max}", max = GAIN_SHIFT_MAX)]
pub struct PiGainsError {
    ki: u32,
    kp: u32,
}

/// Gains given as right shifts of the integral and proportional term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPiGains")]
pub struct PiGains {
    ki: u32,
    kp: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPiGains {
    ki: u32,
    kp: u32,
}

impl TryFrom<RawPiGains> for PiGains {
    type Error = PiGainsError;

    fn try_from(raw: RawPiGains) -> Result<Self, Self::Error> {
        Self::new(raw.ki, raw.kp)
    }
}

impl Default for PiGains {
    fn default() -> Self {
        Self { ki: 3, kp: 1 }
    }
}

impl PiGains {
    /// Integral term divided by `2^ki`, proportional term by `2^kp`
    ///
    /// # Errors
    ///
    /// If a shift exceeds [`GAIN_SHIFT_MAX`]. Larger shifts overflow the
    /// integral of a nanosecond period.
    pub const fn new(ki: u32, kp: u32) -> Result<Self, PiGainsError> {
        if ki > GAIN_SHIFT_MAX || kp > GAIN_SHIFT_MAX {
            return Err(PiGainsError { ki, kp });
        }
        Ok(Self { ki, kp })
    }

    /// Shift of the integral term
    #[must_use]
    pub const fn ki(&self) -> u32 {
        self.ki
    }

    /// Shift of the proportional term
    #[must_use]
    pub const fn kp(&self) -> u32 {
        self.kp
    }
}

/// PI controller state
#[derive(Debug, Clone)]
pub struct Pi {
    gains: PiGains,
    integral: i64,
    err: i32,
    u: i64,
}

impl Pi {
    /// Creates a controller with output `u`
    #[must_use]
    pub fn new(gains: PiGains, u: i64) -> Self {
        let mut pi = Self {
            gains,
            integral: 0,
            err: 0,
            u: 0,
        };
        pi.reset(u);
        pi
    }

    /// Restarts the controller so that it outputs `u` for a zero error
    pub fn reset(&mut self, u: i64) {
        self.integral = u << self.gains.ki;
        self.err = 0;
        self.u = u;
    }

    /// Feeds a new error sample and returns the new output
    pub fn update(&mut self, err: i32) -> i64 {
        let err64 = i64::from(err);
        self.err = err;
        self.integral += err64;
        self.u = (self.integral >> self.gains.ki) + (err64 >> self.gains.kp);
        self.u
    }

    /// Last output
    #[must_use]
    pub const fn output(&self) -> i64 {
        self.u
    }

    /// Last error sample
    #[must_use]
    pub const fn error(&self) -> i32 {
        self.err
    }

    /// Accumulated integral
    #[must_use]
    pub const fn integral(&self) -> i64 {
        self.integral
    }
}
