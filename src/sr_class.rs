// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Stream reservation classes
//!
//! Each class has a nominal observation interval `P/Q` ns. Class A and B are
//! defined by 802.1Q, C, D and E are the common automotive and audio profiles.
//! Software scheduling may run a class more often than its interval, the
//! `scale` factor, to smooth its bursts.
use crate::rational::Rational;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use thiserror::Error;

const NSECS_PER_SEC: u64 = 1_000_000_000;

/// SR class kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SrClassKind {
    /// 125 us
    A,
    /// 250 us
    B,
    /// 1.333 ms
    C,
    /// 1.451 ms (64 samples at 44.1 kHz)
    D,
    /// 1 ms
    E,
}

impl SrClassKind {
    /// Interval numerator in ns
    #[must_use]
    pub const fn interval_p(self) -> u32 {
        match self {
            Self::A => 125_000,
            Self::B => 250_000,
            Self::C => 4_000_000,
            Self::D => 640_000_000,
            Self::E => 1_000_000,
        }
    }

    /// Interval denominator
    #[must_use]
    pub const fn interval_q(self) -> u32 {
        match self {
            Self::A | Self::B | Self::E => 1,
            Self::C => 3,
            Self::D => 441,
        }
    }

    /// Number of software scheduling sub-intervals per class interval
    #[must_use]
    pub const fn scale(self) -> u32 {
        match self {
            Self::A => 1,
            Self::B => 2,
            Self::C | Self::D | Self::E => 8,
        }
    }

    /// Software scheduling interval, i.e. `P / (Q * scale)` ns
    #[must_use]
    pub fn sched_interval(self) -> Rational {
        let q = self.interval_q() * self.scale();
        // all denominators are non zero constants
        let q = NonZeroU32::new(q).unwrap_or(NonZeroU32::MIN);
        Rational::from_fraction(u64::from(self.interval_p()), q)
            .unwrap_or_else(|| Rational::from_int(self.interval_p()))
    }

    /// Bits per class interval granted by `idle_slope` bits/s
    #[must_use]
    pub fn scale_idle_slope(self, idle_slope: u64) -> u32 {
        let bits = u128::from(idle_slope) * u128::from(self.interval_p())
            / (u128::from(NSECS_PER_SEC) * u128::from(self.interval_q()));
        u32::try_from(bits).unwrap_or(u32::MAX)
    }
}

impl fmt::Display for SrClassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Role of an SR class on the port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SrPrio {
    /// Higher priority reservation class
    High,
    /// Lower priority reservation class
    Low,
}

impl SrPrio {
    /// Both roles, highest first
    pub const ALL: [Self; 2] = [Self::High, Self::Low];

    /// Default PCP of the role
    #[must_use]
    pub const fn pcp(self) -> u8 {
        match self {
            Self::High => 3,
            Self::Low => 2,
        }
    }

    /// SRP class id of the role
    #[must_use]
    pub const fn class_id(self) -> u8 {
        match self {
            Self::High => 6,
            Self::Low => 5,
        }
    }

    /// Number of streams the role can carry per port
    #[must_use]
    pub const fn stream_max(self) -> usize {
        match self {
            Self::High | Self::Low => 8,
        }
    }
}

/// Invalid combination of SR classes
#[derive(Error, Debug, PartialEq, Eq)]
#[error("SR class {0} can not serve both roles")]
pub struct SrClassConfigError(SrClassKind);

/// Which SR classes serve the high and low roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSrClassConfig")]
pub struct SrClassConfig {
    high: SrClassKind,
    low: SrClassKind,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSrClassConfig {
    high: SrClassKind,
    low: SrClassKind,
}

impl TryFrom<RawSrClassConfig> for SrClassConfig {
    type Error = SrClassConfigError;

    fn try_from(raw: RawSrClassConfig) -> Result<Self, Self::Error> {
        Self::new(raw.high, raw.low)
    }
}

impl Default for SrClassConfig {
    fn default() -> Self {
        Self {
            high: SrClassKind::A,
            low: SrClassKind::B,
        }
    }
}

impl SrClassConfig {
    /// Assigns the roles
    ///
    /// # Errors
    ///
    /// If both roles name the same class.
    pub fn new(high: SrClassKind, low: SrClassKind) -> Result<Self, SrClassConfigError> {
        if high == low {
            return Err(SrClassConfigError(high));
        }
        Ok(Self { high, low })
    }

    /// Class serving `prio`
    #[must_use]
    pub const fn class(&self, prio: SrPrio) -> SrClassKind {
        match prio {
            SrPrio::High => self.high,
            SrPrio::Low => self.low,
        }
    }

    /// Role of `class`, `None` if the class is not enabled
    #[must_use]
    pub fn prio(&self, class: SrClassKind) -> Option<SrPrio> {
        SrPrio::ALL.into_iter().find(|prio| self.class(*prio) == class)
    }
}
