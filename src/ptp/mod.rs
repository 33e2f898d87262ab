// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! gPTP time sources and the synthetic scheduling grid
use nix::libc::clockid_t;
use nix::sys::time::TimeValLike;
use nix::time::{clock_gettime, ClockId as NixClockId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub mod grid;
pub use grid::{GridConfig, GridStats, PtpGrid, DEFAULT_PERIOD_NS};

mod jitter;
pub use jitter::JitterStats;

/// Clock a port is scheduled against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClockId {
    /// gPTP time of domain 0
    #[default]
    Gptp0,

    /// gPTP time of domain 1
    Gptp1,

    /// Local monotonic clock
    Monotonic,
}

impl fmt::Display for ClockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gptp0 => write!(f, "gptp0"),
            Self::Gptp1 => write!(f, "gptp1"),
            Self::Monotonic => write!(f, "monotonic"),
        }
    }
}

/// Reading a clock failed
#[derive(Error, Debug)]
pub enum ClockError {
    /// The clock is not provided by this source
    #[error("clock {0} is not available")]
    Unavailable(ClockId),

    /// The operating system refused to read the clock
    #[error("reading clock {clock} failed")]
    Read {
        /// Clock that was read
        clock: ClockId,

        /// Underlying error
        #[source]
        source: nix::Error,
    },
}

/// Provides the current time of a clock in nanoseconds
#[cfg_attr(test, automock)]
pub trait ClockSource {
    /// Current time of `clock` in nanoseconds
    ///
    /// # Errors
    ///
    /// If the clock can not be read.
    fn gettime(&self, clock: ClockId) -> Result<u64, ClockError>;
}

/// Clocks of the running system.
///
/// gPTP domains are read from PTP hardware clocks registered with
/// [`SystemClock::with_phc`]. Domains without a PHC fall back to `CLOCK_TAI`,
/// i.e. they assume that the system clock is synchronized to the domain.
#[derive(Debug, Default)]
pub struct SystemClock {
    phc: HashMap<ClockId, File>,
}

const CLOCKFD: clockid_t = 3;

const fn make_process_cpuclock(fd: i32, clock: clockid_t) -> clockid_t {
    ((!fd) << 3) | clock
}

const fn fd_to_clockid(fd: i32) -> NixClockId {
    NixClockId::from_raw(make_process_cpuclock(fd, CLOCKFD))
}

impl SystemClock {
    /// Only system clocks
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `clock` from the PTP hardware clock at `path` (e.g. `/dev/ptp0`)
    ///
    /// # Errors
    ///
    /// If the device can not be opened.
    pub fn with_phc(mut self, clock: ClockId, path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        self.phc.insert(clock, file);
        Ok(self)
    }
}

impl ClockSource for SystemClock {
    fn gettime(&self, clock: ClockId) -> Result<u64, ClockError> {
        let id = match (clock, self.phc.get(&clock)) {
            (_, Some(file)) => fd_to_clockid(file.as_raw_fd()),
            (ClockId::Monotonic, None) => NixClockId::CLOCK_MONOTONIC,
            (ClockId::Gptp0 | ClockId::Gptp1, None) => NixClockId::CLOCK_TAI,
        };

        let ts = clock_gettime(id).map_err(|source| ClockError::Read { clock, source })?;
        u64::try_from(ts.num_nanoseconds()).map_err(|_err| ClockError::Unavailable(clock))
    }
}
