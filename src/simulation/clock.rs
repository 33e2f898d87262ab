// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Simulated time and gPTP clock
use crate::configuration::{ClockJump, SimulationConfig};
use crate::ptp::{ClockError, ClockId, ClockSource};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// gPTP time at the start of a simulation
pub const EPOCH_NS: u64 = 1_000_000_000;

const NS_PER_MS: u64 = 1_000_000;

#[derive(Debug, Clone)]
enum Base {
    Stepped(Arc<AtomicU64>),
    Tokio(tokio::time::Instant),
}

/// Time of the local timer since the start of a simulation.
///
/// Stepped time only moves by [`SimTime::advance`]. Tokio time follows the
/// tokio clock, which is deterministic if the runtime is paused.
#[derive(Debug, Clone)]
pub struct SimTime(Base);

impl SimTime {
    /// Time advanced explicitly
    #[must_use]
    pub fn stepped() -> Self {
        Self(Base::Stepped(Arc::new(AtomicU64::new(0))))
    }

    /// Time following the tokio clock, starting now.
    ///
    /// # Panics
    ///
    /// If called outside of a tokio runtime with the `time` driver enabled.
    #[must_use]
    pub fn tokio() -> Self {
        Self(Base::Tokio(tokio::time::Instant::now()))
    }

    /// True if the time follows the tokio clock
    #[must_use]
    pub const fn is_tokio(&self) -> bool {
        matches!(self.0, Base::Tokio(_))
    }

    /// Nanoseconds since the start
    #[must_use]
    pub fn elapsed_ns(&self) -> u64 {
        match &self.0 {
            Base::Stepped(ns) => ns.load(Ordering::Relaxed),
            Base::Tokio(start) => u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX),
        }
    }

    /// Moves stepped time forward by `ns`. Tokio time is not affected.
    pub fn advance(&self, ns: u64) {
        if let Base::Stepped(now) = &self.0 {
            now.fetch_add(ns, Ordering::Relaxed);
        }
    }
}

/// Maps the local timer to gPTP time
#[derive(Debug, Clone)]
pub struct Timebase {
    time: SimTime,
    drift_ppm: i32,
    jump: Option<ClockJump>,
}

impl Timebase {
    /// gPTP time for a timer running `drift_ppm` fast that steps once by
    /// `jump`
    #[must_use]
    pub const fn new(time: SimTime, drift_ppm: i32, jump: Option<ClockJump>) -> Self {
        Self {
            time,
            drift_ppm,
            jump,
        }
    }

    /// The local timer
    #[must_use]
    pub const fn time(&self) -> &SimTime {
        &self.time
    }

    /// gPTP time without sampling jitter
    #[must_use]
    pub fn gptp_now(&self) -> u64 {
        let elapsed = self.time.elapsed_ns();
        let elapsed_wide = i128::from(elapsed);
        let drift = elapsed_wide * i128::from(self.drift_ppm) / 1_000_000;
        let step = self
            .jump
            .filter(|jump| elapsed >= jump.at_ms.saturating_mul(NS_PER_MS))
            .map_or(0, |jump| i128::from(jump.offset_ns));

        u64::try_from(i128::from(EPOCH_NS) + elapsed_wide + drift + step).unwrap_or(0)
    }

    /// Local time, neither drifting nor stepping
    #[must_use]
    pub fn monotonic_now(&self) -> u64 {
        EPOCH_NS.saturating_add(self.time.elapsed_ns())
    }
}

/// A gPTP clock whose readings jitter uniformly around the true time.
///
/// Both gPTP domains read the same time.
#[derive(Debug)]
pub struct SimClock {
    timebase: Timebase,
    jitter_ns: u32,
    rng: Mutex<StdRng>,
}

impl SimClock {
    /// Clock following `time` with the drift, jitter and jump of `config`
    #[must_use]
    pub fn new(time: SimTime, config: &SimulationConfig) -> Self {
        Self {
            timebase: Timebase::new(time, config.drift_ppm, config.clock_jump),
            jitter_ns: config.jitter_ns,
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
        }
    }

    /// Jitter free view of the clock
    #[must_use]
    pub const fn timebase(&self) -> &Timebase {
        &self.timebase
    }

    fn jitter(&self) -> i64 {
        if self.jitter_ns == 0 {
            return 0;
        }
        let range = -i64::from(self.jitter_ns)..=i64::from(self.jitter_ns);
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(range),
            Err(poisoned) => poisoned.into_inner().gen_range(range),
        }
    }
}

impl ClockSource for SimClock {
    fn gettime(&self, clock: ClockId) -> Result<u64, ClockError> {
        let now = match clock {
            ClockId::Gptp0 | ClockId::Gptp1 => self.timebase.gptp_now(),
            ClockId::Monotonic => self.timebase.monotonic_now(),
        };
        Ok(now.saturating_add_signed(self.jitter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SimulationConfig {
        SimulationConfig::default()
    }

    #[test]
    fn test_stepped_time() {
        let time = SimTime::stepped();
        let view = time.clone();
        time.advance(125_000);
        time.advance(125_000);
        assert_eq!(view.elapsed_ns(), 250_000);
        assert!(!view.is_tokio());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_time() {
        let time = SimTime::tokio();
        tokio::time::advance(std::time::Duration::from_micros(125)).await;
        assert_eq!(time.elapsed_ns(), 125_000);
        time.advance(1);
        assert_eq!(time.elapsed_ns(), 125_000);
    }

    #[test]
    fn test_drift() -> Result<(), ClockError> {
        let time = SimTime::stepped();
        let clock = SimClock::new(
            time.clone(),
            &SimulationConfig {
                drift_ppm: 100,
                ..config()
            },
        );

        assert_eq!(clock.gettime(ClockId::Gptp0)?, EPOCH_NS);
        time.advance(1_000_000_000);
        assert_eq!(clock.gettime(ClockId::Gptp0)?, EPOCH_NS + 1_000_100_000);
        assert_eq!(clock.gettime(ClockId::Gptp1)?, EPOCH_NS + 1_000_100_000);
        assert_eq!(clock.gettime(ClockId::Monotonic)?, EPOCH_NS + 1_000_000_000);
        Ok(())
    }

    #[test]
    fn test_jump() -> Result<(), ClockError> {
        let time = SimTime::stepped();
        let clock = SimClock::new(
            time.clone(),
            &SimulationConfig {
                clock_jump: Some(ClockJump {
                    at_ms: 10,
                    offset_ns: 5_000_000,
                }),
                ..config()
            },
        );

        time.advance(9_999_999);
        assert_eq!(clock.gettime(ClockId::Gptp0)?, EPOCH_NS + 9_999_999);
        time.advance(1);
        assert_eq!(clock.gettime(ClockId::Gptp0)?, EPOCH_NS + 15_000_000);
        assert_eq!(clock.gettime(ClockId::Monotonic)?, EPOCH_NS + 10_000_000);
        Ok(())
    }

    #[test]
    fn test_jitter_is_bounded_and_seeded() -> Result<(), ClockError> {
        let jittery = SimulationConfig {
            jitter_ns: 20_000,
            seed: 42,
            ..config()
        };
        let a = SimClock::new(SimTime::stepped(), &jittery);
        let b = SimClock::new(SimTime::stepped(), &jittery);

        let mut spread = false;
        for _ in 0..1000 {
            let reading = a.gettime(ClockId::Gptp0)?;
            assert_eq!(reading, b.gettime(ClockId::Gptp0)?);
            assert!(reading.abs_diff(EPOCH_NS) <= 20_000);
            spread |= reading != EPOCH_NS;
        }
        assert!(spread);
        assert_eq!(a.timebase().gptp_now(), EPOCH_NS);
        Ok(())
    }
}
