// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Leaky bucket credit counter
//!
//! The same [`Shaper`] is used at port, SR class and stream level. Credit is
//! counted in (scaled) bits, time in scheduling intervals.
//!
//! ```
//! use netqos::shaper::{frame_bits, Shaper};
//!
//! let mut shaper = Shaper::new(1250);
//! shaper.decrement(frame_bits(64, 1));
//! assert!(shaper.ready());
//! shaper.decrement(frame_bits(64, 1));
//! assert!(!shaper.ready());
//! shaper.increment(1);
//! assert!(shaper.ready());
//! ```
use serde::Serialize;

/// Shortest payload accounted for, i.e. the minimum Ethernet frame without FCS
pub const ETHER_MIN_FRAME_LEN: u32 = 60;

/// Interframe gap, preamble with start delimiter and FCS
pub const PORT_OVERHEAD: u32 = 12 + 8 + 4;

/// Saturation value for the credit
pub const CREDIT_MAX: i32 = 0x4000_0000;

/// Elapsed intervals above which the credit saturates immediately
pub const MAX_ELAPSED: u32 = 0x10000;

const BITS_PER_BYTE: u32 = 8;

/// Bits a frame of `len` bytes occupies on the wire, multiplied by `scale`
#[must_use]
pub fn frame_bits(len: usize, scale: u32) -> u32 {
    let len = u32::try_from(len).unwrap_or(u32::MAX).max(ETHER_MIN_FRAME_LEN);
    len.saturating_add(PORT_OVERHEAD)
        .saturating_mul(BITS_PER_BYTE)
        .saturating_mul(scale)
}

/// Credit based shaper state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Shaper {
    credit: i32,
    credit_min: i32,
    tlast: u32,
    rate: u32,
}

impl Shaper {
    /// Shaper with zero credit that earns `rate` bits per interval
    #[must_use]
    pub fn new(rate: u32) -> Self {
        Self {
            credit: 0,
            credit_min: neg(rate),
            tlast: 0,
            rate,
        }
    }

    /// Re-seeds the shaper as if newly created at interval `now`
    pub fn reset(&mut self, rate: u32, now: u32) {
        *self = Self::new(rate);
        self.tlast = now;
    }

    /// Replaces the rate, keeping the credit
    pub fn set_rate(&mut self, rate: u32) {
        self.rate = rate;
        self.credit_min = neg(rate);
    }

    /// Adds `delta` to the rate, keeping the credit
    pub fn add_rate(&mut self, delta: i64) {
        let rate = i64::from(self.rate).saturating_add(delta).max(0);
        self.set_rate(u32::try_from(rate).unwrap_or(u32::MAX));
    }

    /// Earns credit for the intervals elapsed since the last update.
    ///
    /// Saturates at [`CREDIT_MAX`] if the shaper was not updated for more than
    /// [`MAX_ELAPSED`] intervals.
    pub fn increment(&mut self, now: u32) {
        let dt = now.wrapping_sub(self.tlast);
        if dt > MAX_ELAPSED || self.credit >= CREDIT_MAX {
            self.credit = CREDIT_MAX;
        } else {
            let credit = i64::from(self.credit) + i64::from(dt) * i64::from(self.rate);
            self.credit = i32::try_from(credit.min(i64::from(CREDIT_MAX))).unwrap_or(CREDIT_MAX);
        }
        self.tlast = now;
    }

    /// Spends `bits` of credit
    pub fn decrement(&mut self, bits: u32) {
        let credit = i64::from(self.credit) - i64::from(bits);
        self.credit = i32::try_from(credit).unwrap_or(i32::MIN);
    }

    /// Caps the credit at zero, so idle time is not saved up as burst
    pub fn cap(&mut self) {
        self.credit = self.credit.min(0);
    }

    /// Restarts time accounting at interval `now` without earning credit
    pub fn rebase(&mut self, now: u32) {
        self.tlast = now;
    }

    /// Transmission is allowed
    #[must_use]
    pub const fn ready(&self) -> bool {
        self.credit >= self.credit_min
    }

    /// Current credit in bits
    #[must_use]
    pub const fn credit(&self) -> i32 {
        self.credit
    }

    /// Lowest credit that still allows transmission
    #[must_use]
    pub const fn credit_min(&self) -> i32 {
        self.credit_min
    }

    /// Bits earned per interval
    #[must_use]
    pub const fn rate(&self) -> u32 {
        self.rate
    }

    /// Interval of the last update
    #[must_use]
    pub const fn last_update(&self) -> u32 {
        self.tlast
    }
}

fn neg(rate: u32) -> i32 {
    i32::try_from(rate).map_or(i32::MIN, |r| -r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_frame_bits_pads_short_frames() {
        assert_eq!(frame_bits(0, 1), (60 + 24) * 8);
        assert_eq!(frame_bits(64, 1), (64 + 24) * 8);
        assert_eq!(frame_bits(1500, 2), (1500 + 24) * 8 * 2);
    }

    #[test]
    fn test_increment_saturates_on_stall() {
        let mut shaper = Shaper::new(100);
        shaper.increment(MAX_ELAPSED + 1);
        assert_eq!(shaper.credit(), CREDIT_MAX);
        assert_eq!(shaper.last_update(), MAX_ELAPSED + 1);
    }

    #[test]
    fn test_increment_does_not_overflow() {
        let mut shaper = Shaper::new(u32::MAX);
        shaper.increment(MAX_ELAPSED);
        assert_eq!(shaper.credit(), CREDIT_MAX);
        assert!(shaper.ready());
    }

    #[test]
    fn test_increment_wrapping_time() {
        let mut shaper = Shaper::new(10);
        shaper.reset(10, u32::MAX);
        shaper.increment(1);
        assert_eq!(shaper.credit(), 20);
    }

    #[test]
    fn test_add_rate_moves_floor() {
        let mut shaper = Shaper::new(100);
        shaper.add_rate(50);
        assert_eq!((shaper.rate(), shaper.credit_min()), (150, -150));
        shaper.add_rate(-200);
        assert_eq!((shaper.rate(), shaper.credit_min()), (0, 0));
    }

    #[test]
    fn test_zero_rate_shaper_ready_only_at_zero() {
        let mut shaper = Shaper::new(0);
        assert!(shaper.ready());
        shaper.decrement(1);
        assert!(!shaper.ready());
        shaper.increment(1000);
        assert!(!shaper.ready());
    }

    #[test]
    fn test_credit_conservation() {
        let mut rng = StdRng::seed_from_u64(42);
        let rate = 1250;
        let max_frame = frame_bits(1500, 1);

        let mut shaper = Shaper::new(rate);
        let mut now = 0_u32;
        let mut sent = 0_u64;

        for _ in 0..100_000 {
            now += rng.gen_range(0..3);
            shaper.increment(now);
            shaper.cap();

            while shaper.ready() {
                let bits = frame_bits(rng.gen_range(0..=1500), 1);
                shaper.decrement(bits);
                sent += u64::from(bits);
            }
            assert!(shaper.credit() >= shaper.credit_min() - i32::try_from(max_frame).unwrap());
        }

        let budget = u64::from(now) * u64::from(rate) + u64::from(rate) + u64::from(max_frame);
        assert!(sent <= budget, "sent {sent} bits, budget {budget}");
    }
}
