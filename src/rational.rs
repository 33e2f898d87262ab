// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Exact `i + p/q` arithmetic for scheduling intervals
//!
//! Class intervals such as 640000000/441 ns cannot be expressed as an integer
//! number of nanoseconds. Accumulating them as [`Rational`] keeps the long term
//! phase exact, while the integer part behaves like the rest of the scheduler
//! clocks, i.e. it is a nanosecond counter modulo 2^32.
//!
//! ```
//! use netqos::rational::Rational;
//! use std::cmp::Ordering;
//! use std::num::NonZeroU32;
//!
//! let q = NonZeroU32::new(441).unwrap();
//! let interval = Rational::from_fraction(640_000_000, q).unwrap();
//! let mut t = Rational::new(0, 0, q);
//! for _ in 0..441 {
//!     t = t.checked_add(&interval).unwrap();
//! }
//! assert_eq!(t.cmp_int(640_000_000), Ordering::Equal);
//! ```
#![allow(clippy::as_conversions)] // modulo 2^32 clock arithmetic

use std::cmp::Ordering;
use std::fmt;
use std::num::NonZeroU32;
use thiserror::Error;

/// Reasons why a raw pair can not be turned into a [`Rational`]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RationalError {
    /// Denominator was zero
    #[error("zero denominator")]
    ZeroDenominator,

    /// Integer part does not fit into 32 bit
    #[error("{0} does not fit into a 32 bit rational")]
    Overflow(u64),
}

/// Non-negative rational number `i + p/q` with `p < q`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    i: u32,
    p: u32,
    q: NonZeroU32,
}

impl Rational {
    /// Normalizes `i + p/q`, carrying whole multiples of `q` from `p` into `i`.
    #[must_use]
    pub const fn new(i: u32, p: u32, q: NonZeroU32) -> Self {
        let q_raw = q.get();
        Self {
            i: i.wrapping_add(p / q_raw),
            p: p % q_raw,
            q,
        }
    }

    /// Integer value with denominator 1
    #[must_use]
    pub const fn from_int(i: u32) -> Self {
        Self {
            i,
            p: 0,
            q: NonZeroU32::MIN,
        }
    }

    /// `num / den`, `None` if the integer part exceeds 32 bit
    #[must_use]
    pub fn from_fraction(num: u64, den: NonZeroU32) -> Option<Self> {
        let d = u64::from(den.get());
        let i = u32::try_from(num / d).ok()?;
        let p = u32::try_from(num % d).ok()?;
        Some(Self { i, p, q: den })
    }

    /// Integer part
    #[must_use]
    pub const fn int(&self) -> u32 {
        self.i
    }

    /// Numerator of the fractional part
    #[must_use]
    pub const fn numerator(&self) -> u32 {
        self.p
    }

    /// Denominator of the fractional part
    #[must_use]
    pub const fn denominator(&self) -> NonZeroU32 {
        self.q
    }

    /// Sum of two rationals.
    ///
    /// Equal denominators take the exact fast path. Otherwise the fractional
    /// parts are combined in 128 bit and reduced, which only fails if the
    /// reduced denominator still does not fit into 32 bit.
    /// The integer part wraps around.
    #[must_use]
    pub fn checked_add(&self, other: &Self) -> Option<Self> {
        let i = self.i.wrapping_add(other.i);

        if self.q == other.q {
            let q = u64::from(self.q.get());
            let p = u64::from(self.p) + u64::from(other.p);
            let carry = (p / q) as u32;
            return Some(Self {
                i: i.wrapping_add(carry),
                p: (p % q) as u32,
                q: self.q,
            });
        }

        let q1 = u128::from(self.q.get());
        let q2 = u128::from(other.q.get());
        let num = u128::from(self.p) * q2 + u128::from(other.p) * q1;
        let den = q1 * q2;
        let g = gcd(num, den);
        let (num, den) = (num / g, den / g);

        let q = NonZeroU32::new(u32::try_from(den).ok()?)?;
        let den = u128::from(q.get());
        // both fractions are below one, so at most a single carry
        let carry = (num / den) as u32;
        Some(Self {
            i: i.wrapping_add(carry),
            p: (num % den) as u32,
            q,
        })
    }

    /// Compares the rational with the integer `a`, interpreting the integer
    /// parts as a wrapping clock, i.e. ordered by their signed 32 bit distance.
    #[must_use]
    pub const fn cmp_int(&self, a: u32) -> Ordering {
        let d = self.i.wrapping_sub(a) as i32;
        if d > 0 {
            Ordering::Greater
        } else if d < 0 {
            Ordering::Less
        } else if self.p > 0 {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    /// `a * self`, truncated towards zero and wrapped to 32 bit
    #[must_use]
    pub fn int_mul(&self, a: u32) -> u32 {
        let frac = u64::from(a) * u64::from(self.p) / u64::from(self.q.get());
        a.wrapping_mul(self.i).wrapping_add(frac as u32)
    }

    /// `self / b` as an exact rational, `None` if the reduced result does
    /// not fit.
    #[must_use]
    pub fn int_div(&self, b: NonZeroU32) -> Option<Self> {
        let q = u64::from(self.q.get());
        let num = u64::from(self.i) * q + u64::from(self.p);
        let den = q * u64::from(b.get());
        let g = gcd(u128::from(num), u128::from(den));
        let g = u64::try_from(g).ok()?;
        let den = NonZeroU32::new(u32::try_from(den / g).ok()?)?;
        Self::from_fraction(num / g, den)
    }
}

impl TryFrom<(u64, u32)> for Rational {
    type Error = RationalError;

    fn try_from((num, den): (u64, u32)) -> Result<Self, Self::Error> {
        let den = NonZeroU32::new(den).ok_or(RationalError::ZeroDenominator)?;
        Self::from_fraction(num, den).ok_or(RationalError::Overflow(num))
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.p == 0 {
            write!(f, "{}", self.i)
        } else {
            write!(f, "{} + {}/{}", self.i, self.p, self.q)
        }
    }
}

const fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    if a == 0 {
        1
    } else {
        a
    }
}
