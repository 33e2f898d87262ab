// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Queue bitmasks
//!
//! [`RingMask`] is the scheduler private view (scheduled, disabled, ...) with a
//! round robin scan. [`SharedMask`] is the pending mask that producers set
//! concurrently to the scheduler.
#![allow(clippy::as_conversions)] // bit indices are below 32

use std::sync::atomic::{AtomicU32, Ordering};

/// Width of the masks
pub const MASK_BITS: usize = 32;

/// Plain 32 bit queue mask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingMask(u32);

impl RingMask {
    /// Mask with no bit set
    pub const EMPTY: Self = Self(0);

    /// Mask with every bit set
    pub const FULL: Self = Self(u32::MAX);

    /// Wraps raw bits
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Sets bit `index`
    pub fn set(&mut self, index: usize) {
        self.0 |= bit(index);
    }

    /// Clears bit `index`
    pub fn clear(&mut self, index: usize) {
        self.0 &= !bit(index);
    }

    /// Bit `index` is set
    #[must_use]
    pub const fn contains(self, index: usize) -> bool {
        self.0 & bit(index) != 0
    }

    /// No bit is set
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Bits set in `self` but not in `other`
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Bits set in both masks
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// First set bit after `cursor`, wrapping around.
    ///
    /// The cursor itself is considered last, so a mask with a single bit at
    /// the cursor returns the cursor again.
    #[must_use]
    pub const fn next_after(self, cursor: usize) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }

        let cursor = cursor % MASK_BITS;
        let above = if cursor + 1 < MASK_BITS {
            self.0 & (u32::MAX << (cursor + 1))
        } else {
            0
        };

        let found = if above == 0 { self.0 } else { above };
        Some(found.trailing_zeros() as usize)
    }

    /// Indices of all set bits in ascending order
    pub fn iter(self) -> impl Iterator<Item = usize> {
        let mut rest = self.0;
        std::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            let index = rest.trailing_zeros() as usize;
            rest &= rest - 1;
            Some(index)
        })
    }
}

/// Pending mask shared between producers and the scheduler
#[derive(Debug, Default)]
pub struct SharedMask(AtomicU32);

impl SharedMask {
    /// Empty mask
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Atomically sets bit `index`
    pub fn set(&self, index: usize) {
        self.0.fetch_or(bit(index), Ordering::AcqRel);
    }

    /// Atomically clears bit `index`
    pub fn clear(&self, index: usize) {
        self.0.fetch_and(!bit(index), Ordering::AcqRel);
    }

    /// Snapshot of the mask
    #[must_use]
    pub fn load(&self) -> RingMask {
        RingMask(self.0.load(Ordering::Acquire))
    }

    /// Clears bit `index`, then evaluates `still_pending` and sets the bit
    /// again if it returns true.
    ///
    /// A producer publishes data before setting the bit, so whatever it
    /// enqueued concurrently is either seen by `still_pending` or its bit
    /// set lands after the clear.
    pub fn clear_then_recheck<F: FnOnce() -> bool>(&self, index: usize, still_pending: F) -> bool {
        self.clear(index);
        let pending = still_pending();
        if pending {
            self.set(index);
        }
        pending
    }
}

const fn bit(index: usize) -> u32 {
    1 << (index % MASK_BITS)
}
