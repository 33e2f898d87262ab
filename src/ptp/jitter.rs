// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Statistics of the raw tick sampling interval
use serde::Serialize;

const WINDOW_SHIFT: u32 = 8;

/// Min/max of the sampled tick interval, plus mean and variance over the
/// last complete window of 256 samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JitterStats {
    #[serde(skip)]
    ptp_last: u32,
    #[serde(skip)]
    count: u32,
    #[serde(skip)]
    sum: u64,
    #[serde(skip)]
    sum2: u64,

    /// Shortest interval seen
    pub dt_min: u32,

    /// Longest interval seen
    pub dt_max: u32,

    /// Mean interval of the last window
    pub dt_mean: u32,

    /// Variance of the last window
    pub dt_variance: u64,
}

impl Default for JitterStats {
    fn default() -> Self {
        Self {
            ptp_last: 0,
            count: 0,
            sum: 0,
            sum2: 0,
            dt_min: u32::MAX,
            dt_max: 0,
            dt_mean: 0,
            dt_variance: 0,
        }
    }
}

impl JitterStats {
    /// Accounts the sample of a new tick
    pub fn sample(&mut self, ptp_now: u32) {
        if self.count != 0 {
            let dt = ptp_now.wrapping_sub(self.ptp_last);
            let dt64 = u64::from(dt);
            self.sum = self.sum.saturating_add(dt64);
            self.sum2 = self.sum2.saturating_add(dt64 * dt64);
            self.dt_min = self.dt_min.min(dt);
            self.dt_max = self.dt_max.max(dt);
        }

        self.ptp_last = ptp_now;
        self.count = self.count.wrapping_add(1);

        if self.count % (1 << WINDOW_SHIFT) == 0 {
            let mean = self.sum >> WINDOW_SHIFT;
            self.dt_mean = u32::try_from(mean).unwrap_or(u32::MAX);
            self.dt_variance = (self.sum2 >> WINDOW_SHIFT).saturating_sub(mean * mean);
            self.sum = 0;
            self.sum2 = 0;
        }
    }
}
