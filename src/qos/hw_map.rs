// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Assignment of traffic classes to hardware transmit queues
//!
//! Three layouts are possible, tried in this order:
//!
//! * one hardware queue per traffic class
//! * one credit shaper queue per SR class plus a single strict priority queue
//!   for everything else
//! * a single queue, shaping is done completely in software
use super::TRAFFIC_CLASS_MAX;
use crate::port_driver::{TxQueueCapabilities, TxQueueConfig, TxQueueFlag};
use flagset::{flags, FlagSet};

flags! {
    /// Work a traffic class offloads to its hardware queue
    pub enum TcFlag: u8 {
        /// Strict priority selection between traffic classes
        HwSp,

        /// Credit based shaping of the SR class
        HwCbs,
    }
}

/// Result of [`map_traffic_classes`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwQueueMap {
    /// Hardware queue per traffic class
    pub hw_queue: [u8; TRAFFIC_CLASS_MAX],

    /// Offload flags per traffic class
    pub flags: [FlagSet<TcFlag>; TRAFFIC_CLASS_MAX],

    /// Configuration to apply to the hardware queues
    pub config: TxQueueConfig,
}

impl HwQueueMap {
    /// Everything on queue 0
    #[must_use]
    pub fn software() -> Self {
        Self {
            hw_queue: [0; TRAFFIC_CLASS_MAX],
            flags: [FlagSet::default(); TRAFFIC_CLASS_MAX],
            config: TxQueueCapabilities::single_queue(),
        }
    }

    /// Whether the map is the single queue fallback
    #[must_use]
    pub fn is_software(&self) -> bool {
        self.config.num_queues() == 1
    }
}

/// Maps the traffic classes onto the hardware queues in `capabilities`.
///
/// `sr` marks the traffic classes carrying an SR class, these are expected to
/// be the highest ones.
#[must_use]
pub fn map_traffic_classes(
    capabilities: &TxQueueCapabilities,
    sr: &[bool; TRAFFIC_CLASS_MAX],
) -> HwQueueMap {
    try_map(capabilities, sr).unwrap_or_else(HwQueueMap::software)
}

fn try_map(capabilities: &TxQueueCapabilities, sr: &[bool; TRAFFIC_CLASS_MAX]) -> Option<HwQueueMap> {
    let num_tx_q = capabilities.num_queues();
    let num_sr = sr.iter().filter(|sr| **sr).count();

    if num_tx_q <= 1 {
        return None;
    }

    let full_hw = TRAFFIC_CLASS_MAX <= num_tx_q;
    let num_queues = if full_hw {
        TRAFFIC_CLASS_MAX
    } else {
        // at least one queue must remain for the strict priority classes
        if num_sr == 0 || capabilities.num_cbs() < num_sr || num_tx_q <= num_sr {
            return None;
        }
        num_sr + 1
    };

    let mut map = HwQueueMap {
        hw_queue: [0; TRAFFIC_CLASS_MAX],
        flags: [FlagSet::default(); TRAFFIC_CLASS_MAX],
        config: TxQueueConfig {
            queues: vec![FlagSet::default(); num_queues],
        },
    };

    for (offset, tc) in (0..TRAFFIC_CLASS_MAX).rev().enumerate() {
        let candidate = (num_queues - 1).checked_sub(offset);

        let hw_queue = if sr[tc] {
            let hw_queue = candidate?;
            let cap = capabilities.get(hw_queue);

            if cap.contains(TxQueueFlag::CreditShaper) {
                map.flags[tc] = TcFlag::HwCbs.into();
                map.config.queues[hw_queue] = TxQueueFlag::CreditShaper.into();
            } else if cap.contains(TxQueueFlag::StrictPriority) {
                map.config.queues[hw_queue] = TxQueueFlag::StrictPriority.into();
            } else {
                return None;
            }
            hw_queue
        } else {
            let hw_queue = if full_hw {
                map.flags[tc] = TcFlag::HwSp.into();
                candidate?
            } else {
                0
            };

            if !capabilities
                .get(hw_queue)
                .contains(TxQueueFlag::StrictPriority)
            {
                return None;
            }
            map.config.queues[hw_queue] = TxQueueFlag::StrictPriority.into();
            hw_queue
        };

        map.hw_queue[tc] = u8::try_from(hw_queue).ok()?;
    }

    Some(map)
}
