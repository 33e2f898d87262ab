// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Simulated MAC draining its hardware rings at line rate
use super::clock::SimTime;
use crate::port_driver::{Backpressure, PortDriver, TxQueueCapabilities, TxQueueConfig, TxQueueFlag};
use crate::queue::TxDesc;
use crate::shaper::frame_bits;
use anyhow::{anyhow, Result};
use log::trace;
use serde::Serialize;
use std::collections::VecDeque;

/// Frames each hardware ring holds by default
pub const HW_RING_DEPTH: usize = 16;

const NS_PER_SEC: u128 = 1_000_000_000;

/// Counters of one hardware queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HwQueueStats {
    /// Frames accepted
    pub frames: u64,

    /// Wire bits of the accepted frames
    pub bits: u64,

    /// Frames refused because the ring was full
    pub backpressure: u64,

    /// Idle slope programmed into the credit based shaper
    pub idle_slope: Option<u64>,
}

/// Counters of a simulated MAC
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MacStats {
    /// Bits that left the port
    pub wire_bits: u64,

    /// Per hardware queue, index 0 has the lowest priority
    pub queues: Vec<HwQueueStats>,
}

/// A MAC with one bounded ring per hardware queue.
///
/// The rings are drained at line rate, highest queue first, whenever a frame
/// is handed over. Queues are not shaped in hardware, programmed idle slopes
/// are only recorded.
#[derive(Debug)]
pub struct SimulatedMac {
    time: SimTime,
    link_speed: u64,
    capabilities: TxQueueCapabilities,
    config: Option<TxQueueConfig>,
    ring_depth: usize,
    rings: Vec<VecDeque<u64>>,
    last_drain: u64,
    // bits scaled by 10^9 so that no fraction of a bit is lost
    wire_credit: u128,
    stats: MacStats,
}

impl SimulatedMac {
    /// MAC at `link_speed` bits/s with `capabilities`, rings of
    /// `ring_depth` frames
    #[must_use]
    pub fn new(
        time: SimTime,
        link_speed: u64,
        capabilities: TxQueueCapabilities,
        ring_depth: usize,
    ) -> Self {
        let queues = capabilities.num_queues();
        Self {
            last_drain: time.elapsed_ns(),
            time,
            link_speed,
            capabilities,
            config: None,
            ring_depth,
            rings: vec![VecDeque::with_capacity(ring_depth); queues],
            wire_credit: 0,
            stats: MacStats {
                wire_bits: 0,
                queues: vec![HwQueueStats::default(); queues],
            },
        }
    }

    /// Counters
    #[must_use]
    pub const fn stats(&self) -> &MacStats {
        &self.stats
    }

    /// Last applied queue configuration
    #[must_use]
    pub const fn config(&self) -> Option<&TxQueueConfig> {
        self.config.as_ref()
    }

    /// Frames waiting in the ring of `hw_queue`
    #[must_use]
    pub fn queued(&self, hw_queue: u8) -> usize {
        self.rings.get(usize::from(hw_queue)).map_or(0, VecDeque::len)
    }

    /// Sends what the wire had time for since the last call
    pub fn drain(&mut self) {
        let now = self.time.elapsed_ns();
        let elapsed = now.saturating_sub(self.last_drain);
        self.last_drain = now;

        self.wire_credit = self
            .wire_credit
            .saturating_add(u128::from(elapsed) * u128::from(self.link_speed));

        'wire: for ring in self.rings.iter_mut().rev() {
            while let Some(&bits) = ring.front() {
                let cost = u128::from(bits) * NS_PER_SEC;
                if cost > self.wire_credit {
                    break 'wire;
                }
                ring.pop_front();
                self.wire_credit -= cost;
                self.stats.wire_bits += bits;
            }
        }

        // an idle wire does not save up
        if self.rings.iter().all(VecDeque::is_empty) {
            self.wire_credit = 0;
        }
    }
}

impl PortDriver for SimulatedMac {
    fn transmit(&mut self, hw_queue: u8, desc: &TxDesc) -> Result<(), Backpressure> {
        self.drain();

        let index = usize::from(hw_queue);
        let (Some(ring), Some(stats)) = (self.rings.get_mut(index), self.stats.queues.get_mut(index))
        else {
            return Err(Backpressure(hw_queue));
        };

        if ring.len() >= self.ring_depth {
            stats.backpressure += 1;
            trace!("hardware queue {hw_queue} full");
            return Err(Backpressure(hw_queue));
        }

        let bits = u64::from(frame_bits(desc.len(), 1));
        ring.push_back(bits);
        stats.frames += 1;
        stats.bits += bits;
        Ok(())
    }

    fn link_speed(&self) -> u64 {
        self.link_speed
    }

    fn tx_queue_capabilities(&self) -> TxQueueCapabilities {
        self.capabilities.clone()
    }

    fn set_tx_queue_config(&mut self, config: &TxQueueConfig) -> Result<()> {
        if config.num_queues() > self.capabilities.num_queues() {
            return Err(anyhow!(
                "{} queues requested, only {} available",
                config.num_queues(),
                self.capabilities.num_queues()
            ));
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn set_tx_idle_slope(&mut self, idle_slope: u64, hw_queue: u8) -> Result<()> {
        if !self
            .capabilities
            .get(usize::from(hw_queue))
            .contains(TxQueueFlag::CreditShaper)
        {
            return Err(anyhow!("queue {hw_queue} has no credit based shaper"));
        }
        if idle_slope > self.link_speed {
            return Err(anyhow!(
                "idle slope {idle_slope} exceeds link speed {}",
                self.link_speed
            ));
        }

        let stats = self
            .stats
            .queues
            .get_mut(usize::from(hw_queue))
            .ok_or_else(|| anyhow!("no hardware queue {hw_queue}"))?;
        stats.idle_slope = Some(idle_slope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINK: u64 = 100_000_000;

    /// Wire time of a 1500 byte frame at 100 Mbit/s
    const FRAME_NS: u64 = 121_920;

    fn frame() -> TxDesc {
        TxDesc::new(vec![0; 1500])
    }

    fn two_queues() -> TxQueueCapabilities {
        TxQueueCapabilities {
            queues: vec![
                TxQueueFlag::StrictPriority.into(),
                TxQueueFlag::StrictPriority | TxQueueFlag::CreditShaper,
            ],
        }
    }

    #[test]
    fn test_backpressure_until_drained() {
        let time = SimTime::stepped();
        let mut mac = SimulatedMac::new(time.clone(), LINK, TxQueueCapabilities::single_queue(), 2);

        assert_eq!(mac.transmit(0, &frame()), Ok(()));
        assert_eq!(mac.transmit(0, &frame()), Ok(()));
        assert_eq!(mac.transmit(0, &frame()), Err(Backpressure(0)));
        assert_eq!(mac.stats().queues[0].backpressure, 1);

        time.advance(FRAME_NS - 1);
        assert_eq!(mac.transmit(0, &frame()), Err(Backpressure(0)));

        time.advance(1);
        assert_eq!(mac.transmit(0, &frame()), Ok(()));
        assert_eq!(mac.stats().queues[0].frames, 3);
        assert_eq!(mac.stats().wire_bits, 12_192);
        assert_eq!(mac.queued(0), 2);
    }

    #[test]
    fn test_line_rate() {
        let time = SimTime::stepped();
        let mut mac = SimulatedMac::new(time.clone(), LINK, TxQueueCapabilities::single_queue(), 4);

        // offer twice the line rate for 10 ms
        for _ in 0..80 {
            for _ in 0..2 {
                let _refused = mac.transmit(0, &frame());
            }
            time.advance(125_000);
        }
        mac.drain();

        let sent = mac.stats().wire_bits;
        assert!(sent <= 1_000_000, "{sent}");
        assert!(sent >= 1_000_000 - 12_192, "{sent}");
        assert!(mac.stats().queues[0].backpressure > 0);
    }

    #[test]
    fn test_idle_wire_does_not_save_up() {
        let time = SimTime::stepped();
        let mut mac = SimulatedMac::new(time.clone(), LINK, TxQueueCapabilities::single_queue(), 1);

        time.advance(10 * FRAME_NS);
        mac.drain();
        assert_eq!(mac.transmit(0, &frame()), Ok(()));
        assert_eq!(mac.transmit(0, &frame()), Err(Backpressure(0)));
    }

    #[test]
    fn test_higher_queue_first() {
        let time = SimTime::stepped();
        let mut mac = SimulatedMac::new(time.clone(), LINK, two_queues(), 4);

        assert_eq!(mac.transmit(0, &frame()), Ok(()));
        assert_eq!(mac.transmit(1, &frame()), Ok(()));
        time.advance(FRAME_NS);
        mac.drain();

        assert_eq!(mac.queued(0), 1);
        assert_eq!(mac.queued(1), 0);
        assert_eq!(mac.transmit(2, &frame()), Err(Backpressure(2)));
    }

    #[test]
    fn test_idle_slope() -> Result<()> {
        let mut mac = SimulatedMac::new(SimTime::stepped(), LINK, two_queues(), 4);
        assert!(mac.set_tx_idle_slope(1_000_000, 0).is_err());
        assert!(mac.set_tx_idle_slope(LINK + 1, 1).is_err());
        mac.set_tx_idle_slope(1_000_000, 1)?;
        assert_eq!(mac.stats().queues[1].idle_slope, Some(1_000_000));

        assert!(mac
            .set_tx_queue_config(&TxQueueCapabilities {
                queues: vec![TxQueueFlag::StrictPriority.into(); 3]
            })
            .is_err());
        mac.set_tx_queue_config(&two_queues())?;
        assert_eq!(mac.config(), Some(&two_queues()));
        Ok(())
    }
}
