// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Traffic class with its queue slots and round robin arbitration
use super::hw_map::TcFlag;
use super::stats::{PortCounters, QueueStats, TrafficClassStats};
use super::{QosError, TRAFFIC_CLASS_QUEUE_MAX};
use crate::port_driver::{Backpressure, PortDriver};
use crate::queue::{Consumer, TxDesc};
use crate::ring_mask::{RingMask, SharedMask, MASK_BITS};
use crate::shaper::{frame_bits, Shaper};
use flagset::{flags, FlagSet};
use std::sync::Arc;

flags! {
    enum QueueFlag: u8 {
        Connected,
        Enabled,
    }
}

/// Port state a transmission touches
pub(super) struct TxContext<'a, D> {
    pub(super) driver: &'a mut D,
    pub(super) shaper: &'a mut Shaper,
    pub(super) counters: &'a mut PortCounters,
    pub(super) transmit_event: &'a mut bool,
}

#[derive(Debug, Default)]
struct QosQueue {
    flags: FlagSet<QueueFlag>,
    generation: u32,
    ring: Option<Consumer<TxDesc>>,
    stats: QueueStats,
}

impl QosQueue {
    fn has_data(&self) -> bool {
        self.ring.as_ref().map_or(false, |ring| ring.pending() > 0)
    }

    fn peek(&self) -> Option<&TxDesc> {
        self.ring.as_ref().and_then(Consumer::peek)
    }
}

/// `a` lies before `b` on the wrapping gPTP clock
const fn before(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) >= 0x8000_0000
}

pub(super) fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

#[derive(Debug)]
pub(super) struct TrafficClass {
    index: usize,
    pub(super) hw_queue: u8,
    pub(super) flags: FlagSet<TcFlag>,
    pub(super) sr_class: Option<usize>,
    queues: Vec<QosQueue>,
    scheduled: RingMask,
    disabled: RingMask,
    cursor: usize,
    tx: u64,
    pending: Arc<SharedMask>,
}

impl TrafficClass {
    pub(super) fn new(index: usize) -> Self {
        Self {
            index,
            hw_queue: 0,
            flags: FlagSet::default(),
            sr_class: None,
            queues: (0..TRAFFIC_CLASS_QUEUE_MAX)
                .map(|_| QosQueue::default())
                .collect(),
            scheduled: RingMask::EMPTY,
            disabled: RingMask::FULL,
            cursor: MASK_BITS - 1,
            tx: 0,
            pending: Arc::new(SharedMask::new()),
        }
    }

    pub(super) const fn index(&self) -> usize {
        self.index
    }

    pub(super) const fn pending(&self) -> &Arc<SharedMask> {
        &self.pending
    }

    pub(super) const fn scheduled(&self) -> RingMask {
        self.scheduled
    }

    pub(super) fn schedule(&mut self, index: usize) {
        self.scheduled.set(index);
    }

    pub(super) fn unschedule(&mut self, index: usize) {
        self.scheduled.clear(index);
    }

    pub(super) fn is_connected(&self, index: usize) -> bool {
        self.queues
            .get(index)
            .map_or(false, |q| q.flags.contains(QueueFlag::Connected))
    }

    pub(super) fn is_enabled(&self, index: usize) -> bool {
        self.queues
            .get(index)
            .map_or(false, |q| q.flags.contains(QueueFlag::Enabled))
    }

    /// First slot below `limit` without a ring
    pub(super) fn free_slot(&self, limit: usize) -> Option<usize> {
        (0..limit.min(self.queues.len())).find(|index| !self.is_connected(*index))
    }

    /// Binds `ring` to slot `index` and enables it. Returns the generation
    /// identifying this binding.
    pub(super) fn connect(&mut self, index: usize, ring: Consumer<TxDesc>) -> u32 {
        self.scheduled.clear(index);
        self.pending.clear(index);

        let queue = &mut self.queues[index];
        queue.generation = queue.generation.wrapping_add(1);
        queue.flags = QueueFlag::Connected.into();
        queue.ring = Some(ring);
        queue.stats = QueueStats::default();
        let generation = queue.generation;

        self.enable(index);
        generation
    }

    /// Checks that `index` is still bound to the ring of `generation`
    pub(super) fn validate(&self, index: usize, generation: u32) -> Result<(), QosError> {
        match self.queues.get(index) {
            Some(queue)
                if queue.flags.contains(QueueFlag::Connected) && queue.generation == generation =>
            {
                Ok(())
            }
            _ => Err(QosError::UnknownQueue {
                traffic_class: self.index,
                index,
            }),
        }
    }

    /// Unbinds slot `index`, discarding what is still queued
    pub(super) fn disconnect(&mut self, index: usize) -> usize {
        let flushed = self.flush(index);
        let queue = &mut self.queues[index];
        queue.ring = None;
        queue.flags = FlagSet::default();
        self.disabled.set(index);
        flushed
    }

    pub(super) fn enable(&mut self, index: usize) {
        if let Some(queue) = self.queues.get_mut(index) {
            queue.flags |= QueueFlag::Enabled;
            self.disabled.clear(index);
        }
    }

    pub(super) fn disable(&mut self, index: usize) {
        if let Some(queue) = self.queues.get_mut(index) {
            queue.flags -= QueueFlag::Enabled;
            self.disabled.set(index);
        }
    }

    /// Discards everything queued on slot `index`
    pub(super) fn flush(&mut self, index: usize) -> usize {
        self.pending.clear(index);
        self.scheduled.clear(index);

        let Some(queue) = self.queues.get_mut(index) else {
            return 0;
        };
        let flushed = queue.ring.as_mut().map_or(0, |ring| ring.flush());
        queue.stats.dropped += count(flushed);
        flushed
    }

    pub(super) fn flush_all(&mut self) {
        for index in 0..self.queues.len() {
            self.flush(index);
        }
    }

    /// Flushes disabled queues that producers keep feeding. Returns the
    /// flushed slots.
    pub(super) fn flush_disabled(&mut self) -> RingMask {
        let mask = self.pending.load().intersection(self.disabled);

        for index in mask.iter() {
            let flushed = self.flush(index);
            if let Some(queue) = self.queues.get_mut(index) {
                queue.stats.disabled += count(flushed);
            }
        }

        mask
    }

    pub(super) fn has_data(&self, index: usize) -> bool {
        self.queues.get(index).map_or(false, QosQueue::has_data)
    }

    /// Head of slot `index` may leave before `deadline`. Untimed frames
    /// always may.
    pub(super) fn queue_tx_ready(&self, index: usize, deadline: u32) -> bool {
        self.queues
            .get(index)
            .and_then(QosQueue::peek)
            .map_or(false, |desc| desc.ts.map_or(true, |ts| before(ts, deadline)))
    }

    /// Next scheduled slot after the round robin cursor
    pub(super) fn next_scheduled(&mut self) -> Option<usize> {
        let index = self.scheduled.next_after(self.cursor)?;
        self.cursor = index;
        Some(index)
    }

    /// Clears the pending bit of `index` and sets it again if the ring is
    /// not empty afterwards
    pub(super) fn recheck(&self, index: usize) -> bool {
        let queue = self.queues.get(index);
        self.pending
            .clear_then_recheck(index, || queue.map_or(false, QosQueue::has_data))
    }

    /// Hands the head of slot `index` to the driver.
    ///
    /// Returns the frame length, or `None` if the ring was empty. On
    /// backpressure the frame stays queued.
    pub(super) fn transmit<D: PortDriver>(
        &mut self,
        index: usize,
        ctx: &mut TxContext<'_, D>,
    ) -> Result<Option<usize>, Backpressure> {
        let hw_queue = self.hw_queue;
        let Some(queue) = self.queues.get_mut(index) else {
            return Ok(None);
        };
        let Some(ring) = queue.ring.as_mut() else {
            return Ok(None);
        };
        let Some(desc) = ring.peek() else {
            return Ok(None);
        };

        if let Err(e) = ctx.driver.transmit(hw_queue, desc) {
            queue.stats.full += 1;
            ctx.counters.tx_drop += 1;
            return Err(e);
        }

        let len = desc.len();
        drop(ring.dequeue());

        queue.stats.tx += 1;
        self.tx += 1;
        ctx.counters.tx += 1;

        if ring.available() >= ring.capacity() / 4 {
            *ctx.transmit_event = true;
        }

        Ok(Some(len))
    }

    /// Sends `desc` right away, bypassing the queue of slot `index`
    pub(super) fn transmit_direct<D: PortDriver>(
        &mut self,
        index: usize,
        desc: &TxDesc,
        ctx: &mut TxContext<'_, D>,
    ) -> Result<(), Backpressure> {
        let result = ctx.driver.transmit(self.hw_queue, desc);
        let Some(queue) = self.queues.get_mut(index) else {
            return result;
        };

        match result {
            Ok(()) => {
                queue.stats.tx += 1;
                self.tx += 1;
                ctx.counters.tx += 1;
                ctx.shaper.decrement(frame_bits(desc.len(), 1));
            }
            Err(_) => {
                queue.stats.full += 1;
                ctx.counters.tx_drop += 1;
            }
        }
        result
    }

    /// Round robin over the queues with data, limited by the port shaper only
    pub(super) fn schedule_best_effort<D: PortDriver>(&mut self, ctx: &mut TxContext<'_, D>) {
        self.flush_disabled();

        let fresh = self.pending.load().difference(self.scheduled);
        for index in fresh.iter() {
            if self.has_data(index) {
                self.scheduled.set(index);
            }
        }

        while ctx.shaper.ready() {
            let Some(index) = self.next_scheduled() else {
                break;
            };

            match self.transmit(index, ctx) {
                Err(_) => break,
                Ok(Some(len)) => ctx.shaper.decrement(frame_bits(len, 1)),
                Ok(None) => {}
            }

            if !self.recheck(index) {
                self.scheduled.clear(index);
            }
        }
    }

    pub(super) fn stats(&self) -> TrafficClassStats {
        TrafficClassStats {
            hw_queue: self.hw_queue,
            hw_sp: self.flags.contains(TcFlag::HwSp),
            hw_cbs: self.flags.contains(TcFlag::HwCbs),
            tx: self.tx,
            queues: self
                .queues
                .iter()
                .enumerate()
                .filter(|(_, q)| q.flags.contains(QueueFlag::Connected))
                .map(|(index, q)| (index, q.stats))
                .collect(),
        }
    }
}
