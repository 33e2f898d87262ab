// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Credit based shaping of an SR class and its streams
//!
//! An SR class fires once per scheduling interval, which may be shorter than
//! the port tick. On firing it computes the gPTP deadline of the interval,
//! promotes streams whose head frame is due and whose shaper has credit, and
//! serves them round robin while port, class and stream shapers allow.
use super::stats::StreamStats;
use super::traffic_class::{TrafficClass, TxContext};
use super::{StreamId, TcFlag};
use crate::port_driver::PortDriver;
use crate::ptp::PtpGrid;
use crate::rational::Rational;
use crate::ring_mask::RingMask;
use crate::shaper::{frame_bits, Shaper};
use crate::sr_class::{SrClassKind, SrPrio};
use flagset::{flags, FlagSet};
use log::trace;
use std::cmp::Ordering;
use std::num::NonZeroU32;
use std::sync::atomic::{self, AtomicU16};
use std::sync::Arc;

flags! {
    enum StreamFlag: u8 {
        Connected,
        Configured,
    }
}

#[derive(Debug, Default)]
struct StreamQueue {
    id: Option<StreamId>,
    vlan_label: Arc<AtomicU16>,
    idle_slope: u64,
    shaper: Shaper,
    flags: FlagSet<StreamFlag>,
    burst: u32,
    burst_max: u32,
}

impl StreamQueue {
    fn is_used(&self) -> bool {
        !self.flags.is_empty()
    }
}

#[derive(Debug)]
pub(super) struct SrClass {
    kind: SrClassKind,
    prio: SrPrio,
    tc: usize,
    shaper: Shaper,
    idle_slope: u64,
    stream_count: usize,
    interval: Rational,
    interval_ratio: Rational,
    tnext: Rational,
    tnext_gptp: u32,
    sched_offset: u32,
    interval_n: u32,
    scale: u32,
    pending: RingMask,
    streams: Vec<StreamQueue>,
    rebaseline: bool,
}

impl SrClass {
    /// SR class serving `prio` on traffic class `tc`, first due at `tnow`.
    ///
    /// Returns `None` if the ratio between the class interval and
    /// `port_interval` can not be represented, or if the class interval is
    /// shorter than `port_interval`. A class fires at most once per tick.
    pub(super) fn new(
        prio: SrPrio,
        kind: SrClassKind,
        tc: usize,
        port_interval: NonZeroU32,
        tnow: u32,
    ) -> Option<Self> {
        let interval = kind.sched_interval();
        let interval_ratio = interval.int_div(port_interval)?;
        if interval_ratio.int() == 0 {
            return None;
        }

        Some(Self {
            kind,
            prio,
            tc,
            shaper: Shaper::new(0),
            idle_slope: 0,
            stream_count: 0,
            interval,
            interval_ratio,
            tnext: Rational::new(tnow, 0, interval.denominator()),
            tnext_gptp: 0,
            sched_offset: 0,
            interval_n: 0,
            scale: kind.scale(),
            pending: RingMask::EMPTY,
            streams: (0..prio.stream_max())
                .map(|_| StreamQueue::default())
                .collect(),
            rebaseline: false,
        })
    }

    pub(super) const fn kind(&self) -> SrClassKind {
        self.kind
    }

    pub(super) const fn tc(&self) -> usize {
        self.tc
    }

    pub(super) const fn idle_slope(&self) -> u64 {
        self.idle_slope
    }

    pub(super) const fn stream_count(&self) -> usize {
        self.stream_count
    }

    /// Used slot carrying `id`
    pub(super) fn find_stream(&self, id: &StreamId) -> Option<usize> {
        self.streams
            .iter()
            .position(|s| s.is_used() && s.id.as_ref() == Some(id))
    }

    pub(super) fn free_stream(&self) -> Option<usize> {
        self.streams.iter().position(|s| !s.is_used())
    }

    pub(super) fn claim(&mut self, slot: usize, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(slot) {
            if !stream.is_used() {
                stream.id = Some(id);
                stream.burst = 0;
                stream.burst_max = 0;
                stream.vlan_label.store(0, atomic::Ordering::Release);
            }
        }
    }

    pub(super) fn is_connected(&self, slot: usize) -> bool {
        self.streams
            .get(slot)
            .map_or(false, |s| s.flags.contains(StreamFlag::Connected))
    }

    pub(super) fn is_configured(&self, slot: usize) -> bool {
        self.streams
            .get(slot)
            .map_or(false, |s| s.flags.contains(StreamFlag::Configured))
    }

    pub(super) fn set_connected(&mut self, slot: usize, connected: bool) {
        if let Some(stream) = self.streams.get_mut(slot) {
            if connected {
                stream.flags |= StreamFlag::Connected;
            } else {
                stream.flags -= StreamFlag::Connected;
            }
        }
    }

    pub(super) fn stream_idle_slope(&self, slot: usize) -> u64 {
        self.streams.get(slot).map_or(0, |s| s.idle_slope)
    }

    pub(super) fn vlan_label(&self, slot: usize) -> Arc<AtomicU16> {
        self.streams
            .get(slot)
            .map_or_else(Arc::default, |s| Arc::clone(&s.vlan_label))
    }

    pub(super) fn set_vlan_label(&self, slot: usize, label: u16) {
        if let Some(stream) = self.streams.get(slot) {
            stream.vlan_label.store(label, atomic::Ordering::Release);
        }
    }

    /// Removes the reservation of `slot` from the class. Returns the idle
    /// slope it had.
    pub(super) fn release(&mut self, slot: usize) -> u64 {
        let Some(stream) = self.streams.get_mut(slot) else {
            return 0;
        };
        if !stream.flags.contains(StreamFlag::Configured) {
            return 0;
        }

        self.shaper.add_rate(-i64::from(stream.shaper.rate()));
        self.idle_slope -= stream.idle_slope;
        self.stream_count -= 1;

        stream.flags -= StreamFlag::Configured;
        stream.shaper.set_rate(0);
        std::mem::take(&mut stream.idle_slope)
    }

    /// Reserves `idle_slope` bits/s for `slot`
    pub(super) fn reserve(&mut self, slot: usize, idle_slope: u64) {
        let rate = self.kind.scale_idle_slope(idle_slope);
        let Some(stream) = self.streams.get_mut(slot) else {
            return;
        };

        stream.flags |= StreamFlag::Configured;
        stream.shaper.set_rate(rate);
        stream.idle_slope = idle_slope;

        self.shaper.add_rate(i64::from(rate));
        self.idle_slope += idle_slope;
        self.stream_count += 1;
    }

    /// Discards what is queued for `slot`
    pub(super) fn flush_stream(&mut self, slot: usize, tc: &mut TrafficClass) {
        if self.is_connected(slot) {
            self.pending.clear(slot);
            tc.flush(slot);
        }
    }

    pub(super) fn forget_pending(&mut self, slot: usize) {
        self.pending.clear(slot);
    }

    pub(super) fn flush(&mut self, tc: &mut TrafficClass) {
        for slot in 0..self.streams.len() {
            self.flush_stream(slot, tc);
        }
    }

    /// Re-baselines the shapers on the next firing, the gPTP deadline of the
    /// running interval is not valid after a grid reset
    pub(super) fn request_rebaseline(&mut self) {
        self.rebaseline = true;
    }

    pub(super) fn start_tick(&mut self) {
        for stream in &mut self.streams {
            stream.burst = 0;
        }
    }

    /// Re-seeds all shapers and drops the reservations. Returns the slots
    /// that were configured with their idle slope.
    pub(super) fn reset(&mut self) -> Vec<(usize, u64)> {
        self.shaper = Shaper::new(0);
        self.interval_n = 0;
        self.idle_slope = 0;
        self.stream_count = 0;
        self.rebaseline = false;

        let mut configured = Vec::new();
        for (slot, stream) in self.streams.iter_mut().enumerate() {
            if stream.flags.contains(StreamFlag::Configured) {
                configured.push((slot, stream.idle_slope));
            }
            stream.flags -= StreamFlag::Configured;
            stream.idle_slope = 0;
            stream.shaper = Shaper::new(0);
        }
        configured
    }

    fn apply_rebaseline(&mut self) {
        if !self.rebaseline {
            return;
        }
        self.rebaseline = false;

        let now = self.interval_n;
        self.shaper.cap();
        self.shaper.rebase(now);
        for stream in &mut self.streams {
            stream.shaper.cap();
            stream.shaper.rebase(now);
        }
    }

    /// Promotes newly pending streams and accounts idle time in the stream
    /// and class shapers
    fn update(&mut self, tc: &mut TrafficClass) {
        let flushed = tc.flush_disabled();
        self.pending = self.pending.difference(flushed);

        let now = self.interval_n;
        let was_scheduled = !tc.scheduled().is_empty();

        let fresh = tc.pending().load().difference(self.pending);
        for slot in fresh.iter() {
            if !tc.queue_tx_ready(slot, self.tnext_gptp) {
                continue;
            }
            let Some(stream) = self.streams.get_mut(slot) else {
                continue;
            };

            self.pending.set(slot);
            stream.shaper.increment(now);
            // idle time does not turn into burst
            stream.shaper.cap();
            if stream.shaper.ready() {
                tc.schedule(slot);
            }
        }

        for slot in self.pending.difference(tc.scheduled()).iter() {
            let Some(stream) = self.streams.get_mut(slot) else {
                continue;
            };

            stream.shaper.increment(now);
            if stream.shaper.ready() {
                tc.schedule(slot);
            }
        }

        if was_scheduled {
            self.shaper.increment(now);
        } else if !tc.scheduled().is_empty() {
            // the class was idle
            self.shaper.increment(now);
            self.shaper.cap();
        }
    }

    /// Runs the class if its next interval is due at port time `tnow`
    pub(super) fn schedule<D: PortDriver>(
        &mut self,
        tc: &mut TrafficClass,
        ctx: &mut TxContext<'_, D>,
        grid: &PtpGrid,
        tnow: u32,
    ) {
        if self.tnext.cmp_int(tnow) == Ordering::Greater {
            return;
        }

        self.sched_offset = tnow.wrapping_sub(self.tnext.int());
        self.tnext_gptp = grid
            .now()
            .wrapping_sub(self.sched_offset)
            .wrapping_add(self.interval_ratio.int_mul(grid.period()));

        self.apply_rebaseline();
        self.update(tc);

        let hw_cbs = tc.flags.contains(TcFlag::HwCbs);

        while ctx.shaper.ready() && self.shaper.ready() {
            let Some(slot) = tc.next_scheduled() else {
                break;
            };
            let Some(stream) = self.streams.get_mut(slot) else {
                tc.unschedule(slot);
                continue;
            };

            // the stream shaper was last updated when the stream got scheduled
            stream.shaper.increment(self.interval_n);

            match tc.transmit(slot, ctx) {
                Err(_) => break,
                Ok(Some(len)) => {
                    let bits = frame_bits(len, self.scale);
                    stream.shaper.decrement(bits);
                    if !hw_cbs {
                        self.shaper.decrement(bits);
                    }
                    ctx.shaper.decrement(frame_bits(len, 1));

                    stream.burst += 1;
                    stream.burst_max = stream.burst_max.max(stream.burst);
                }
                Ok(None) => {}
            }

            if tc.recheck(slot) && tc.queue_tx_ready(slot, self.tnext_gptp) {
                if !stream.shaper.ready() {
                    tc.unschedule(slot);
                }
            } else {
                self.pending.clear(slot);
                tc.unschedule(slot);
            }
        }

        trace!(
            "class {} interval {} deadline {} credit {}",
            self.kind,
            self.interval_n,
            self.tnext_gptp,
            self.shaper.credit()
        );

        // same denominator, the sum is exact
        self.tnext = self.tnext.checked_add(&self.interval).unwrap_or_else(|| {
            Rational::from_int(self.tnext.int().wrapping_add(self.interval.int()))
        });
        self.interval_n = self.interval_n.wrapping_add(1);
    }

    pub(super) fn stream_stats(&self) -> impl Iterator<Item = StreamStats> + '_ {
        self.streams.iter().filter(|s| s.is_used()).filter_map(|s| {
            Some(StreamStats {
                id: s.id?,
                class: self.kind,
                prio: self.prio,
                idle_slope: s.idle_slope,
                connected: s.flags.contains(StreamFlag::Connected),
                configured: s.flags.contains(StreamFlag::Configured),
                vlan_label: s.vlan_label.load(atomic::Ordering::Acquire),
                credit: s.shaper.credit(),
                burst: s.burst,
                burst_max: s.burst_max,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use eui48::MacAddress;

    fn tick() -> NonZeroU32 {
        NonZeroU32::new(125_000).unwrap()
    }

    fn stream(n: u16) -> StreamId {
        StreamId::new(MacAddress::new([0, 1, 2, 3, 4, 5]), n)
    }

    #[test]
    fn test_interval_ratio() {
        let a = SrClass::new(SrPrio::High, SrClassKind::A, 7, tick(), 0).unwrap();
        assert_eq!(a.interval_ratio.int_mul(125_000), 125_000);

        let d = SrClass::new(SrPrio::Low, SrClassKind::D, 6, tick(), 0).unwrap();
        assert_eq!(d.interval_ratio.int(), 1);
        assert_eq!(d.interval_ratio.int_mul(125_000), 181_405);
    }

    #[test]
    fn test_interval_shorter_than_tick() {
        let long_tick = NonZeroU32::new(250_000).unwrap();
        assert!(SrClass::new(SrPrio::High, SrClassKind::A, 7, long_tick, 0).is_none());
        assert!(SrClass::new(SrPrio::Low, SrClassKind::B, 6, long_tick, 0).is_some());
    }

    #[test]
    fn test_reserve_and_release() {
        let mut class = SrClass::new(SrPrio::High, SrClassKind::A, 7, tick(), 0).unwrap();
        let slot = class.free_stream().unwrap();
        class.claim(slot, stream(1));

        class.reserve(slot, 10_000_000);
        assert_eq!(class.shaper.rate(), 1250);
        assert_eq!(class.shaper.credit_min(), -1250);
        assert_eq!(class.find_stream(&stream(1)), Some(slot));
        assert_eq!(class.stream_count(), 1);

        assert_eq!(class.release(slot), 10_000_000);
        assert_eq!(class.shaper.rate(), 0);
        assert_eq!(class.idle_slope(), 0);
        assert_eq!(class.release(slot), 0);
        // neither connected nor configured, so the slot is free again
        assert_eq!(class.find_stream(&stream(1)), None);
        assert_eq!(class.free_stream(), Some(slot));
    }

    #[test]
    fn test_slots_are_bounded() {
        let mut class = SrClass::new(SrPrio::Low, SrClassKind::B, 6, tick(), 0).unwrap();
        for n in 0..8 {
            let slot = class.free_stream().unwrap();
            class.claim(slot, stream(n));
            class.reserve(slot, 1_000_000);
        }
        assert_eq!(class.free_stream(), None);
        assert_eq!(class.idle_slope(), 8_000_000);
    }

    #[test]
    fn test_reset_returns_reservations() {
        let mut class = SrClass::new(SrPrio::High, SrClassKind::A, 7, tick(), 0).unwrap();
        class.claim(0, stream(1));
        class.reserve(0, 2_000_000);
        class.claim(1, stream(2));
        class.reserve(1, 3_000_000);
        class.shaper.decrement(5000);

        assert_eq!(class.reset(), vec![(0, 2_000_000), (1, 3_000_000)]);
        assert_eq!(class.shaper, Shaper::new(0));
        assert_eq!(class.idle_slope(), 0);
        assert!(!class.is_configured(0));
    }
}
