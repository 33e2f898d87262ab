// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Transmit scheduler of a single port
use super::hw_map::{map_traffic_classes, TcFlag};
use super::sr_scheduler::SrClass;
use super::stats::{PortCounters, PortStats};
use super::traffic_class::{TrafficClass, TxContext};
use super::{
    vlan_label, PortId, Priority, QosError, QueueHandle, SrConfig, StreamId, TRAFFIC_CLASS_MAX,
    TRAFFIC_CLASS_QUEUE_MAX,
};
use crate::port_driver::PortDriver;
use crate::ptp::{ClockError, ClockId, GridConfig, JitterStats, PtpGrid};
use crate::queue::{Consumer, TxDesc};
use crate::shaper::Shaper;
use crate::sr_class::{SrClassConfig, SrClassKind, SrPrio};
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::atomic::AtomicU16;
use std::sync::Arc;
use tokio::sync::Notify;

/// Static parameters of a port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PortSettings {
    /// Clock the port is scheduled against
    pub clock: ClockId,

    /// SR classes enabled on the port
    pub sr_classes: SrClassConfig,

    /// Tick period and grid controller
    pub grid: GridConfig,
}

/// Bits per tick of `link_speed` bits/s, minus a 200 ppm allowance for the
/// drift between tick timer and transmit clock
fn port_rate(link_speed: u64, interval: NonZeroU32) -> u32 {
    let rate = link_speed / 1_000_000 * u64::from(interval.get()) / 1000;
    let rate = rate - (rate + 4999) / 5000;
    u32::try_from(rate).unwrap_or(u32::MAX)
}

/// Share of the link available for stream reservations
fn max_rate(link_speed: u64) -> u64 {
    link_speed / 100 * 75
}

/// Transmit scheduler state of one port
#[derive(Debug)]
pub struct PortQos<D> {
    id: PortId,
    driver: D,
    clock: ClockId,
    clock_failed: bool,
    up: bool,
    link_speed: u64,
    shaper: Shaper,
    traffic_classes: Vec<TrafficClass>,
    sr_classes: Vec<SrClass>,
    grid: PtpGrid,
    jitter: JitterStats,
    tnow: u32,
    interval: NonZeroU32,
    interval_n: u32,
    used_rate: u64,
    max_rate: u64,
    counters: PortCounters,
    transmit_event: Arc<Notify>,
}

impl<D: PortDriver> PortQos<D> {
    /// Creates the scheduler of a port that is still down
    ///
    /// # Errors
    ///
    /// Will return `Err` if the tick period is zero or longer than the
    /// scheduling interval of an enabled SR class.
    pub fn new(id: PortId, driver: D, settings: PortSettings) -> Result<Self, QosError> {
        let interval = NonZeroU32::new(settings.grid.period_ns)
            .ok_or(QosError::InvalidTickPeriod(settings.grid.period_ns))?;
        let tnow = 0;

        let mut traffic_classes: Vec<TrafficClass> =
            (0..TRAFFIC_CLASS_MAX).map(TrafficClass::new).collect();

        let mut sr_classes = Vec::with_capacity(SrPrio::ALL.len());
        for prio in SrPrio::ALL {
            let tc = Priority(prio.pcp()).traffic_class();
            let kind = settings.sr_classes.class(prio);
            let class = SrClass::new(prio, kind, tc, interval, tnow)
                .ok_or(QosError::InvalidTickPeriod(interval.get()))?;

            traffic_classes[tc].sr_class = Some(sr_classes.len());
            sr_classes.push(class);
        }

        Ok(Self {
            id,
            driver,
            clock: settings.clock,
            clock_failed: false,
            up: false,
            link_speed: 0,
            // no credit until the link is up
            shaper: Shaper::new(0),
            traffic_classes,
            sr_classes,
            grid: PtpGrid::new(settings.grid),
            jitter: JitterStats::default(),
            tnow,
            interval,
            interval_n: 0,
            used_rate: 0,
            max_rate: 0,
            counters: PortCounters::default(),
            transmit_event: Arc::new(Notify::new()),
        })
    }

    /// Id of the port
    #[must_use]
    pub const fn id(&self) -> PortId {
        self.id
    }

    /// Clock the port is scheduled against
    #[must_use]
    pub const fn clock(&self) -> ClockId {
        self.clock
    }

    /// Port is scheduled
    #[must_use]
    pub const fn is_up(&self) -> bool {
        self.up
    }

    /// The MAC driver
    #[must_use]
    pub const fn driver(&self) -> &D {
        &self.driver
    }

    /// The MAC driver, mutable
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Time grid of the port
    #[must_use]
    pub const fn grid(&self) -> &PtpGrid {
        &self.grid
    }

    /// Port level shaper
    #[must_use]
    pub const fn shaper(&self) -> &Shaper {
        &self.shaper
    }

    /// Reserved SR bandwidth in bits/s
    #[must_use]
    pub const fn used_rate(&self) -> u64 {
        self.used_rate
    }

    /// Bandwidth available for reservations in bits/s
    #[must_use]
    pub const fn max_rate(&self) -> u64 {
        self.max_rate
    }

    /// Signalled when the scheduler freed room in a queue of this port
    #[must_use]
    pub fn transmit_event(&self) -> Arc<Notify> {
        Arc::clone(&self.transmit_event)
    }

    /// Brings the port up at `link_speed` bits/s.
    ///
    /// Maps the traffic classes to the hardware queues and re-seeds the
    /// scheduler, see [`PortQos::reset`].
    pub fn up(&mut self, link_speed: u64) {
        self.map_hw_queues();
        self.reset(link_speed);
        self.up = true;
        info!(
            "port {} up at {} bit/s, {} bit/s available for streams",
            self.id, link_speed, self.max_rate
        );
    }

    /// Takes the port down, discarding everything queued. Reservations are
    /// kept and re-admitted on the next [`PortQos::up`].
    pub fn down(&mut self) {
        self.flush();
        self.reset(self.link_speed);
        self.up = false;
        info!("port {} down", self.id);
    }

    /// Re-seeds every shaper for `link_speed` bits/s and re-admits the
    /// configured streams against the new rate
    pub fn reset(&mut self, link_speed: u64) {
        self.link_speed = link_speed;
        self.shaper = Shaper::new(port_rate(link_speed, self.interval));
        self.max_rate = max_rate(link_speed);
        self.used_rate = 0;
        self.interval_n = 0;

        for class_index in 0..self.sr_classes.len() {
            let configured = self.sr_classes[class_index].reset();

            for (slot, idle_slope) in configured {
                if let Err(e) = self.configure_stream(class_index, slot, idle_slope) {
                    warn!(
                        "port {}: stream in slot {} of class {} withdrawn: {}",
                        self.id,
                        slot,
                        self.sr_classes[class_index].kind(),
                        e
                    );
                    // withdrawing always fits
                    let _withdrawn = self.configure_stream(class_index, slot, 0);
                }
            }
        }
    }

    fn flush(&mut self) {
        for tc in &mut self.traffic_classes {
            tc.flush_all();
        }
        for class in &mut self.sr_classes {
            if let Some(tc) = self.traffic_classes.get_mut(class.tc()) {
                class.flush(tc);
            }
        }
    }

    fn map_hw_queues(&mut self) {
        let mut sr = [false; TRAFFIC_CLASS_MAX];
        for class in &self.sr_classes {
            sr[class.tc()] = true;
        }

        let map = map_traffic_classes(&self.driver.tx_queue_capabilities(), &sr);
        for (index, tc) in self.traffic_classes.iter_mut().enumerate() {
            tc.hw_queue = map.hw_queue[index];
            tc.flags = map.flags[index];
        }

        info!(
            "port {}: {} hardware queue(s) configured{}",
            self.id,
            map.config.num_queues(),
            if map.is_software() {
                ", shaping in software"
            } else {
                ""
            }
        );
        for (index, tc) in self.traffic_classes.iter().enumerate() {
            debug!(
                "port {}: traffic class {} on hardware queue {} {:?}",
                self.id, index, tc.hw_queue, tc.flags
            );
        }

        if let Err(e) = self.driver.set_tx_queue_config(&map.config) {
            error!("port {}: applying hardware queue config failed: {:#}", self.id, e);
        }
    }

    /// Converts a clock reading into a grid sample. A failed read yields 0,
    /// which resets the grid.
    pub fn clock_sample(&mut self, reading: Result<u64, ClockError>) -> u32 {
        match reading {
            Ok(ns) => {
                if self.clock_failed {
                    info!("port {}: clock {} readable again", self.id, self.clock);
                    self.clock_failed = false;
                }
                u32::try_from(ns & u64::from(u32::MAX)).unwrap_or(0)
            }
            Err(e) => {
                if !self.clock_failed {
                    warn!("port {}: {}", self.id, e);
                    self.clock_failed = true;
                }
                0
            }
        }
    }

    /// Forces a grid reset on the next tick
    pub fn clock_discontinuity(&mut self) {
        debug!("port {}: clock discontinuity", self.id);
        self.grid.request_reset();
    }

    /// Runs one scheduler tick at gPTP time `ptp_now`.
    ///
    /// Returns true if room was freed in a queue, producers waiting on
    /// [`PortQos::transmit_event`] are woken in that case.
    pub fn schedule(&mut self, ptp_now: u32) -> bool {
        if self.grid.update(ptp_now) {
            for class in &mut self.sr_classes {
                class.request_rebaseline();
            }
        }
        self.jitter.sample(ptp_now);

        if self.shaper.credit() < 0 {
            self.shaper.increment(self.interval_n);
            self.shaper.cap();
        } else {
            self.shaper.rebase(self.interval_n);
        }

        for class in &mut self.sr_classes {
            class.start_tick();
        }

        let mut transmit_event = false;
        let mut ctx = TxContext {
            driver: &mut self.driver,
            shaper: &mut self.shaper,
            counters: &mut self.counters,
            transmit_event: &mut transmit_event,
        };

        // highest priority first
        for tc in self.traffic_classes.iter_mut().rev() {
            match tc.sr_class.and_then(|index| self.sr_classes.get_mut(index)) {
                Some(class) => class.schedule(tc, &mut ctx, &self.grid, self.tnow),
                None => tc.schedule_best_effort(&mut ctx),
            }
        }

        self.tnow = self.tnow.wrapping_add(self.interval.get());
        self.interval_n = self.interval_n.wrapping_add(1);

        if transmit_event {
            self.transmit_event.notify_waiters();
        }
        transmit_event
    }

    fn handle(
        &self,
        tc: &TrafficClass,
        index: usize,
        generation: u32,
        vlan_label: Arc<AtomicU16>,
    ) -> QueueHandle {
        QueueHandle {
            port: self.id,
            traffic_class: tc.index(),
            index,
            generation,
            pending: Arc::clone(tc.pending()),
            vlan_label,
            transmit_event: Arc::clone(&self.transmit_event),
        }
    }

    /// Connects a best effort queue at `priority`
    ///
    /// # Errors
    ///
    /// Will return `Err` if the priority belongs to an SR class or all queue
    /// slots of its traffic class are taken.
    pub fn queue_connect(
        &mut self,
        priority: Priority,
        ring: Consumer<TxDesc>,
    ) -> Result<QueueHandle, QosError> {
        let tc_index = priority.traffic_class();
        let tc = &mut self.traffic_classes[tc_index];

        if tc.sr_class.is_some() {
            return Err(QosError::SrClassPriority(priority.value()));
        }

        let index = tc
            .free_slot(TRAFFIC_CLASS_QUEUE_MAX)
            .ok_or(QosError::NoFreeQueue(tc_index))?;
        let generation = tc.connect(index, ring);

        debug!(
            "port {}: queue {} connected to traffic class {}",
            self.id, index, tc_index
        );

        let tc = &self.traffic_classes[tc_index];
        Ok(self.handle(tc, index, generation, Arc::default()))
    }

    /// Connects the ring of stream `id` to SR class `kind`
    ///
    /// # Errors
    ///
    /// Will return `Err` if the class is not enabled on the port, no stream
    /// slot is free or the stream already has a ring.
    pub fn stream_connect(
        &mut self,
        kind: SrClassKind,
        id: StreamId,
        ring: Consumer<TxDesc>,
    ) -> Result<QueueHandle, QosError> {
        let class_index = self
            .sr_classes
            .iter()
            .position(|class| class.kind() == kind)
            .ok_or(QosError::ClassDisabled(kind))?;
        let class = &mut self.sr_classes[class_index];

        let slot = class
            .find_stream(&id)
            .or_else(|| class.free_stream())
            .ok_or(QosError::NoFreeStream(kind))?;

        if class.is_connected(slot) {
            return Err(QosError::StreamAlreadyConnected(id));
        }

        class.claim(slot, id);
        class.set_connected(slot, true);

        let tc_index = class.tc();
        let tc = &mut self.traffic_classes[tc_index];
        let generation = tc.connect(slot, ring);
        if !class.is_configured(slot) {
            tc.disable(slot);
        }

        debug!("port {}: stream {} connected to class {}", self.id, id, kind);

        let vlan_label = class.vlan_label(slot);
        let tc = &self.traffic_classes[tc_index];
        Ok(self.handle(tc, slot, generation, vlan_label))
    }

    /// Disconnects a queue or stream, discarding what is still queued
    ///
    /// # Errors
    ///
    /// Will return `Err` if the handle is stale.
    pub fn disconnect(&mut self, handle: &QueueHandle) -> Result<(), QosError> {
        let index = handle.index;
        let tc = self
            .traffic_classes
            .get_mut(handle.traffic_class)
            .ok_or(QosError::UnknownQueue {
                traffic_class: handle.traffic_class,
                index,
            })?;
        tc.validate(index, handle.generation)?;

        if let Some(class) = tc.sr_class.and_then(|c| self.sr_classes.get_mut(c)) {
            class.flush_stream(index, tc);
            class.set_connected(index, false);
            class.forget_pending(index);
        }

        let flushed = tc.disconnect(index);
        debug!(
            "port {}: queue {} of traffic class {} disconnected, {} frame(s) discarded",
            self.id,
            index,
            tc.index(),
            flushed
        );
        Ok(())
    }

    /// Creates, updates or withdraws (idle slope 0) a stream reservation
    ///
    /// # Errors
    ///
    /// Will return `Err` if the priority is not used by an SR class, there is
    /// no free stream slot or the reservation exceeds the bandwidth left.
    pub fn sr_config(&mut self, config: &SrConfig) -> Result<(), QosError> {
        let priority = config.priority;
        let class_index = self.traffic_classes[priority.traffic_class()]
            .sr_class
            .ok_or(QosError::NotSrClass(priority.value()))?;
        let class = &self.sr_classes[class_index];

        let slot = match class.find_stream(&config.stream_id) {
            Some(slot) => slot,
            None if config.idle_slope == 0 => {
                debug!(
                    "port {}: stream {} has no reservation to withdraw",
                    self.id, config.stream_id
                );
                return Ok(());
            }
            None => {
                let slot = class
                    .free_stream()
                    .ok_or(QosError::NoFreeStream(class.kind()))?;
                self.admit(0, config.idle_slope)?;
                self.sr_classes[class_index].claim(slot, config.stream_id);
                slot
            }
        };

        self.configure_stream(class_index, slot, config.idle_slope)?;

        if config.idle_slope > 0 {
            self.sr_classes[class_index]
                .set_vlan_label(slot, vlan_label(config.vlan_id, priority));
        }

        info!(
            "port {}: stream {} reserved {} bit/s, {} of {} bit/s in use",
            self.id, config.stream_id, config.idle_slope, self.used_rate, self.max_rate
        );
        Ok(())
    }

    /// Admission control, replacing a reservation of `old` by `requested`
    fn admit(&self, old: u64, requested: u64) -> Result<(), QosError> {
        if self.used_rate.saturating_sub(old).saturating_add(requested) > self.max_rate {
            warn!(
                "port {}: rejecting {} bit/s, {} of {} bit/s in use",
                self.id, requested, self.used_rate, self.max_rate
            );
            return Err(QosError::AdmissionRejected {
                requested,
                used: self.used_rate,
                max: self.max_rate,
            });
        }
        Ok(())
    }

    fn configure_stream(
        &mut self,
        class_index: usize,
        slot: usize,
        idle_slope: u64,
    ) -> Result<(), QosError> {
        let old = self.sr_classes[class_index].stream_idle_slope(slot);
        self.admit(old, idle_slope)?;

        let class = &mut self.sr_classes[class_index];
        let tc = &mut self.traffic_classes[class.tc()];

        self.used_rate -= class.release(slot);

        if idle_slope > 0 {
            class.reserve(slot, idle_slope);
            self.used_rate += idle_slope;

            if class.is_connected(slot) {
                tc.enable(slot);
            }
        } else {
            class.flush_stream(slot, tc);

            if class.is_connected(slot) {
                tc.disable(slot);
            }
        }

        if tc.flags.contains(TcFlag::HwCbs) {
            if let Err(e) = self.driver.set_tx_idle_slope(class.idle_slope(), tc.hw_queue) {
                error!(
                    "port {}: setting idle slope {} on hardware queue {} failed: {:#}",
                    self.id,
                    class.idle_slope(),
                    tc.hw_queue,
                    e
                );
            }
        }

        Ok(())
    }

    /// Sends `desc` right away on the hardware queue of `handle`, bypassing
    /// the queue and the shapers. The frame is still accounted in the port
    /// shaper.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the port is down, the handle is stale or the
    /// driver is busy, the frame is dropped then.
    pub fn tx_immediate(&mut self, handle: &QueueHandle, desc: &TxDesc) -> Result<(), QosError> {
        if !self.up {
            return Err(QosError::LinkDown(self.id));
        }

        let tc = self
            .traffic_classes
            .get_mut(handle.traffic_class)
            .ok_or(QosError::UnknownQueue {
                traffic_class: handle.traffic_class,
                index: handle.index,
            })?;
        tc.validate(handle.index, handle.generation)?;

        let mut transmit_event = false;
        let mut ctx = TxContext {
            driver: &mut self.driver,
            shaper: &mut self.shaper,
            counters: &mut self.counters,
            transmit_event: &mut transmit_event,
        };
        tc.transmit_direct(handle.index, desc, &mut ctx)?;
        Ok(())
    }

    /// Snapshot of the counters
    #[must_use]
    pub fn stats(&self) -> PortStats {
        PortStats {
            up: self.up,
            link_speed: self.link_speed,
            tx: self.counters.tx,
            tx_drop: self.counters.tx_drop,
            used_rate: self.used_rate,
            max_rate: self.max_rate,
            streams: self.sr_classes.iter().map(SrClass::stream_count).sum(),
            grid: self.grid.stats(),
            jitter: self.jitter,
            traffic_classes: self.traffic_classes.iter().map(TrafficClass::stats).collect(),
            sr_streams: self
                .sr_classes
                .iter()
                .flat_map(SrClass::stream_stats)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_driver::{
        Backpressure, DummyDriver, MockPortDriver, TxQueueCapabilities, TxQueueFlag,
    };
    use crate::queue::{ring, Producer};
    use crate::shaper::frame_bits;
    use anyhow::anyhow;
    use eui48::MacAddress;
    use test_log::test;

    const LINK: u64 = 100_000_000;
    const TICK: u32 = 125_000;
    const T0: u32 = 1_000_000;

    fn stream_id(n: u16) -> StreamId {
        StreamId::new(MacAddress::new([0x00, 0x1b, 0xc5, 0x0a, 0x00, 0x01]), n)
    }

    fn sr_config(n: u16, priority: u8, idle_slope: u64) -> SrConfig {
        SrConfig {
            stream_id: stream_id(n),
            vlan_id: 2,
            priority: Priority(priority),
            idle_slope,
        }
    }

    fn dummy_port() -> PortQos<DummyDriver> {
        let driver = DummyDriver::new(LINK, TxQueueCapabilities::single_queue());
        PortQos::new(PortId(0), driver, PortSettings::default()).unwrap()
    }

    fn cbs_driver() -> DummyDriver {
        let sp = TxQueueFlag::StrictPriority;
        let cbs = TxQueueFlag::StrictPriority | TxQueueFlag::CreditShaper;
        DummyDriver::new(
            LINK,
            TxQueueCapabilities {
                queues: vec![sp.into(), cbs, cbs],
            },
        )
    }

    fn frame(len: usize) -> TxDesc {
        TxDesc::new(vec![0; len])
    }

    fn top_up(producer: &mut Producer<TxDesc>, handle: &QueueHandle, len: usize) {
        while producer.push(frame(len)).is_ok() {}
        handle.notify_pending();
    }

    #[test]
    fn test_rates_follow_link_speed() {
        let mut port = dummy_port();
        assert_eq!(port.shaper().credit_min(), 0);

        port.up(LINK);
        // 12500 bits per tick minus 200 ppm
        assert_eq!(port.shaper().rate(), 12_497);
        assert_eq!(port.max_rate(), 75_000_000);

        port.up(1_000_000_000);
        assert_eq!(port.shaper().rate(), 124_975);
        assert_eq!(port.max_rate(), 750_000_000);
    }

    #[test]
    fn test_zero_tick_rejected() {
        let settings = PortSettings {
            grid: GridConfig {
                period_ns: 0,
                ..GridConfig::default()
            },
            ..PortSettings::default()
        };
        let driver = DummyDriver::new(LINK, TxQueueCapabilities::single_queue());
        assert_eq!(
            PortQos::new(PortId(0), driver, settings).unwrap_err(),
            QosError::InvalidTickPeriod(0)
        );
    }

    #[test]
    fn test_tick_longer_than_class_interval_rejected() {
        let settings = PortSettings {
            grid: GridConfig {
                period_ns: 250_000,
                ..GridConfig::default()
            },
            ..PortSettings::default()
        };
        let driver = DummyDriver::new(LINK, TxQueueCapabilities::single_queue());
        assert_eq!(
            PortQos::new(PortId(0), driver, settings).unwrap_err(),
            QosError::InvalidTickPeriod(250_000)
        );

        // class B and E intervals are multiples of the tick
        let settings = PortSettings {
            sr_classes: SrClassConfig::new(SrClassKind::B, SrClassKind::E).unwrap(),
            ..settings
        };
        let driver = DummyDriver::new(LINK, TxQueueCapabilities::single_queue());
        assert!(PortQos::new(PortId(0), driver, settings).is_ok());
    }

    #[test]
    fn test_admission_limit() -> Result<(), QosError> {
        let mut port = dummy_port();
        port.up(LINK);

        port.sr_config(&sr_config(1, 3, 50_000_000))?;
        port.sr_config(&sr_config(2, 2, 25_000_000))?;
        assert_eq!(port.used_rate(), 75_000_000);

        assert_eq!(
            port.sr_config(&sr_config(3, 3, 1)),
            Err(QosError::AdmissionRejected {
                requested: 1,
                used: 75_000_000,
                max: 75_000_000
            })
        );
        assert_eq!(port.used_rate(), 75_000_000);
        assert_eq!(port.stats().sr_streams.len(), 2);

        // shrinking an existing reservation frees room
        port.sr_config(&sr_config(1, 3, 40_000_000))?;
        port.sr_config(&sr_config(3, 3, 10_000_000))?;
        assert_eq!(port.used_rate(), 75_000_000);
        assert_eq!(port.stats().streams, 3);
        Ok(())
    }

    #[test]
    fn test_withdraw() -> Result<(), QosError> {
        let mut port = dummy_port();
        port.up(LINK);

        port.sr_config(&sr_config(1, 3, 10_000_000))?;
        port.sr_config(&sr_config(1, 3, 0))?;
        assert_eq!(port.used_rate(), 0);
        assert!(port.stats().sr_streams.is_empty());

        // unknown streams are silently accepted
        port.sr_config(&sr_config(9, 3, 0))?;
        Ok(())
    }

    #[test]
    fn test_sr_config_needs_sr_priority() {
        let mut port = dummy_port();
        port.up(LINK);
        assert_eq!(
            port.sr_config(&sr_config(1, 0, 1000)),
            Err(QosError::NotSrClass(0))
        );
    }

    #[test]
    fn test_vlan_label_published() -> Result<(), QosError> {
        let mut port = dummy_port();
        port.up(LINK);

        let (_producer, consumer) = ring(8);
        let handle = port.stream_connect(SrClassKind::A, stream_id(1), consumer)?;
        assert_eq!(handle.vlan_label(), 0);

        port.sr_config(&sr_config(1, 3, 1_000_000))?;
        assert_eq!(handle.vlan_label(), (3 << 13) | 2);
        Ok(())
    }

    #[test]
    fn test_stream_connect_errors() -> Result<(), QosError> {
        let mut port = dummy_port();
        port.up(LINK);

        let (_p, consumer) = ring(8);
        assert_eq!(
            port.stream_connect(SrClassKind::C, stream_id(1), consumer)
                .unwrap_err(),
            QosError::ClassDisabled(SrClassKind::C)
        );

        let (_p, consumer) = ring(8);
        port.stream_connect(SrClassKind::A, stream_id(1), consumer)?;
        let (_p, consumer) = ring(8);
        assert_eq!(
            port.stream_connect(SrClassKind::A, stream_id(1), consumer)
                .unwrap_err(),
            QosError::StreamAlreadyConnected(stream_id(1))
        );

        let mut producers = Vec::new();
        for n in 2..=8 {
            let (p, consumer) = ring(8);
            port.stream_connect(SrClassKind::A, stream_id(n), consumer)?;
            producers.push(p);
        }
        let (_p, consumer) = ring(8);
        assert_eq!(
            port.stream_connect(SrClassKind::A, stream_id(9), consumer)
                .unwrap_err(),
            QosError::NoFreeStream(SrClassKind::A)
        );
        Ok(())
    }

    #[test]
    fn test_queue_connect_rejects_sr_priority() {
        let mut port = dummy_port();
        let (_p, consumer) = ring(8);
        assert_eq!(
            port.queue_connect(Priority(3), consumer).unwrap_err(),
            QosError::SrClassPriority(3)
        );
    }

    #[test]
    fn test_queue_slots_exhausted() -> Result<(), QosError> {
        let mut port = dummy_port();
        let mut producers = Vec::new();
        for _ in 0..TRAFFIC_CLASS_QUEUE_MAX {
            let (p, consumer) = ring(2);
            port.queue_connect(Priority(0), consumer)?;
            producers.push(p);
        }
        let (_p, consumer) = ring(2);
        assert_eq!(
            port.queue_connect(Priority(0), consumer).unwrap_err(),
            QosError::NoFreeQueue(1)
        );
        Ok(())
    }

    #[test]
    fn test_unconfigured_stream_is_flushed() -> Result<(), QosError> {
        let mut port = dummy_port();
        port.up(LINK);

        let (mut producer, consumer) = ring(8);
        let handle = port.stream_connect(SrClassKind::A, stream_id(1), consumer)?;
        top_up(&mut producer, &handle, 64);

        port.schedule(T0);
        assert_eq!(port.stats().tx, 0);
        assert_eq!(producer.available(), 8);
        Ok(())
    }

    #[test]
    fn test_stream_rate_is_shaped() -> Result<(), QosError> {
        let mut port = dummy_port();
        port.up(LINK);
        port.sr_config(&sr_config(1, 3, 10_000_000))?;

        let (mut producer, consumer) = ring(64);
        let handle = port.stream_connect(SrClassKind::A, stream_id(1), consumer)?;

        let ticks = 8000;
        for k in 0..ticks {
            top_up(&mut producer, &handle, 64);
            port.schedule(T0 + k * TICK);

            let sent = i64::try_from(port.stats().tx).unwrap() * i64::from(frame_bits(64, 1));
            let allowed = 1250 * i64::from(k + 1);
            assert!(sent <= allowed + 1954, "tick {k}: {sent} bits sent");
        }

        let sent = i64::try_from(port.stats().tx).unwrap() * i64::from(frame_bits(64, 1));
        assert!(sent >= 1250 * i64::from(ticks) - 704, "{sent} bits sent");
        assert!(port.stats().sr_streams[0].burst_max <= 2);
        Ok(())
    }

    #[test]
    fn test_streams_in_class_served_round_robin() -> Result<(), QosError> {
        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);

        let mut driver = MockPortDriver::new();
        driver
            .expect_tx_queue_capabilities()
            .returning(TxQueueCapabilities::single_queue);
        driver.expect_set_tx_queue_config().returning(|_| Ok(()));
        driver.expect_transmit().returning(move |_, desc| {
            log.lock().unwrap().push(desc.frame[0]);
            Ok(())
        });

        let mut port = PortQos::new(PortId(0), driver, PortSettings::default())?;
        port.up(LINK);

        let mut talkers = Vec::new();
        for n in 1..=3 {
            port.sr_config(&sr_config(n, 3, 20_000_000))?;
            let (producer, consumer) = ring(64);
            let handle = port.stream_connect(SrClassKind::A, stream_id(n), consumer)?;
            talkers.push((u8::try_from(n).unwrap(), producer, handle));
        }

        for k in 0..4000 {
            for (marker, producer, handle) in &mut talkers {
                while producer.push(TxDesc::new(vec![*marker; 64])).is_ok() {}
                handle.notify_pending();
            }
            port.schedule(T0 + k * TICK);
        }

        let sent = sent.lock().unwrap();
        assert!(sent.len() > 30_000, "{} frames sent", sent.len());

        // every pass visits each stream once
        let mut first = sent[..3].to_vec();
        first.sort_unstable();
        assert_eq!(first, [1, 2, 3]);
        for (i, window) in sent.windows(4).enumerate() {
            assert_eq!(window[0], window[3], "frame {i} breaks the rotation");
        }

        let per_stream: Vec<u64> = port
            .stats()
            .traffic_classes[7]
            .queues
            .values()
            .map(|q| q.tx)
            .filter(|&tx| tx > 0)
            .collect();
        assert_eq!(per_stream.len(), 3);
        let most = per_stream.iter().max().unwrap();
        let least = per_stream.iter().min().unwrap();
        assert!(most - least <= 1, "{per_stream:?}");
        Ok(())
    }

    #[test]
    fn test_presentation_time_gates() -> Result<(), QosError> {
        let mut port = dummy_port();
        port.up(LINK);
        port.sr_config(&sr_config(1, 3, 10_000_000))?;

        let (mut producer, consumer) = ring(8);
        let handle = port.stream_connect(SrClassKind::A, stream_id(1), consumer)?;
        producer
            .push(TxDesc::with_timestamp(vec![0; 64], T0 + 8 * TICK))
            .unwrap();
        handle.notify_pending();

        for k in 0..8 {
            port.schedule(T0 + k * TICK);
            assert_eq!(port.stats().tx, 0, "sent early in tick {k}");
        }
        port.schedule(T0 + 8 * TICK);
        assert_eq!(port.stats().tx, 1);
        Ok(())
    }

    #[test]
    fn test_sr_class_preempts_best_effort() -> Result<(), QosError> {
        let mut port = dummy_port();
        port.up(LINK);
        port.sr_config(&sr_config(1, 3, 50_000_000))?;

        let (mut sr_producer, consumer) = ring(64);
        let sr = port.stream_connect(SrClassKind::A, stream_id(1), consumer)?;
        let (mut be_producer, consumer) = ring(64);
        let be = port.queue_connect(Priority(0), consumer)?;

        for k in 0..100 {
            top_up(&mut sr_producer, &sr, 1500);
            top_up(&mut be_producer, &be, 1500);
            port.schedule(T0 + k * TICK);
        }

        let stats = port.stats();
        let sr_tx = stats.traffic_classes[7].tx;
        let be_tx = stats.traffic_classes[1].tx;
        // 6250 of 12497 bits per tick are reserved, a frame costs 12192 bits
        assert!(sr_tx >= 45, "{sr_tx}");
        assert!(be_tx >= 45, "{be_tx}");
        assert!(sr_tx + be_tx <= 105);
        Ok(())
    }

    #[test]
    fn test_disconnect_discards_and_frees_slot() -> Result<(), QosError> {
        let mut port = dummy_port();
        let (mut producer, consumer) = ring(8);
        let handle = port.queue_connect(Priority(0), consumer)?;
        top_up(&mut producer, &handle, 64);

        port.disconnect(&handle)?;
        assert_eq!(producer.available(), 8);
        assert!(matches!(
            port.disconnect(&handle),
            Err(QosError::UnknownQueue { .. })
        ));

        let (_p, consumer) = ring(8);
        let again = port.queue_connect(Priority(0), consumer)?;
        assert_eq!(again.index(), handle.index());
        Ok(())
    }

    #[test]
    fn test_stream_disconnect_keeps_reservation() -> Result<(), QosError> {
        let mut port = dummy_port();
        port.up(LINK);
        port.sr_config(&sr_config(1, 3, 10_000_000))?;

        let (_p, consumer) = ring(8);
        let handle = port.stream_connect(SrClassKind::A, stream_id(1), consumer)?;
        port.disconnect(&handle)?;
        assert_eq!(port.used_rate(), 10_000_000);

        let (_p, consumer) = ring(8);
        let handle = port.stream_connect(SrClassKind::A, stream_id(1), consumer)?;
        assert_eq!(handle.index(), 0);
        assert_eq!(handle.vlan_label(), (3 << 13) | 2);
        Ok(())
    }

    #[test]
    fn test_reset_readmits_streams() -> Result<(), QosError> {
        let mut port = dummy_port();
        port.up(1_000_000_000);
        port.sr_config(&sr_config(1, 3, 50_000_000))?;
        port.sr_config(&sr_config(2, 3, 100_000_000))?;

        port.up(LINK);
        assert_eq!(port.used_rate(), 50_000_000);
        let stats = port.stats();
        assert_eq!(stats.streams, 1);
        assert!(stats.sr_streams.iter().all(|s| s.id == stream_id(1)));
        Ok(())
    }

    #[test]
    fn test_down_flushes_and_keeps_reservations() -> Result<(), QosError> {
        let mut port = dummy_port();
        port.up(LINK);
        port.sr_config(&sr_config(1, 3, 10_000_000))?;

        let (mut producer, consumer) = ring(8);
        let handle = port.queue_connect(Priority(0), consumer)?;
        top_up(&mut producer, &handle, 64);

        port.down();
        assert!(!port.is_up());
        assert_eq!(producer.available(), 8);
        assert_eq!(port.used_rate(), 10_000_000);
        Ok(())
    }

    #[test]
    fn test_hw_cbs_mapping_programs_idle_slope() -> Result<(), QosError> {
        let mut port = PortQos::new(PortId(0), cbs_driver(), PortSettings::default())?;
        port.up(LINK);

        port.sr_config(&sr_config(1, 3, 10_000_000))?;
        port.sr_config(&sr_config(2, 3, 5_000_000))?;
        port.sr_config(&sr_config(3, 2, 1_000_000))?;

        let driver = port.driver();
        assert_eq!(driver.config().map(TxQueueCapabilities::num_queues), Some(3));
        assert_eq!(driver.idle_slope(2), Some(15_000_000));
        assert_eq!(driver.idle_slope(1), Some(1_000_000));

        let stats = port.stats();
        assert!(stats.traffic_classes[7].hw_cbs);
        assert_eq!(stats.traffic_classes[7].hw_queue, 2);
        assert_eq!(stats.traffic_classes[0].hw_queue, 0);
        Ok(())
    }

    #[test]
    fn test_hw_cbs_class_sends_on_its_queue() -> Result<(), QosError> {
        let mut port = PortQos::new(PortId(0), cbs_driver(), PortSettings::default())?;
        port.up(LINK);
        port.sr_config(&sr_config(1, 3, 10_000_000))?;

        let (mut producer, consumer) = ring(8);
        let handle = port.stream_connect(SrClassKind::A, stream_id(1), consumer)?;
        top_up(&mut producer, &handle, 64);
        port.schedule(T0);

        assert!(port.driver().transmitted(2) > 0);
        assert_eq!(port.driver().transmitted(0), 0);
        Ok(())
    }

    #[test]
    fn test_idle_slope_errors_are_logged() -> Result<(), QosError> {
        let mut driver = MockPortDriver::new();
        driver.expect_tx_queue_capabilities().returning(|| {
            TxQueueCapabilities {
                queues: vec![
                    TxQueueFlag::StrictPriority.into(),
                    TxQueueFlag::CreditShaper.into(),
                    TxQueueFlag::CreditShaper.into(),
                ],
            }
        });
        driver.expect_set_tx_queue_config().returning(|_| Ok(()));
        driver
            .expect_set_tx_idle_slope()
            .times(1)
            .returning(|_, _| Err(anyhow!("out of range")));

        let mut port = PortQos::new(PortId(0), driver, PortSettings::default())?;
        port.up(LINK);
        port.sr_config(&sr_config(1, 3, 10_000_000))?;
        assert_eq!(port.used_rate(), 10_000_000);
        Ok(())
    }

    #[test]
    fn test_backpressure_counts_drop() -> Result<(), QosError> {
        let mut driver = MockPortDriver::new();
        driver
            .expect_tx_queue_capabilities()
            .returning(TxQueueCapabilities::single_queue);
        driver.expect_set_tx_queue_config().returning(|_| Ok(()));
        driver
            .expect_transmit()
            .returning(|queue, _| Err(Backpressure(queue)));

        let mut port = PortQos::new(PortId(0), driver, PortSettings::default())?;
        port.up(LINK);

        let (mut producer, consumer) = ring(8);
        let handle = port.queue_connect(Priority(0), consumer)?;
        top_up(&mut producer, &handle, 64);
        port.schedule(T0);

        let stats = port.stats();
        assert_eq!((stats.tx, stats.tx_drop), (0, 1));
        assert_eq!(producer.available(), 0);
        Ok(())
    }

    #[test]
    fn test_tx_immediate() -> Result<(), QosError> {
        let mut port = dummy_port();
        let (_p, consumer) = ring(8);
        let handle = port.queue_connect(Priority(0), consumer)?;
        assert_eq!(
            port.tx_immediate(&handle, &frame(64)),
            Err(QosError::LinkDown(PortId(0)))
        );

        port.up(LINK);
        port.tx_immediate(&handle, &frame(64))?;
        assert_eq!(port.stats().tx, 1);
        assert_eq!(port.shaper().credit(), -704);
        Ok(())
    }

    #[test]
    fn test_clock_failure_resets_grid() {
        let mut port = dummy_port();
        port.up(LINK);

        let sample = port.clock_sample(Ok(u64::from(u32::MAX) + 1 + u64::from(T0)));
        assert_eq!(sample, T0);
        port.schedule(sample);
        port.schedule(T0 + TICK);

        let sample = port.clock_sample(Err(ClockError::Unavailable(ClockId::Gptp0)));
        assert_eq!(sample, 0);
        port.schedule(sample);
        assert_eq!(port.grid().stats().resets, 2);
    }

    #[test]
    fn test_transmit_event_wakes_waiters() -> Result<(), QosError> {
        let mut port = dummy_port();
        port.up(LINK);

        let (mut producer, consumer) = ring(4);
        let handle = port.queue_connect(Priority(0), consumer)?;
        top_up(&mut producer, &handle, 64);

        let event = handle.transmit_event();
        let notified = event.notified();
        tokio::pin!(notified);
        assert!(tokio_test::task::spawn(notified.as_mut()).poll().is_pending());

        assert!(port.schedule(T0));
        assert!(tokio_test::task::spawn(notified.as_mut()).poll().is_ready());
        Ok(())
    }
}
