// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

use super::{
    PortId, PortQos, PortSettings, PortStats, Priority, QosError, QueueHandle, SrConfig, StreamId,
};
use crate::port_driver::PortDriver;
use crate::ptp::{ClockId, ClockSource};
use crate::queue::{Consumer, TxDesc};
use crate::sr_class::SrClassKind;
use log::{debug, info};

/// All ports of a device sharing one set of clocks
#[derive(Debug)]
pub struct NetQos<D, C> {
    clock: C,
    ports: Vec<PortQos<D>>,
}

impl<D: PortDriver, C: ClockSource> NetQos<D, C> {
    /// Creates an instance without ports
    #[must_use]
    pub const fn new(clock: C) -> Self {
        Self {
            clock,
            ports: Vec::new(),
        }
    }

    /// Adds a port driven by `driver`. The port starts down.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the settings can not be used for scheduling.
    pub fn add_port(&mut self, driver: D, settings: PortSettings) -> Result<PortId, QosError> {
        let id = PortId(self.ports.len());
        self.ports.push(PortQos::new(id, driver, settings)?);
        info!("port {id} added, scheduled on clock {}", settings.clock);
        Ok(id)
    }

    /// The port with `id`
    ///
    /// # Errors
    ///
    /// Will return `Err` if there is no such port.
    pub fn port(&self, id: PortId) -> Result<&PortQos<D>, QosError> {
        self.ports.get(id.index()).ok_or(QosError::NoSuchPort(id))
    }

    /// The port with `id`, mutable
    ///
    /// # Errors
    ///
    /// Will return `Err` if there is no such port.
    pub fn port_mut(&mut self, id: PortId) -> Result<&mut PortQos<D>, QosError> {
        self.ports.get_mut(id.index()).ok_or(QosError::NoSuchPort(id))
    }

    /// All ports
    pub fn ports(&self) -> impl Iterator<Item = &PortQos<D>> {
        self.ports.iter()
    }

    /// The clock source
    #[must_use]
    pub const fn clock(&self) -> &C {
        &self.clock
    }

    /// The clock source, mutable
    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    /// Runs one scheduler tick on every port that is up. Returns true if any
    /// port freed room in a queue.
    pub fn scheduler_event(&mut self) -> bool {
        let mut transmit_event = false;

        for port in self.ports.iter_mut().filter(|port| port.is_up()) {
            let reading = self.clock.gettime(port.clock());
            let ptp_now = port.clock_sample(reading);
            transmit_event |= port.schedule(ptp_now);
        }

        transmit_event
    }

    /// Brings a port up at `link_speed` bits/s
    ///
    /// # Errors
    ///
    /// Will return `Err` if there is no such port.
    pub fn port_up(&mut self, id: PortId, link_speed: u64) -> Result<(), QosError> {
        self.port_mut(id)?.up(link_speed);
        Ok(())
    }

    /// Takes a port down, discarding everything queued
    ///
    /// # Errors
    ///
    /// Will return `Err` if there is no such port.
    pub fn port_down(&mut self, id: PortId) -> Result<(), QosError> {
        self.port_mut(id)?.down();
        Ok(())
    }

    /// Connects a best effort queue, see [`PortQos::queue_connect`]
    ///
    /// # Errors
    ///
    /// Will return `Err` if there is no such port or the queue can not be
    /// connected.
    pub fn queue_connect(
        &mut self,
        id: PortId,
        priority: Priority,
        ring: Consumer<TxDesc>,
    ) -> Result<QueueHandle, QosError> {
        self.port_mut(id)?.queue_connect(priority, ring)
    }

    /// Disconnects a best effort queue
    ///
    /// # Errors
    ///
    /// Will return `Err` if the handle is stale.
    pub fn queue_disconnect(&mut self, handle: &QueueHandle) -> Result<(), QosError> {
        self.port_mut(handle.port())?.disconnect(handle)
    }

    /// Connects the ring of an SR stream, see [`PortQos::stream_connect`]
    ///
    /// # Errors
    ///
    /// Will return `Err` if there is no such port or the stream can not be
    /// connected.
    pub fn stream_connect(
        &mut self,
        id: PortId,
        kind: SrClassKind,
        stream_id: StreamId,
        ring: Consumer<TxDesc>,
    ) -> Result<QueueHandle, QosError> {
        self.port_mut(id)?.stream_connect(kind, stream_id, ring)
    }

    /// Disconnects the ring of an SR stream, its reservation is kept
    ///
    /// # Errors
    ///
    /// Will return `Err` if the handle is stale.
    pub fn stream_disconnect(&mut self, handle: &QueueHandle) -> Result<(), QosError> {
        self.port_mut(handle.port())?.disconnect(handle)
    }

    /// Applies a stream reservation, see [`PortQos::sr_config`]
    ///
    /// # Errors
    ///
    /// Will return `Err` if there is no such port or the reservation is not
    /// admitted.
    pub fn sr_config(&mut self, id: PortId, config: &SrConfig) -> Result<(), QosError> {
        self.port_mut(id)?.sr_config(config)
    }

    /// Sends a frame bypassing the queues, see [`PortQos::tx_immediate`]
    ///
    /// # Errors
    ///
    /// Will return `Err` if the frame could not be sent.
    pub fn tx_immediate(&mut self, handle: &QueueHandle, desc: &TxDesc) -> Result<(), QosError> {
        self.port_mut(handle.port())?.tx_immediate(handle, desc)
    }

    /// Counters of a port
    ///
    /// # Errors
    ///
    /// Will return `Err` if there is no such port.
    pub fn stats(&self, id: PortId) -> Result<PortStats, QosError> {
        Ok(self.port(id)?.stats())
    }

    /// Resets the grid of every port scheduled on `clock`, e.g. after the
    /// gPTP stack stepped the clock
    pub fn clock_discontinuity(&mut self, clock: ClockId) {
        debug!("discontinuity of clock {clock}");
        for port in self.ports.iter_mut().filter(|port| port.clock() == clock) {
            port.clock_discontinuity();
        }
    }
}
