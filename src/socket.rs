// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Producer side of a scheduler queue
//!
//! ```
//! use netqos::port_driver::{DummyDriver, TxQueueCapabilities};
//! use netqos::ptp::SystemClock;
//! use netqos::qos::{NetQos, PortSettings, Priority};
//! use netqos::queue::{ring, TxDesc};
//! use netqos::socket::TxSocket;
//!
//! let mut net = NetQos::new(SystemClock::new());
//! let driver = DummyDriver::new(1_000_000_000, TxQueueCapabilities::single_queue());
//! let port = net.add_port(driver, PortSettings::default())?;
//!
//! let (producer, consumer) = ring(8);
//! let handle = net.queue_connect(port, Priority::try_from(0)?, consumer)?;
//! let mut socket = TxSocket::new(producer, handle);
//! assert!(socket.send(TxDesc::new(vec![0; 60])).is_ok());
//! assert_eq!(socket.available(), 7);
//! # Ok::<(), netqos::qos::QosError>(())
//! ```
use crate::qos::QueueHandle;
use crate::queue::{Producer, TxDesc};

/// A ring producer bound to its scheduler queue
#[derive(Debug)]
pub struct TxSocket {
    producer: Producer<TxDesc>,
    handle: QueueHandle,
}

impl TxSocket {
    /// Bundles `producer` with the handle its consumer was connected with
    #[must_use]
    pub const fn new(producer: Producer<TxDesc>, handle: QueueHandle) -> Self {
        Self { producer, handle }
    }

    /// Queues a frame for the scheduler.
    ///
    /// Frames of SR streams are tagged by the caller with
    /// [`TxSocket::vlan_label`].
    ///
    /// # Errors
    ///
    /// Will return the frame if the ring is full.
    pub fn send(&mut self, desc: TxDesc) -> Result<(), TxDesc> {
        self.producer.push(desc)?;
        self.handle.notify_pending();
        Ok(())
    }

    /// Free slots in the ring
    #[must_use]
    pub fn available(&self) -> usize {
        self.producer.available()
    }

    /// VLAN label of the stream reservation, zero if there is none
    #[must_use]
    pub fn vlan_label(&self) -> u16 {
        self.handle.vlan_label()
    }

    /// The queue handle, needed to disconnect
    #[must_use]
    pub const fn handle(&self) -> &QueueHandle {
        &self.handle
    }

    /// Waits until the ring has room for at least one frame
    pub async fn wait_writable(&self) {
        let event = self.handle.transmit_event();
        loop {
            let notified = event.notified();
            if self.available() > 0 {
                return;
            }
            notified.await;
        }
    }

    /// Splits the socket into its parts
    #[must_use]
    pub fn into_parts(self) -> (Producer<TxDesc>, QueueHandle) {
        (self.producer, self.handle)
    }
}
