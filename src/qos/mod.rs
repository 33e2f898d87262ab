// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Per port transmit scheduling
//!
//! A [`NetQos`] owns one [`PortQos`] per port. Each scheduler tick samples the
//! port's gPTP clock, advances the time grid and walks the traffic classes from
//! the highest to the lowest, sending as much as the credit based shapers allow.
//!
//! ```
//! use netqos::port_driver::{DummyDriver, TxQueueCapabilities};
//! use netqos::ptp::{ClockId, SystemClock};
//! use netqos::qos::{NetQos, PortSettings, Priority};
//! use netqos::queue::{ring, TxDesc};
//!
//! let mut net = NetQos::new(SystemClock::new());
//! let driver = DummyDriver::new(100_000_000, TxQueueCapabilities::single_queue());
//! let port = net.add_port(driver, PortSettings::default())?;
//! net.port_up(port, 100_000_000)?;
//!
//! let (mut producer, consumer) = ring(16);
//! let handle = net.queue_connect(port, Priority::try_from(0)?, consumer)?;
//! producer.push(TxDesc::new(vec![0; 64])).unwrap();
//! handle.notify_pending();
//!
//! net.scheduler_event();
//! assert_eq!(net.port(port)?.stats().tx, 1);
//! # Ok::<(), netqos::qos::QosError>(())
//! ```
use crate::port_driver::Backpressure;
use crate::sr_class::{SrClassKind, SrPrio};
use eui48::MacAddress;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

use crate::ring_mask::SharedMask;

mod hw_map;
pub use hw_map::{map_traffic_classes, HwQueueMap, TcFlag};

mod net;
pub use net::NetQos;

mod port;
pub use port::{PortQos, PortSettings};

mod sr_scheduler;
mod stats;
pub use stats::{PortStats, QueueStats, StreamStats, TrafficClassStats};

mod traffic_class;

/// Number of traffic classes per port
pub const TRAFFIC_CLASS_MAX: usize = 8;

/// Number of queues per traffic class
pub const TRAFFIC_CLASS_QUEUE_MAX: usize = 16;

/// Number of SR classes per port
pub const SR_CLASS_MAX: usize = 2;

/// Number of 802.1Q priorities
pub const PRIORITY_MAX: u8 = 8;

/// Priority to traffic class for eight traffic classes with two SR classes,
/// see 802.1Q table 34-1
const PRIORITY_TO_TRAFFIC_CLASS: [usize; PRIORITY_MAX as usize] = [1, 0, 6, 7, 2, 3, 4, 5];

/// Errors of the configuration path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QosError {
    /// The reservation does not fit into the bandwidth left for SR traffic
    #[error("admission rejected: {requested} bit/s requested, {used} of {max} bit/s in use")]
    AdmissionRejected {
        /// Requested idle slope
        requested: u64,
        /// Bandwidth already reserved
        used: u64,
        /// Bandwidth available for reservations
        max: u64,
    },

    /// No port with this id
    #[error("no port {0}")]
    NoSuchPort(PortId),

    /// Priority is not a valid 802.1Q priority
    #[error("invalid priority {0}")]
    InvalidPriority(u8),

    /// Priority does not map to an SR class
    #[error("priority {0} does not belong to an SR class")]
    NotSrClass(u8),

    /// Priority is reserved for SR streams
    #[error("priority {0} is reserved for SR streams")]
    SrClassPriority(u8),

    /// SR class is not enabled on the port
    #[error("SR class {0} is not enabled")]
    ClassDisabled(SrClassKind),

    /// All queue slots of the traffic class are in use
    #[error("no free queue in traffic class {0}")]
    NoFreeQueue(usize),

    /// All stream slots of the SR class are in use
    #[error("no free stream slot in SR class {0}")]
    NoFreeStream(SrClassKind),

    /// Stream already has a queue
    #[error("stream {0} is already connected")]
    StreamAlreadyConnected(StreamId),

    /// Port is not up
    #[error("port {0} is down")]
    LinkDown(PortId),

    /// Scheduler tick can not be used to derive class intervals
    #[error("invalid tick period of {0} ns")]
    InvalidTickPeriod(u32),

    /// Driver could not take the frame
    #[error(transparent)]
    Backpressure(#[from] Backpressure),

    /// Handle does not refer to a connected queue (anymore)
    #[error("queue {index} of traffic class {traffic_class} is not connected")]
    UnknownQueue {
        /// Traffic class of the handle
        traffic_class: usize,
        /// Queue index of the handle
        index: usize,
    },
}

/// Index of a port within its [`NetQos`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PortId(usize);

impl PortId {
    /// Position of the port
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated 802.1Q priority (PCP)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    /// Traffic class the priority maps to
    #[must_use]
    pub fn traffic_class(self) -> usize {
        PRIORITY_TO_TRAFFIC_CLASS[usize::from(self.0)]
    }

    /// Raw priority
    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = QosError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value < PRIORITY_MAX {
            Ok(Self(value))
        } else {
            Err(QosError::InvalidPriority(value))
        }
    }
}

impl From<SrPrio> for Priority {
    fn from(prio: SrPrio) -> Self {
        Self(prio.pcp())
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 802.1Q stream id, the talker MAC address followed by a unique id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    mac: MacAddress,
    unique_id: u16,
}

impl StreamId {
    /// Stream id from its parts
    #[must_use]
    pub const fn new(mac: MacAddress, unique_id: u16) -> Self {
        Self { mac, unique_id }
    }

    /// Stream id from its eight byte wire representation
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            mac: MacAddress::new([bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]]),
            unique_id: u16::from_be_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Eight byte wire representation
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0; 8];
        bytes[..6].copy_from_slice(self.mac.as_bytes());
        bytes[6..].copy_from_slice(&self.unique_id.to_be_bytes());
        bytes
    }
}

/// Stream id could not be parsed
#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid stream id {0:?}, expected eight colon separated hex bytes")]
pub struct ParseStreamIdError(String);

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseStreamIdError(s.to_owned());
        let mut bytes = [0_u8; 8];
        let mut parts = s.split(':');

        for byte in &mut bytes {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 {
                return Err(err());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_e| err())?;
        }

        if parts.next().is_some() {
            return Err(err());
        }

        Ok(Self::from_bytes(bytes))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]
        )
    }
}

impl Serialize for StreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Stream reservation request of the SRP control plane.
///
/// An idle slope of zero withdraws the reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrConfig {
    /// Stream to (re)configure
    pub stream_id: StreamId,

    /// VLAN the stream is sent on
    pub vlan_id: u16,

    /// Priority of the stream, selects the SR class
    pub priority: Priority,

    /// Reserved bandwidth in bits/s
    pub idle_slope: u64,
}

/// VLAN tag control information for `vlan_id` and `priority`, drop eligible
/// bit cleared
#[must_use]
pub fn vlan_label(vlan_id: u16, priority: Priority) -> u16 {
    (u16::from(priority.value()) << 13) | (vlan_id & 0x0fff)
}

/// Binding of a producer to a scheduler queue.
///
/// Producers enqueue into their ring and then call
/// [`QueueHandle::notify_pending`]. The handle is also needed to disconnect.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    port: PortId,
    traffic_class: usize,
    index: usize,
    generation: u32,
    pending: Arc<SharedMask>,
    vlan_label: Arc<AtomicU16>,
    transmit_event: Arc<Notify>,
}

impl QueueHandle {
    /// Port of the queue
    #[must_use]
    pub const fn port(&self) -> PortId {
        self.port
    }

    /// Traffic class of the queue
    #[must_use]
    pub const fn traffic_class(&self) -> usize {
        self.traffic_class
    }

    /// Position of the queue within its traffic class
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Marks the queue as having packets. Must be called after enqueueing.
    pub fn notify_pending(&self) {
        self.pending.set(self.index);
    }

    /// VLAN label assigned by the stream reservation, zero if none
    #[must_use]
    pub fn vlan_label(&self) -> u16 {
        self.vlan_label.load(Ordering::Acquire)
    }

    /// Signalled when the scheduler freed room in a queue of this port
    #[must_use]
    pub fn transmit_event(&self) -> Arc<Notify> {
        Arc::clone(&self.transmit_event)
    }
}
