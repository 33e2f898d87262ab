// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Diagnostic counters
use super::StreamId;
use crate::ptp::{GridStats, JitterStats};
use crate::sr_class::{SrClassKind, SrPrio};
use serde::Serialize;
use std::collections::BTreeMap;

/// Counters of one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Frames handed to the driver
    pub tx: u64,

    /// Frames discarded by a flush
    pub dropped: u64,

    /// Transmit attempts refused because the hardware ring was full
    pub full: u64,

    /// Frames discarded because the queue was disabled
    pub disabled: u64,
}

/// Counters and hardware mapping of one traffic class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrafficClassStats {
    /// Hardware queue the class transmits on
    pub hw_queue: u8,

    /// Strict priority selection is done by the hardware
    pub hw_sp: bool,

    /// Credit based shaping is done by the hardware
    pub hw_cbs: bool,

    /// Frames sent by the class
    pub tx: u64,

    /// Connected queues by index
    pub queues: BTreeMap<usize, QueueStats>,
}

/// State of one SR stream slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Stream id
    pub id: StreamId,

    /// SR class of the stream
    pub class: SrClassKind,

    /// Role of the class
    pub prio: SrPrio,

    /// Reserved bandwidth in bits/s
    pub idle_slope: u64,

    /// A socket is bound
    pub connected: bool,

    /// Bandwidth is reserved
    pub configured: bool,

    /// VLAN label the socket tags frames with
    pub vlan_label: u16,

    /// Stream shaper credit
    pub credit: i32,

    /// Frames sent in the last tick
    pub burst: u32,

    /// Most frames sent in one tick
    pub burst_max: u32,
}

/// Snapshot of a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortStats {
    /// Link is up and the port is scheduled
    pub up: bool,

    /// Link speed in bits/s
    pub link_speed: u64,

    /// Frames sent
    pub tx: u64,

    /// Transmit attempts refused by the driver
    pub tx_drop: u64,

    /// Reserved SR bandwidth in bits/s
    pub used_rate: u64,

    /// Bandwidth available for reservations in bits/s
    pub max_rate: u64,

    /// Number of configured streams
    pub streams: usize,

    /// Time grid
    pub grid: GridStats,

    /// Tick sampling jitter
    pub jitter: JitterStats,

    /// Traffic classes, index 0 has the lowest priority
    pub traffic_classes: Vec<TrafficClassStats>,

    /// Used stream slots
    pub sr_streams: Vec<StreamStats>,
}

#[derive(Debug, Clone, Copy, Default)]
pub(super) struct PortCounters {
    pub(super) tx: u64,
    pub(super) tx_drop: u64,
}
