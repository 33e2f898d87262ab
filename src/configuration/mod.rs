// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Provides the scheduler and port configuration
//!
//! ```
//! use netqos::configuration::{Configuration, YAMLConfiguration};
//! # #[path = "doctest.rs"]
//! # mod doctest;
//! # let tmpfile = doctest::generate_example_yaml();
//! # let filepath = tmpfile.path();
//! use std::fs::File;
//!
//! let mut yaml_config = YAMLConfiguration::new();
//! yaml_config.read(File::open(filepath)?)?;
//! let ports = yaml_config.get_port_names()?;
//! let config = yaml_config.get_port_config(&ports[0])?;
//! assert_eq!(config.link_speed_bps, 100_000_000);
//! # Ok::<(), anyhow::Error>(())
//! ```
use crate::pi::PiGains;
use crate::port_driver::{TxQueueCapabilities, TxQueueFlag};
use crate::ptp::{ClockId, GridConfig, DEFAULT_PERIOD_NS};
use crate::qos::{PortSettings, Priority, SrConfig, StreamId};
use crate::sr_class::{SrClassConfig, SrPrio};
use anyhow::Result;
use flagset::FlagSet;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

/// Configuration format version understood by this crate
pub const VERSION: &str = "0.1.0";

/// Settings shared by all ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerConfig {
    /// Scheduling interval in nanoseconds
    pub tick_period_ns: u32,

    /// SR classes serving the high and low roles
    pub sr_classes: SrClassConfig,

    /// Gains of the grid controller
    pub pi: PiGains,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_period_ns: DEFAULT_PERIOD_NS,
            sr_classes: SrClassConfig::default(),
            pi: PiGains::default(),
        }
    }
}

impl SchedulerConfig {
    /// Port settings for a port scheduled against `clock`
    #[must_use]
    pub const fn port_settings(&self, clock: ClockId) -> PortSettings {
        PortSettings {
            clock,
            sr_classes: self.sr_classes,
            grid: GridConfig {
                period_ns: self.tick_period_ns,
                gains: self.pi,
            },
        }
    }
}

/// Capability of a hardware transmit queue as written in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueCapability {
    /// Strict priority selection
    StrictPriority,

    /// Credit based shaper
    CreditShaper,
}

impl From<QueueCapability> for TxQueueFlag {
    fn from(capability: QueueCapability) -> Self {
        match capability {
            QueueCapability::StrictPriority => Self::StrictPriority,
            QueueCapability::CreditShaper => Self::CreditShaper,
        }
    }
}

/// An SR stream sent by a simulated talker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    /// Stream id
    pub id: StreamId,

    /// SR class role of the stream
    pub class: SrPrio,

    /// VLAN the stream is sent on
    pub vlan_id: u16,

    /// Reserved bandwidth in bits/s
    pub idle_slope_bps: u64,

    /// Size of each frame in bytes
    pub frame_size: usize,

    /// Frames are timestamped this far into the future if set
    #[serde(default)]
    pub presentation_offset_ns: Option<u32>,
}

impl StreamConfig {
    /// Reservation request for the stream
    #[must_use]
    pub fn sr_config(&self) -> SrConfig {
        SrConfig {
            stream_id: self.id,
            vlan_id: self.vlan_id,
            priority: self.priority(),
            idle_slope: self.idle_slope_bps,
        }
    }

    /// Priority of the SR class role
    #[must_use]
    pub fn priority(&self) -> Priority {
        Priority::from(self.class)
    }
}

/// Best effort traffic sent by a simulated talker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BestEffortConfig {
    /// Priority of the frames
    pub priority: Priority,

    /// Size of each frame in bytes
    pub frame_size: usize,

    /// Frames offered per tick
    pub frames_per_tick: u32,
}

/// A port and the traffic offered to it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortConfig {
    /// Link speed in bits/s
    pub link_speed_bps: u64,

    /// Clock the port is scheduled against
    #[serde(default)]
    pub clock: ClockId,

    /// Capabilities of the hardware transmit queues
    #[serde(default)]
    pub tx_queues: Option<Vec<Vec<QueueCapability>>>,

    /// SR streams
    #[serde(default)]
    pub streams: Vec<StreamConfig>,

    /// Best effort queues
    #[serde(default)]
    pub best_effort: Vec<BestEffortConfig>,
}

impl PortConfig {
    /// Hardware queues of the port, a single strict priority queue if none
    /// are configured
    #[must_use]
    pub fn tx_queue_capabilities(&self) -> TxQueueCapabilities {
        self.tx_queues.as_ref().map_or_else(
            TxQueueCapabilities::single_queue,
            |queues| TxQueueCapabilities {
                queues: queues
                    .iter()
                    .map(|caps| {
                        caps.iter()
                            .fold(FlagSet::default(), |flags, cap| flags | TxQueueFlag::from(*cap))
                    })
                    .collect(),
            },
        )
    }
}

/// A step of the simulated clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClockJump {
    /// Time of the step since the start of the simulation
    pub at_ms: u64,

    /// Size of the step
    pub offset_ns: i64,
}

/// Parameters of a simulation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SimulationConfig {
    /// Simulated time
    pub duration_ms: u64,

    /// Uniform jitter of the tick sampling, in both directions
    pub jitter_ns: u32,

    /// Deviation of the tick timer from gPTP time
    pub drift_ppm: i32,

    /// Seed of the jitter generator
    pub seed: u64,

    /// Optional clock step
    pub clock_jump: Option<ClockJump>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            duration_ms: 1000,
            jitter_ns: 0,
            drift_ppm: 0,
            seed: 1,
            clock_jump: None,
        }
    }
}

/// Source of the configuration
#[cfg_attr(test, automock)]
pub trait Configuration {
    /// Settings shared by all ports
    ///
    /// # Errors
    ///
    /// Will return `Err` if the configuration could not be provided.
    fn get_scheduler_config(&mut self) -> Result<SchedulerConfig>;

    /// Names of the configured ports, sorted
    ///
    /// # Errors
    ///
    /// Will return `Err` if the configuration could not be provided.
    fn get_port_names(&mut self) -> Result<Vec<String>>;

    /// Configuration of port `port`
    ///
    /// # Errors
    ///
    /// Will return `Err` if the port is not configured.
    fn get_port_config(&mut self, port: &str) -> Result<PortConfig>;

    /// Parameters of a simulation run
    ///
    /// # Errors
    ///
    /// Will return `Err` if the configuration could not be provided.
    fn get_simulation_config(&mut self) -> Result<SimulationConfig>;
}

mod yaml;
pub use yaml::YAMLConfiguration;
