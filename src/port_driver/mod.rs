// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Interface to the MAC of a port
//!
//! ```
//! use netqos::port_driver::{DummyDriver, PortDriver, TxQueueCapabilities};
//! use netqos::queue::TxDesc;
//!
//! let mut driver = DummyDriver::new(100_000_000, TxQueueCapabilities::single_queue());
//! driver.transmit(0, &TxDesc::new(vec![0; 64]))?;
//! assert_eq!(driver.transmitted(0), 1);
//! # Ok::<(), netqos::port_driver::Backpressure>(())
//! ```
use crate::queue::TxDesc;
use anyhow::{anyhow, Result};
use flagset::{flags, FlagSet};
use std::collections::HashMap;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

flags! {
    /// Capabilities of a hardware transmit queue
    pub enum TxQueueFlag: u8 {
        /// Queue takes part in strict priority selection
        StrictPriority,

        /// Queue has a credit based shaper
        CreditShaper,
    }
}

/// Capability or configuration per hardware transmit queue, index 0 has the
/// lowest priority
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxQueueCapabilities {
    /// One entry per hardware queue
    pub queues: Vec<FlagSet<TxQueueFlag>>,
}

/// Configuration applied to the hardware transmit queues
pub type TxQueueConfig = TxQueueCapabilities;

impl TxQueueCapabilities {
    /// A single strict priority queue, i.e. everything is done in software
    #[must_use]
    pub fn single_queue() -> Self {
        Self {
            queues: vec![TxQueueFlag::StrictPriority.into()],
        }
    }

    /// Number of hardware queues
    #[must_use]
    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    /// Number of queues with a credit based shaper
    #[must_use]
    pub fn num_cbs(&self) -> usize {
        self.queues
            .iter()
            .filter(|q| q.contains(TxQueueFlag::CreditShaper))
            .count()
    }

    /// Capabilities of queue `index`, empty if there is no such queue
    #[must_use]
    pub fn get(&self, index: usize) -> FlagSet<TxQueueFlag> {
        self.queues.get(index).copied().unwrap_or_default()
    }
}

/// The hardware transmit ring is full
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("hardware transmit queue {0} is full")]
pub struct Backpressure(pub u8);

/// Operations the scheduler needs from a MAC
#[cfg_attr(test, automock)]
pub trait PortDriver {
    /// Hands a frame to hardware queue `hw_queue`.
    ///
    /// The descriptor stays owned by the caller, it is only removed from the
    /// software queue once the driver accepted it.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the hardware ring is full.
    fn transmit(&mut self, hw_queue: u8, desc: &TxDesc) -> Result<(), Backpressure>;

    /// Current link speed in bits/s
    fn link_speed(&self) -> u64;

    /// Capabilities of the hardware transmit queues
    fn tx_queue_capabilities(&self) -> TxQueueCapabilities;

    /// Configures the hardware transmit queues
    ///
    /// # Errors
    ///
    /// Will return `Err` if the hardware does not support the configuration.
    fn set_tx_queue_config(&mut self, config: &TxQueueConfig) -> Result<()>;

    /// Programs the idle slope of the credit based shaper of `hw_queue`
    ///
    /// # Errors
    ///
    /// Will return `Err` if the queue has no credit based shaper
    /// or the idle slope is out of range.
    fn set_tx_idle_slope(&mut self, idle_slope: u64, hw_queue: u8) -> Result<()>;
}

/// A driver accepting every frame and only counting it
///
/// Useful for testing purposes or to run the scheduler without hardware.
#[derive(Debug, Clone, Default)]
pub struct DummyDriver {
    link_speed: u64,
    capabilities: TxQueueCapabilities,
    config: Option<TxQueueConfig>,
    idle_slopes: HashMap<u8, u64>,
    transmitted: HashMap<u8, u64>,
}

impl DummyDriver {
    /// Create new `DummyDriver`
    ///
    /// # Arguments
    ///
    /// * `link_speed` - Link speed in bits/s to report
    ///
    /// * `capabilities` - Hardware queues to report
    #[must_use]
    pub fn new(link_speed: u64, capabilities: TxQueueCapabilities) -> Self {
        Self {
            link_speed,
            capabilities,
            ..Self::default()
        }
    }

    /// Frames accepted on `hw_queue`
    #[must_use]
    pub fn transmitted(&self, hw_queue: u8) -> u64 {
        self.transmitted.get(&hw_queue).copied().unwrap_or(0)
    }

    /// Last applied queue configuration
    #[must_use]
    pub const fn config(&self) -> Option<&TxQueueConfig> {
        self.config.as_ref()
    }

    /// Last idle slope programmed into `hw_queue`
    #[must_use]
    pub fn idle_slope(&self, hw_queue: u8) -> Option<u64> {
        self.idle_slopes.get(&hw_queue).copied()
    }
}

impl PortDriver for DummyDriver {
    fn transmit(&mut self, hw_queue: u8, _desc: &TxDesc) -> Result<(), Backpressure> {
        *self.transmitted.entry(hw_queue).or_default() += 1;
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
        self.idle_slopes.insert(hw_queue, idle_slope);
        Ok(())
    }
}
