// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Provides YAML-based configuration

use crate::configuration::{self, PortConfig, SchedulerConfig, SimulationConfig, VERSION};
use crate::pi::PiGains;
use crate::sr_class::SrClassConfig;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;

/// Reads configuration from YAML file
#[derive(Default, Debug)]
pub struct YAMLConfiguration {
    config: Config,
}

#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    version: String,
    tick_period_ns: Option<u32>,
    sr_classes: Option<SrClassConfig>,
    pi: Option<PiGains>,
    ports: Option<PortConfigurations>,
    simulation: Option<SimulationConfig>,
}

type PortConfigurations = BTreeMap<String, PortConfig>;

/// Major and minor part of a version string
fn compatible(version: &str) -> bool {
    let release = |v: &str| v.split('.').take(2).map(str::to_owned).collect::<Vec<_>>();
    release(version) == release(VERSION)
}

impl configuration::Configuration for YAMLConfiguration {
    fn get_scheduler_config(&mut self) -> Result<SchedulerConfig> {
        let defaults = SchedulerConfig::default();
        Ok(SchedulerConfig {
            tick_period_ns: self.config.tick_period_ns.unwrap_or(defaults.tick_period_ns),
            sr_classes: self.config.sr_classes.unwrap_or(defaults.sr_classes),
            pi: self.config.pi.unwrap_or(defaults.pi),
        })
    }

    fn get_port_names(&mut self) -> Result<Vec<String>> {
        self.config.ports.as_ref().map_or_else(
            || Err(anyhow!("No ports section found in configuration!")),
            |ports| Ok(ports.keys().cloned().collect()),
        )
    }

    fn get_port_config(&mut self, port: &str) -> Result<PortConfig> {
        self.config.ports.as_ref().map_or_else(
            || Err(anyhow!("No ports section found in configuration!")),
            |ports| {
                ports
                    .get(port)
                    .cloned()
                    .ok_or_else(|| anyhow!("Port {} not found in configuration!", port))
            },
        )
    }

    fn get_simulation_config(&mut self) -> Result<SimulationConfig> {
        Ok(self.config.simulation.unwrap_or_default())
    }
}

impl YAMLConfiguration {
    /// Construct a new `YAMLConfiguration`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read YAML from a reader
    ///
    /// ```
    /// # use netqos::configuration::{Configuration, YAMLConfiguration};
    /// # #[path = "../doctest.rs"]
    /// # mod doctest;
    /// # let tmpfile = doctest::generate_example_yaml();
    /// # let filepath = tmpfile.path();
    /// # use std::fs::File;
    /// # let mut yaml_config = YAMLConfiguration::new();
    /// yaml_config.read(File::open(filepath)?)?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Will return `Err` if the configuration could not be parsed or has an
    /// incompatible version.
    pub fn read<R: Read>(&mut self, reader: R) -> Result<()> {
        let config: Config = serde_yaml::from_reader(reader).context("Reading YAML file")?;
        if !compatible(&config.version) {
            return Err(anyhow!(
                "Configuration version {} is not supported, expected {}",
                config.version,
                VERSION
            ));
        }
        self.config = config;
        Ok(())
    }
}
