// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Main executable of netqos
// we do not want to panic or exit, see explanation in main()
#![cfg_attr(
    not(test),
    deny(
        clippy::panic,
        clippy::panic_in_result_fn,
        clippy::expect_used,
        clippy::exit,
        clippy::unwrap_used,
        clippy::indexing_slicing,
        clippy::modulo_arithmetic, // % 0 panics - use checked_rem
        clippy::integer_division,  // / 0 panics - use checked_div
        clippy::unreachable,
        clippy::unwrap_in_result,
    )
)]

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::fs::File;
use std::path::PathBuf;

use netqos::configuration::YAMLConfiguration;
use netqos::simulation::{SimTime, Simulation};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Simulated time in milliseconds, overrides the configuration
    #[arg(short, long, value_name = "MS")]
    duration: Option<u64>,

    /// Run through the scheduler task in real time instead of stepping
    /// through the ticks
    #[arg(short, long)]
    realtime: bool,

    /// YAML configuration file
    #[arg(value_name = "FILE")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
/// Main function of `netqos`
///
/// # Errors
/// Will return `Err` if the configuration can not be read or the simulation
/// can not be set up. Problems during the run, like rejected reservations,
/// are logged and visible in the printed statistics instead.
/// The scheduler itself never panics or exits on bad input, since a
/// transmit path stuck in a crashed process stops all traffic of the port.
/// Errors are returned and logged instead.
///
/// # Panics
/// The only known case is when the tokio runtime can not even be started
/// before calling the actual main function.
pub async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    let mut configuration = YAMLConfiguration::new();
    configuration.read(
        File::open(&cli.config)
            .with_context(|| format!("Opening {}", cli.config.display()))?,
    )?;

    let time = if cli.realtime {
        SimTime::tokio()
    } else {
        SimTime::stepped()
    };
    let mut simulation = Simulation::from_configuration(&mut configuration, time)?;
    if let Some(duration) = cli.duration {
        simulation.set_duration_ms(duration);
    }

    let report = if cli.realtime {
        simulation.run_controlled().await?
    } else {
        simulation.run()?
    };
    info!("simulation of {} ticks done", report.ticks);

    print!("{}", serde_yaml::to_string(&report)?);
    Ok(())
}
