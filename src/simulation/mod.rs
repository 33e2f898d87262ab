// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Deterministic end to end runs of the scheduler
//!
//! Every configured port gets a [`SimulatedMac`] and talkers that keep the
//! configured streams backlogged and offer best effort frames each tick. All
//! ports share one [`SimClock`].
//!
//! ```
//! use netqos::configuration::{Configuration, YAMLConfiguration};
//! use netqos::simulation::{SimTime, Simulation};
//! # #[path = "../configuration/doctest.rs"]
//! # mod doctest;
//! # let tmpfile = doctest::generate_example_yaml();
//! # let filepath = tmpfile.path();
//! use std::fs::File;
//!
//! let mut yaml_config = YAMLConfiguration::new();
//! yaml_config.read(File::open(filepath)?)?;
//!
//! let mut simulation = Simulation::from_configuration(&mut yaml_config, SimTime::stepped())?;
//! simulation.set_duration_ms(10);
//! let report = simulation.run()?;
//! assert_eq!(report.ticks, 80);
//! assert!(report.ports["eth0"].scheduler.tx > 0);
//! # Ok::<(), anyhow::Error>(())
//! ```
use crate::configuration::{BestEffortConfig, Configuration, PortConfig, SimulationConfig, StreamConfig};
use crate::controller::{self, QosControl};
use crate::qos::{NetQos, PortId, PortStats, Priority, SrConfig, StreamId};
use crate::queue::{ring, TxDesc};
use crate::socket::TxSocket;
use crate::sr_class::SrClassConfig;
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

mod clock;
pub use clock::{SimClock, SimTime, Timebase, EPOCH_NS};

mod mac;
pub use mac::{HwQueueStats, MacStats, SimulatedMac, HW_RING_DEPTH};

/// Frames a talker ring holds
pub const TALKER_RING_LEN: usize = 64;

/// Counters of one talker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TalkerStats {
    /// Stream sent, none for best effort traffic
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamId>,

    /// Priority of the frames
    pub priority: Priority,

    /// Size of each frame in bytes
    pub frame_size: usize,

    /// Frames queued for the scheduler
    pub offered: u64,

    /// Frames that did not fit into the ring
    pub refused: u64,
}

/// Result of a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortReport {
    /// Scheduler counters
    pub scheduler: PortStats,

    /// MAC counters
    pub mac: MacStats,

    /// Traffic sources
    pub talkers: Vec<TalkerStats>,
}

/// Result of a simulation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    /// Scheduler ticks simulated
    pub ticks: u64,

    /// Per port by name
    pub ports: BTreeMap<String, PortReport>,
}

#[derive(Debug, Clone, Copy)]
enum Load {
    Backlog { presentation_offset_ns: Option<u32> },
    PerTick(u32),
}

#[derive(Debug)]
struct Talker {
    socket: TxSocket,
    load: Load,
    stats: TalkerStats,
}

fn wrap_ns(ns: u64) -> u32 {
    u32::try_from(ns & u64::from(u32::MAX)).unwrap_or(0)
}

impl Talker {
    fn stream(socket: TxSocket, config: &StreamConfig) -> Self {
        Self {
            socket,
            load: Load::Backlog {
                presentation_offset_ns: config.presentation_offset_ns,
            },
            stats: TalkerStats {
                stream: Some(config.id),
                priority: config.priority(),
                frame_size: config.frame_size,
                offered: 0,
                refused: 0,
            },
        }
    }

    fn best_effort(socket: TxSocket, config: &BestEffortConfig) -> Self {
        Self {
            socket,
            load: Load::PerTick(config.frames_per_tick),
            stats: TalkerStats {
                stream: None,
                priority: config.priority,
                frame_size: config.frame_size,
                offered: 0,
                refused: 0,
            },
        }
    }

    /// A frame of the configured size, VLAN tagged if the stream has a label
    fn frame(&self) -> Vec<u8> {
        let mut frame = vec![0; self.stats.frame_size];
        let label = self.socket.vlan_label();
        if label != 0 {
            if let Some(tag) = frame.get_mut(12..16) {
                let [tci_hi, tci_lo] = label.to_be_bytes();
                tag.copy_from_slice(&[0x81, 0x00, tci_hi, tci_lo]);
            }
        }
        frame
    }

    /// Queues this tick's frames, `gptp_now` is the time of the tick
    fn offer(&mut self, gptp_now: u64) {
        match self.load {
            Load::Backlog {
                presentation_offset_ns,
            } => {
                while self.socket.available() > 0 {
                    let frame = self.frame();
                    let desc = match presentation_offset_ns {
                        Some(offset) => {
                            TxDesc::with_timestamp(frame, wrap_ns(gptp_now + u64::from(offset)))
                        }
                        None => TxDesc::new(frame),
                    };
                    if self.socket.send(desc).is_err() {
                        break;
                    }
                    self.stats.offered += 1;
                }
            }
            Load::PerTick(frames) => {
                for _ in 0..frames {
                    match self.socket.send(TxDesc::new(self.frame())) {
                        Ok(()) => self.stats.offered += 1,
                        Err(_desc) => self.stats.refused += 1,
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
struct SimPort {
    name: String,
    id: PortId,
    config: PortConfig,
    talkers: Vec<Talker>,
}

/// Ports, their traffic and the clock of one run
#[derive(Debug)]
pub struct Simulation {
    net: NetQos<SimulatedMac, SimClock>,
    timebase: Timebase,
    settings: SimulationConfig,
    tick_period_ns: u32,
    sr_classes: SrClassConfig,
    ports: Vec<SimPort>,
    connected: bool,
    ticks: u64,
}

impl Simulation {
    /// Sets up all configured ports, timed by `time`. The ports stay down
    /// until the run starts.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the configuration is incomplete or a port can not
    /// be scheduled with it.
    pub fn from_configuration(config: &mut dyn Configuration, time: SimTime) -> Result<Self> {
        let scheduler = config.get_scheduler_config()?;
        let settings = config.get_simulation_config()?;

        let clock = SimClock::new(time.clone(), &settings);
        let timebase = clock.timebase().clone();
        let mut net = NetQos::new(clock);
        let mut ports = Vec::new();

        for name in config.get_port_names()? {
            let port_config = config.get_port_config(&name)?;
            let mac = SimulatedMac::new(
                time.clone(),
                port_config.link_speed_bps,
                port_config.tx_queue_capabilities(),
                HW_RING_DEPTH,
            );
            let id = net
                .add_port(mac, scheduler.port_settings(port_config.clock))
                .with_context(|| format!("Adding port {name}"))?;
            debug!("simulated port {name} is {id}");

            ports.push(SimPort {
                name,
                id,
                config: port_config,
                talkers: Vec::new(),
            });
        }

        Ok(Self {
            net,
            timebase,
            settings,
            tick_period_ns: scheduler.tick_period_ns,
            sr_classes: scheduler.sr_classes,
            ports,
            connected: false,
            ticks: 0,
        })
    }

    /// Overrides the simulated time
    pub fn set_duration_ms(&mut self, duration_ms: u64) {
        self.settings.duration_ms = duration_ms;
    }

    /// The scheduler
    #[must_use]
    pub const fn net(&self) -> &NetQos<SimulatedMac, SimClock> {
        &self.net
    }

    /// The scheduler, mutable
    pub fn net_mut(&mut self) -> &mut NetQos<SimulatedMac, SimClock> {
        &mut self.net
    }

    /// Id of the port called `name`
    #[must_use]
    pub fn port_id(&self, name: &str) -> Option<PortId> {
        self.ports
            .iter()
            .find(|port| port.name == name)
            .map(|port| port.id)
    }

    /// Number of ticks the configured duration lasts
    #[must_use]
    pub fn total_ticks(&self) -> u64 {
        self.settings
            .duration_ms
            .saturating_mul(1_000_000)
            .checked_div(u64::from(self.tick_period_ns))
            .unwrap_or(0)
    }

    /// Brings the ports up, reserves the streams and connects the talkers.
    /// Streams that are not admitted get no talker.
    ///
    /// # Errors
    ///
    /// Will return `Err` if a talker can not be connected.
    pub fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }

        for port in &mut self.ports {
            self.net.port_up(port.id, port.config.link_speed_bps)?;

            for stream in &port.config.streams {
                if let Err(e) = self.net.sr_config(port.id, &stream.sr_config()) {
                    warn!("{}: stream {} not reserved: {}", port.name, stream.id, e);
                    continue;
                }

                let (producer, consumer) = ring(TALKER_RING_LEN);
                let handle = self
                    .net
                    .stream_connect(port.id, self.sr_classes.class(stream.class), stream.id, consumer)
                    .with_context(|| format!("Connecting stream {} on {}", stream.id, port.name))?;
                port.talkers
                    .push(Talker::stream(TxSocket::new(producer, handle), stream));
            }

            for best_effort in &port.config.best_effort {
                let (producer, consumer) = ring(TALKER_RING_LEN);
                let handle = self
                    .net
                    .queue_connect(port.id, best_effort.priority, consumer)
                    .with_context(|| format!("Connecting best effort queue on {}", port.name))?;
                port.talkers.push(Talker::best_effort(
                    TxSocket::new(producer, handle),
                    best_effort,
                ));
            }
        }

        self.connected = true;
        Ok(())
    }

    /// Simulates one tick: talkers offer their frames, then the scheduler
    /// runs and the timer moves on
    pub fn step(&mut self) {
        let gptp_now = self.timebase.gptp_now();
        for talker in self.ports.iter_mut().flat_map(|port| port.talkers.iter_mut()) {
            talker.offer(gptp_now);
        }

        self.net.scheduler_event();
        self.timebase.time().advance(u64::from(self.tick_period_ns));
        self.ticks += 1;
    }

    /// Runs the configured duration tick by tick
    ///
    /// # Errors
    ///
    /// Will return `Err` if the simulation is not timed by stepped time or
    /// can not be set up.
    pub fn run(&mut self) -> Result<SimulationReport> {
        if self.timebase.time().is_tokio() {
            return Err(anyhow!("Stepped runs need stepped time"));
        }
        self.connect()?;

        let ticks = self.total_ticks();
        info!("simulating {} ticks on {} port(s)", ticks, self.ports.len());
        for _ in 0..ticks {
            self.step();
        }

        self.report()
    }

    /// Counters of all ports
    ///
    /// # Errors
    ///
    /// Will return `Err` if a port vanished.
    pub fn report(&self) -> Result<SimulationReport> {
        let mut ports = BTreeMap::new();
        for port in &self.ports {
            ports.insert(
                port.name.clone(),
                PortReport {
                    scheduler: self.net.stats(port.id)?,
                    mac: self.net.port(port.id)?.driver().stats().clone(),
                    talkers: port.talkers.iter().map(|talker| talker.stats).collect(),
                },
            );
        }

        Ok(SimulationReport {
            ticks: self.ticks,
            ports,
        })
    }

    /// Runs the configured duration through the scheduler task.
    ///
    /// Ports are brought up and streams reserved through [`QosControl`]. Each
    /// stream talker runs in its own task and refills its ring when the port
    /// signals room, best effort talkers offer their frames every tick.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the simulation is not timed by tokio time or the
    /// scheduler task fails.
    pub async fn run_controlled(self) -> Result<SimulationReport> {
        if !self.timebase.time().is_tokio() {
            return Err(anyhow!("Controlled runs need tokio time"));
        }
        if self.connected {
            return Err(anyhow!("Simulation is already connected"));
        }

        let ticks = self.total_ticks();
        let Self {
            net,
            timebase,
            settings,
            tick_period_ns,
            sr_classes,
            ports,
            ..
        } = self;

        let period = Duration::from_nanos(u64::from(tick_period_ns));
        let until = Instant::now() + Duration::from_millis(settings.duration_ms);
        let (control, task) = controller::spawn(net, period);
        info!(
            "simulating {} ms on {} port(s) through the scheduler task",
            settings.duration_ms,
            ports.len()
        );

        let mut talker_tasks: Vec<(String, JoinHandle<Talker>)> = Vec::new();
        for port in &ports {
            control.port_up(port.id, None).await?;

            let reservations: Vec<SrConfig> =
                port.config.streams.iter().map(StreamConfig::sr_config).collect();
            controller::reserve_all(&control, port.id, &reservations).await?;
            let reserved = control.stats(port.id).await?.sr_streams;

            for stream in &port.config.streams {
                if !reserved.iter().any(|s| s.id == stream.id && s.configured) {
                    continue;
                }
                let (producer, consumer) = ring(TALKER_RING_LEN);
                let handle = control
                    .stream_connect(port.id, sr_classes.class(stream.class), stream.id, consumer)
                    .await?;
                let talker = Talker::stream(TxSocket::new(producer, handle), stream);
                talker_tasks.push((
                    port.name.clone(),
                    tokio::spawn(keep_backlog(talker, timebase.clone(), until)),
                ));
            }

            for best_effort in &port.config.best_effort {
                let (producer, consumer) = ring(TALKER_RING_LEN);
                let handle = control
                    .queue_connect(port.id, best_effort.priority, consumer)
                    .await?;
                let talker = Talker::best_effort(TxSocket::new(producer, handle), best_effort);
                talker_tasks.push((
                    port.name.clone(),
                    tokio::spawn(offer_every_tick(talker, timebase.clone(), period, until)),
                ));
            }
        }

        time::sleep_until(until).await;

        let mut talkers: BTreeMap<String, Vec<TalkerStats>> = BTreeMap::new();
        for (name, talker_task) in talker_tasks {
            let talker = talker_task.await.context("Talker task failed")?;
            talkers.entry(name).or_default().push(talker.stats);
        }

        let mut scheduler = BTreeMap::new();
        for port in &ports {
            scheduler.insert(port.name.clone(), control.stats(port.id).await?);
        }

        control.shutdown().await?;
        let net = task.await.context("Scheduler task failed")?;

        let mut reports = BTreeMap::new();
        for port in ports {
            reports.insert(
                port.name.clone(),
                PortReport {
                    scheduler: scheduler
                        .remove(&port.name)
                        .ok_or_else(|| anyhow!("No statistics of {}", port.name))?,
                    mac: net.port(port.id)?.driver().stats().clone(),
                    talkers: talkers.remove(&port.name).unwrap_or_default(),
                },
            );
        }

        Ok(SimulationReport {
            ticks,
            ports: reports,
        })
    }
}

async fn keep_backlog(mut talker: Talker, timebase: Timebase, until: Instant) -> Talker {
    loop {
        talker.offer(timebase.gptp_now());

        let done = tokio::select! {
            () = talker.socket.wait_writable() => false,
            () = time::sleep_until(until) => true,
        };
        if done {
            return talker;
        }
    }
}

async fn offer_every_tick(
    mut talker: Talker,
    timebase: Timebase,
    period: Duration,
    until: Instant,
) -> Talker {
    let mut interval = time::interval(period);
    while Instant::now() < until {
        interval.tick().await;
        talker.offer(timebase.gptp_now());
    }
    talker
}
