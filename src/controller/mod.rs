// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Scheduler task owning all transmit scheduling state
//!
//! The scheduling state is only ever touched by one task. A tick task stands in
//! for the hardware timer and posts a scheduler event once per period,
//! configuration requests of other tasks are marshalled into the same queue
//! and answered over a oneshot channel.
//!
//! ```
//! use netqos::controller::{self, QosControl};
//! use netqos::port_driver::{DummyDriver, TxQueueCapabilities};
//! use netqos::ptp::SystemClock;
//! use netqos::qos::{NetQos, PortSettings};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let mut net = NetQos::new(SystemClock::new());
//! let driver = DummyDriver::new(100_000_000, TxQueueCapabilities::single_queue());
//! let port = net.add_port(driver, PortSettings::default())?;
//!
//! let (handle, task) = controller::spawn(net, Duration::from_micros(125));
//! handle.port_up(port, None).await?;
//! assert!(handle.stats(port).await?.up);
//!
//! handle.shutdown().await?;
//! let net = task.await?;
//! assert_eq!(net.ports().count(), 1);
//! # Ok::<(), anyhow::Error>(())
//! # })?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::port_driver::PortDriver;
use crate::ptp::{ClockId, ClockSource};
use crate::qos::{NetQos, PortId, PortStats, Priority, QosError, QueueHandle, SrConfig, StreamId};
use crate::queue::{Consumer, TxDesc};
use crate::sr_class::SrClassKind;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

#[cfg(test)]
use mockall::automock;

/// Events queued for the scheduler task
const EVENT_QUEUE_LEN: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, QosError>>;

#[derive(Debug)]
enum Request {
    QueueConnect {
        port: PortId,
        priority: Priority,
        ring: Consumer<TxDesc>,
        reply: Reply<QueueHandle>,
    },
    QueueDisconnect {
        handle: QueueHandle,
        reply: Reply<()>,
    },
    StreamConnect {
        port: PortId,
        class: SrClassKind,
        stream_id: StreamId,
        ring: Consumer<TxDesc>,
        reply: Reply<QueueHandle>,
    },
    StreamDisconnect {
        handle: QueueHandle,
        reply: Reply<()>,
    },
    SrConfig {
        port: PortId,
        config: SrConfig,
        reply: Reply<()>,
    },
    PortUp {
        port: PortId,
        link_speed: Option<u64>,
        reply: Reply<()>,
    },
    PortDown {
        port: PortId,
        reply: Reply<()>,
    },
    Stats {
        port: PortId,
        reply: Reply<PortStats>,
    },
}

/// Work for the scheduler task
#[derive(Debug)]
enum Event {
    /// The tick period elapsed
    SchedulerDue,

    /// A clock was stepped
    ClockDiscontinuity(ClockId),

    /// Configuration request of another task
    Request(Request),

    /// Stop the task and hand back the scheduling state
    Shutdown,
}

fn reply<T>(tx: Reply<T>, result: Result<T, QosError>) {
    if tx.send(result).is_err() {
        debug!("requester went away before the reply");
    }
}

struct Controller<D, C> {
    net: NetQos<D, C>,
    events: mpsc::Receiver<Event>,
}

impl<D: PortDriver, C: ClockSource> Controller<D, C> {
    async fn run(mut self) -> NetQos<D, C> {
        while let Some(event) = self.events.recv().await {
            match event {
                Event::SchedulerDue => {
                    self.net.scheduler_event();
                }
                Event::ClockDiscontinuity(clock) => self.net.clock_discontinuity(clock),
                Event::Request(request) => self.handle(request),
                Event::Shutdown => break,
            }
        }

        info!("scheduler task stopped");
        self.net
    }

    fn handle(&mut self, request: Request) {
        let net = &mut self.net;

        match request {
            Request::QueueConnect {
                port,
                priority,
                ring,
                reply: tx,
            } => reply(tx, net.queue_connect(port, priority, ring)),
            Request::QueueDisconnect { handle, reply: tx } => {
                reply(tx, net.queue_disconnect(&handle));
            }
            Request::StreamConnect {
                port,
                class,
                stream_id,
                ring,
                reply: tx,
            } => reply(tx, net.stream_connect(port, class, stream_id, ring)),
            Request::StreamDisconnect { handle, reply: tx } => {
                reply(tx, net.stream_disconnect(&handle));
            }
            Request::SrConfig {
                port,
                config,
                reply: tx,
            } => reply(tx, net.sr_config(port, &config)),
            Request::PortUp {
                port,
                link_speed,
                reply: tx,
            } => {
                let result = net.port(port).map(|p| p.driver().link_speed());
                let result = result.and_then(|speed| net.port_up(port, link_speed.unwrap_or(speed)));
                reply(tx, result);
            }
            Request::PortDown { port, reply: tx } => reply(tx, net.port_down(port)),
            Request::Stats { port, reply: tx } => reply(tx, net.stats(port)),
        }
    }
}

/// Configuration operations of the scheduler, usable from any task
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QosControl {
    /// Connects a best effort queue
    async fn queue_connect(
        &self,
        port: PortId,
        priority: Priority,
        ring: Consumer<TxDesc>,
    ) -> Result<QueueHandle>;

    /// Disconnects a best effort queue
    async fn queue_disconnect(&self, handle: QueueHandle) -> Result<()>;

    /// Connects the ring of an SR stream
    async fn stream_connect(
        &self,
        port: PortId,
        class: SrClassKind,
        stream_id: StreamId,
        ring: Consumer<TxDesc>,
    ) -> Result<QueueHandle>;

    /// Disconnects the ring of an SR stream
    async fn stream_disconnect(&self, handle: QueueHandle) -> Result<()>;

    /// Creates, updates or withdraws a stream reservation
    async fn sr_config(&self, port: PortId, config: SrConfig) -> Result<()>;

    /// Brings a port up, at the link speed reported by its driver if `None`
    async fn port_up(&self, port: PortId, link_speed: Option<u64>) -> Result<()>;

    /// Takes a port down
    async fn port_down(&self, port: PortId) -> Result<()>;

    /// Counters of a port
    async fn stats(&self, port: PortId) -> Result<PortStats>;
}

/// Sending side of the scheduler task
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    events: mpsc::Sender<Event>,
}

impl ControllerHandle {
    async fn request<T, F>(&self, build: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(Reply<T>) -> Request + Send,
    {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Request(build(tx)))
            .await
            .map_err(|_closed| anyhow!("scheduler task is not running"))?;
        let result = rx.await.context("scheduler task dropped the request")?;
        Ok(result?)
    }

    /// Forces a grid reset of all ports scheduled on `clock`
    ///
    /// # Errors
    ///
    /// Will return `Err` if the scheduler task is not running.
    pub async fn clock_discontinuity(&self, clock: ClockId) -> Result<()> {
        self.events
            .send(Event::ClockDiscontinuity(clock))
            .await
            .map_err(|_closed| anyhow!("scheduler task is not running"))
    }

    /// Stops the scheduler task, its join handle then yields the scheduling
    /// state
    ///
    /// # Errors
    ///
    /// Will return `Err` if the scheduler task is not running.
    pub async fn shutdown(&self) -> Result<()> {
        self.events
            .send(Event::Shutdown)
            .await
            .map_err(|_closed| anyhow!("scheduler task is not running"))
    }
}

#[async_trait]
impl QosControl for ControllerHandle {
    async fn queue_connect(
        &self,
        port: PortId,
        priority: Priority,
        ring: Consumer<TxDesc>,
    ) -> Result<QueueHandle> {
        self.request(|reply| Request::QueueConnect {
            port,
            priority,
            ring,
            reply,
        })
        .await
        .with_context(|| format!("connecting queue of priority {priority} on port {port} failed"))
    }

    async fn queue_disconnect(&self, handle: QueueHandle) -> Result<()> {
        self.request(|reply| Request::QueueDisconnect { handle, reply })
            .await
    }

    async fn stream_connect(
        &self,
        port: PortId,
        class: SrClassKind,
        stream_id: StreamId,
        ring: Consumer<TxDesc>,
    ) -> Result<QueueHandle> {
        self.request(|reply| Request::StreamConnect {
            port,
            class,
            stream_id,
            ring,
            reply,
        })
        .await
        .with_context(|| format!("connecting stream {stream_id} on port {port} failed"))
    }

    async fn stream_disconnect(&self, handle: QueueHandle) -> Result<()> {
        self.request(|reply| Request::StreamDisconnect { handle, reply })
            .await
    }

    async fn sr_config(&self, port: PortId, config: SrConfig) -> Result<()> {
        self.request(|reply| Request::SrConfig {
            port,
            config,
            reply,
        })
        .await
    }

    async fn port_up(&self, port: PortId, link_speed: Option<u64>) -> Result<()> {
        self.request(|reply| Request::PortUp {
            port,
            link_speed,
            reply,
        })
        .await
    }

    async fn port_down(&self, port: PortId) -> Result<()> {
        self.request(|reply| Request::PortDown { port, reply }).await
    }

    async fn stats(&self, port: PortId) -> Result<PortStats> {
        self.request(|reply| Request::Stats { port, reply }).await
    }
}

async fn tick(period: Duration, events: mpsc::Sender<Event>) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        interval.tick().await;
        match events.try_send(Event::SchedulerDue) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("scheduler task is falling behind, tick dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

/// Moves `net` into a new scheduler task ticking every `period`.
///
/// Returns the handle to talk to the task and the join handle yielding `net`
/// again after [`ControllerHandle::shutdown`].
pub fn spawn<D, C>(
    net: NetQos<D, C>,
    period: Duration,
) -> (ControllerHandle, JoinHandle<NetQos<D, C>>)
where
    D: PortDriver + Send + 'static,
    C: ClockSource + Send + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_LEN);
    let ticker = tokio::spawn(tick(period, tx.clone()));

    let controller = Controller { net, events: rx };
    let task = tokio::spawn(async move {
        let net = controller.run().await;
        ticker.abort();
        net
    });

    info!("scheduler task started, tick period {period:?}");
    (ControllerHandle { events: tx }, task)
}

/// Applies all `reservations` on `port`. Reservations that are rejected are
/// logged and skipped, the number of admitted ones is returned.
///
/// # Errors
///
/// Will return `Err` if the scheduler could not be reached.
pub async fn reserve_all<Q: QosControl + Sync + ?Sized>(
    control: &Q,
    port: PortId,
    reservations: &[SrConfig],
) -> Result<usize> {
    let mut admitted = 0;

    for config in reservations {
        match control.sr_config(port, *config).await {
            Ok(()) => admitted += 1,
            Err(e) if e.downcast_ref::<QosError>().is_some() => {
                warn!("stream {} not reserved: {:#}", config.stream_id, e);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(admitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_driver::{DummyDriver, TxQueueCapabilities};
    use crate::ptp::MockClockSource;
    use crate::qos::PortSettings;
    use crate::queue::ring;
    use crate::socket::TxSocket;
    use eui48::MacAddress;

    const LINK: u64 = 100_000_000;
    const PERIOD: Duration = Duration::from_micros(125);

    fn stream_id(n: u16) -> StreamId {
        StreamId::new(MacAddress::new([0x02, 0, 0, 0, 0, 0x01]), n)
    }

    fn reservation(n: u16, idle_slope: u64) -> Result<SrConfig> {
        Ok(SrConfig {
            stream_id: stream_id(n),
            vlan_id: 2,
            priority: Priority::try_from(3)?,
            idle_slope,
        })
    }

    fn net() -> Result<(NetQos<DummyDriver, MockClockSource>, PortId)> {
        let mut clock = MockClockSource::new();
        let mut now = 1_000_000;
        clock.expect_gettime().returning(move |_| {
            now += 125_000;
            Ok(now)
        });

        let mut net = NetQos::new(clock);
        let driver = DummyDriver::new(LINK, TxQueueCapabilities::single_queue());
        let port = net.add_port(driver, PortSettings::default())?;
        Ok((net, port))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_drive_transmission() -> Result<()> {
        let (net, port) = net()?;
        let (handle, task) = spawn(net, PERIOD);

        handle.port_up(port, None).await?;
        let (producer, consumer) = ring(16);
        let queue = handle
            .queue_connect(port, Priority::try_from(0)?, consumer)
            .await?;
        let mut socket = TxSocket::new(producer, queue);
        for _ in 0..10 {
            socket
                .send(TxDesc::new(vec![0; 64]))
                .map_err(|_full| anyhow!("ring full"))?;
        }

        time::sleep(Duration::from_millis(1)).await;

        let stats = handle.stats(port).await?;
        assert_eq!(stats.tx, 10);
        assert!(stats.grid.total >= 7);

        handle.shutdown().await?;
        let net = task.await?;
        assert_eq!(net.port(port)?.driver().transmitted(0), 10);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_speed_from_driver() -> Result<()> {
        let (net, port) = net()?;
        let (handle, _task) = spawn(net, PERIOD);

        handle.port_up(port, None).await?;
        assert_eq!(handle.stats(port).await?.max_rate, 75_000_000);

        handle.port_up(port, Some(1_000_000_000)).await?;
        assert_eq!(handle.stats(port).await?.max_rate, 750_000_000);

        handle.port_down(port).await?;
        assert!(!handle.stats(port).await?.up);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_passed_back() -> Result<()> {
        let (net, port) = net()?;
        let (handle, _task) = spawn(net, PERIOD);
        handle.port_up(port, None).await?;

        let err = handle
            .sr_config(port, reservation(1, 80_000_000)?)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QosError>(),
            Some(QosError::AdmissionRejected { .. })
        ));

        let (_producer, consumer) = ring(4);
        let err = handle
            .stream_connect(port, SrClassKind::E, stream_id(1), consumer)
            .await
            .unwrap_err();
        assert_eq!(
            err.root_cause().to_string(),
            QosError::ClassDisabled(SrClassKind::E).to_string()
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_task_is_reported() -> Result<()> {
        let (net, port) = net()?;
        let (handle, task) = spawn(net, PERIOD);
        handle.shutdown().await?;
        task.await?;

        assert!(handle.stats(port).await.is_err());
        assert!(handle.clock_discontinuity(ClockId::Gptp0).await.is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_discontinuity_resets_grid() -> Result<()> {
        let (net, port) = net()?;
        let (handle, _task) = spawn(net, PERIOD);
        handle.port_up(port, None).await?;

        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.stats(port).await?.grid.resets, 1);

        handle.clock_discontinuity(ClockId::Gptp0).await?;
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.stats(port).await?.grid.resets, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_reserve_all_skips_rejected() -> Result<()> {
        let mut control = MockQosControl::new();
        control
            .expect_sr_config()
            .times(3)
            .returning(|_, config| {
                if config.idle_slope > 50_000_000 {
                    Err(QosError::AdmissionRejected {
                        requested: config.idle_slope,
                        used: 0,
                        max: 50_000_000,
                    }
                    .into())
                } else {
                    Ok(())
                }
            });

        let reservations = [
            reservation(1, 10_000_000)?,
            reservation(2, 60_000_000)?,
            reservation(3, 20_000_000)?,
        ];
        let port = net()?.1;
        assert_eq!(reserve_all(&control, port, &reservations).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_reserve_all_stops_on_dead_controller() -> Result<()> {
        let mut control = MockQosControl::new();
        control
            .expect_sr_config()
            .times(1)
            .returning(|_, _| Err(anyhow!("scheduler task is not running")));

        let port = net()?.1;
        assert!(reserve_all(&control, port, &[reservation(1, 1000)?, reservation(2, 1000)?])
            .await
            .is_err());
        Ok(())
    }
}
