//! ---
//! lb_section: "02-signal-bus"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Station signal bus: model, wire codec, and socket managers."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
//! Outbound half of the bus.
//!
//! Every tick the manager drains its registration queue, dials any address
//! that has no live connection, then writes the current level of every
//! output bound to a connected address. Delivery is level-triggered: a
//! station sees the full state of its outputs again on every tick.
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use linebus_logging::{
    bus_debug, bus_info, bus_warn, log_system_event, LogContext, SystemEventOutcome,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::codec::encode_record;
use crate::metrics::{log_record, RecordDirection, SignalBusMetrics};
use crate::model::{OutputSignal, SocketAddress};
use crate::registry::{Registrar, SignalRegistry};
use crate::tick::RateLimiter;
use crate::{BusError, Result};

/// Timing knobs of the output loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSettings {
    /// Period between broadcasts.
    pub tick_interval: Duration,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Pause after a successful connect before dialling the next address.
    pub settle_delay: Duration,
    /// Bound on writing one tick's batch to a connection.
    pub write_timeout: Duration,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            connect_timeout: Duration::from_millis(10),
            settle_delay: Duration::from_millis(500),
            write_timeout: Duration::from_millis(250),
        }
    }
}

/// Counters published after every tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputStats {
    /// Ticks completed so far.
    pub tick: u64,
    /// Distinct output identities tracked.
    pub registered: usize,
    /// Live outbound connections, one per address.
    pub connections: usize,
    /// Records written since start.
    pub records_sent: u64,
    /// Connections torn down after a write failure.
    pub send_failures: u64,
    /// Connect attempts that timed out or were refused.
    pub connect_failures: u64,
}

/// Owner of outbound station connections.
pub struct OutputSignalManager {
    settings: OutputSettings,
    registrar: Registrar<OutputSignal>,
    queue: mpsc::UnboundedReceiver<OutputSignal>,
    stats: watch::Sender<OutputStats>,
    metrics: Option<SignalBusMetrics>,
}

impl OutputSignalManager {
    /// Manager with the given timings. Nothing runs until [`Self::run`] or [`Self::start`].
    pub fn new(settings: OutputSettings) -> Self {
        let (registrar, queue) = Registrar::channel();
        let (stats, _) = watch::channel(OutputStats::default());
        Self {
            settings,
            registrar,
            queue,
            stats,
            metrics: None,
        }
    }

    /// Report activity to the provided metrics.
    pub fn with_metrics(mut self, metrics: SignalBusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cloneable registration front door.
    pub fn registrar(&self) -> Registrar<OutputSignal> {
        self.registrar.clone()
    }

    /// Queue an output for tracking.
    pub fn register(&self, signal: OutputSignal) -> bool {
        self.registrar.register(signal)
    }

    /// Subscribe to the per-tick counters.
    pub fn stats(&self) -> watch::Receiver<OutputStats> {
        self.stats.subscribe()
    }

    /// Spawn the loop on the current runtime.
    pub fn start(self) -> OutputManagerHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let registrar = self.registrar.clone();
        let stats = self.stats.subscribe();
        let task = tokio::spawn(self.run(shutdown_rx));
        OutputManagerHandle {
            registrar,
            stats,
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Run the tick loop until `shutdown` fires or its sender is dropped.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut limiter = RateLimiter::new(self.settings.tick_interval);
        let mut worker = OutputWorker::new(self);
        log_system_event(
            None,
            "output.start",
            "output signal manager running",
            SystemEventOutcome::Success,
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = limiter.tick() => {}
            }
            worker.tick += 1;
            worker.drain_registrations();
            if !worker.connect_pending(&mut shutdown).await {
                break;
            }
            worker.broadcast().await;
            worker.publish_stats();
        }

        worker.close_all();
        log_system_event(
            None,
            "output.stop",
            "output signal manager stopped",
            SystemEventOutcome::Success,
        );
        Ok(())
    }
}

/// Handle to a spawned [`OutputSignalManager`].
#[derive(Debug)]
pub struct OutputManagerHandle {
    registrar: Registrar<OutputSignal>,
    stats: watch::Receiver<OutputStats>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl OutputManagerHandle {
    /// Queue an output for tracking.
    pub fn register(&self, signal: OutputSignal) -> bool {
        self.registrar.register(signal)
    }

    /// Cloneable registration front door.
    pub fn registrar(&self) -> Registrar<OutputSignal> {
        self.registrar.clone()
    }

    /// Latest published counters.
    pub fn stats(&self) -> OutputStats {
        self.stats.borrow().clone()
    }

    /// Subscribe to the per-tick counters.
    pub fn subscribe_stats(&self) -> watch::Receiver<OutputStats> {
        self.stats.clone()
    }

    /// Stop the loop, close every connection, and wait for the task.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                log_system_event(
                    None,
                    "output.stop",
                    &format!("output signal manager task failed: {err}"),
                    SystemEventOutcome::Fault,
                );
                Err(BusError::Worker(err.to_string()))
            }
        }
    }
}

struct OutputWorker {
    settings: OutputSettings,
    queue: mpsc::UnboundedReceiver<OutputSignal>,
    registry: SignalRegistry<OutputSignal>,
    links: HashMap<SocketAddress, TcpStream>,
    unreachable: HashSet<SocketAddress>,
    stats: watch::Sender<OutputStats>,
    metrics: Option<SignalBusMetrics>,
    tick: u64,
    records_sent: u64,
    send_failures: u64,
    connect_failures: u64,
}

impl OutputWorker {
    fn new(manager: OutputSignalManager) -> Self {
        Self {
            settings: manager.settings,
            queue: manager.queue,
            registry: SignalRegistry::new(),
            links: HashMap::new(),
            unreachable: HashSet::new(),
            stats: manager.stats,
            metrics: manager.metrics,
            tick: 0,
            records_sent: 0,
            send_failures: 0,
            connect_failures: 0,
        }
    }

    fn drain_registrations(&mut self) {
        while let Ok(signal) = self.queue.try_recv() {
            let linked = self.links.contains_key(signal.address());
            if self.registry.insert(signal.clone()) {
                signal.set_linked(linked);
                bus_debug!(
                    context = LogContext::new()
                        .with_station(&signal.identity().controller_device)
                        .with_signal(signal.name())
                        .with_tick(self.tick),
                    "output registered"
                );
            }
        }
    }

    /// Dial every unconnected address that carries at least one transmitted
    /// signal. Returns `false` if shutdown fired during a settle delay.
    async fn connect_pending(&mut self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let pending: Vec<SocketAddress> = self
            .registry
            .addresses()
            .into_iter()
            .filter(|address| !self.links.contains_key(address))
            .filter(|address| {
                self.registry
                    .bound_to(address)
                    .any(|signal| !signal.is_local_only())
            })
            .collect();

        for address in pending {
            match self.connect(&address).await {
                Ok(stream) => {
                    self.link(address, stream);
                    if !self.settings.settle_delay.is_zero() {
                        tokio::select! {
                            _ = shutdown.recv() => return false,
                            _ = tokio::time::sleep(self.settings.settle_delay) => {}
                        }
                    }
                }
                Err(err) => self.record_connect_failure(&address, err),
            }
        }
        true
    }

    async fn connect(&self, address: &SocketAddress) -> Result<TcpStream> {
        let attempt = TcpStream::connect((address.host.as_str(), address.port));
        match timeout(self.settings.connect_timeout, attempt).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(BusError::ConnectFailed {
                address: address.clone(),
                source,
            }),
            Err(_) => Err(BusError::ConnectTimeout {
                address: address.clone(),
                timeout: self.settings.connect_timeout,
            }),
        }
    }

    fn link(&mut self, address: SocketAddress, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        for signal in self.registry.bound_to(&address) {
            signal.set_linked(true);
        }
        let rendered = address.to_string();
        let ctx = LogContext::new().with_address(&rendered).with_tick(self.tick);
        if self.unreachable.remove(&address) {
            bus_info!(context = ctx, "station connection restored");
        } else {
            bus_info!(context = ctx, "station connected");
        }
        if let Some(metrics) = &self.metrics {
            metrics.observe_connect(true);
        }
        self.links.insert(address, stream);
    }

    fn record_connect_failure(&mut self, address: &SocketAddress, err: BusError) {
        self.connect_failures += 1;
        if let Some(metrics) = &self.metrics {
            metrics.observe_connect(false);
        }
        let rendered = address.to_string();
        let ctx = LogContext::new().with_address(&rendered).with_tick(self.tick);
        // Offline stations fail every tick; only the first failure is worth a warning.
        if self.unreachable.insert(address.clone()) {
            bus_warn!(context = ctx, "station unreachable, retrying every tick: {}", err);
        } else {
            bus_debug!(context = ctx, "connect retry failed: {}", err);
        }
    }

    async fn broadcast(&mut self) {
        let mut broken = Vec::new();

        for (address, stream) in self.links.iter_mut() {
            let mut batch = Vec::new();
            let mut records = 0usize;
            for signal in self.registry.bound_to(address) {
                if signal.is_local_only() {
                    continue;
                }
                let message = signal.to_wire();
                match encode_record(&message) {
                    Ok(bytes) => {
                        log_record(RecordDirection::Outbound, address, &message);
                        batch.extend_from_slice(&bytes);
                        records += 1;
                    }
                    Err(err) => {
                        bus_warn!(
                            context = LogContext::new().with_signal(signal.name()),
                            "failed to encode output: {}",
                            err
                        );
                    }
                }
            }
            if batch.is_empty() {
                continue;
            }

            match timeout(self.settings.write_timeout, stream.write_all(&batch)).await {
                Ok(Ok(())) => {
                    self.records_sent += records as u64;
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_sent(records);
                    }
                }
                Ok(Err(source)) => broken.push((
                    address.clone(),
                    BusError::SendFailed {
                        address: address.clone(),
                        source,
                    },
                )),
                Err(_) => broken.push((
                    address.clone(),
                    BusError::SendTimeout {
                        address: address.clone(),
                        timeout: self.settings.write_timeout,
                    },
                )),
            }
        }

        for (address, err) in broken {
            self.evict(&address, err);
        }
    }

    fn evict(&mut self, address: &SocketAddress, err: BusError) {
        self.links.remove(address);
        for signal in self.registry.bound_to(address) {
            signal.set_linked(false);
        }
        self.send_failures += 1;
        if let Some(metrics) = &self.metrics {
            metrics.observe_send_failure();
        }
        let rendered = address.to_string();
        bus_warn!(
            context = LogContext::new().with_address(&rendered).with_tick(self.tick),
            "station connection dropped, reconnecting next tick: {}",
            err
        );
    }

    fn publish_stats(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_connections(self.links.len());
        }
        self.stats.send_replace(OutputStats {
            tick: self.tick,
            registered: self.registry.len(),
            connections: self.links.len(),
            records_sent: self.records_sent,
            send_failures: self.send_failures,
            connect_failures: self.connect_failures,
        });
    }

    fn close_all(&mut self) {
        for signal in self.registry.iter() {
            signal.set_linked(false);
        }
        self.links.clear();
        if let Some(metrics) = &self.metrics {
            metrics.set_connections(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decoded, RecordDecoder, WireMessage};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn fast_settings() -> OutputSettings {
        OutputSettings {
            tick_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(100),
            settle_delay: Duration::ZERO,
            write_timeout: Duration::from_millis(200),
        }
    }

    async fn loopback_listener() -> (TcpListener, SocketAddress) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = SocketAddress::from(listener.local_addr().expect("local addr"));
        (listener, address)
    }

    async fn read_records(stream: &mut TcpStream, want: usize) -> Vec<WireMessage> {
        let mut decoder = RecordDecoder::default();
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        while out.len() < want {
            let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .expect("records arrive in time")
                .expect("read");
            assert!(n > 0, "manager closed the connection");
            for decoded in decoder.push(&buf[..n]) {
                if let Decoded::Message(message) = decoded {
                    out.push(message);
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn signals_sharing_an_address_share_one_connection() {
        let (listener, address) = loopback_listener().await;
        let manager = OutputSignalManager::new(fast_settings());
        let first = OutputSignal::new("bottleAtPos1", "ConveyorControllerCD", address.clone());
        let second = OutputSignal::new("bottleLeftPos5", "ConveyorControllerCD", address.clone());
        manager.register(first.clone());
        manager.register(second.clone());
        let handle = manager.start();

        let (mut stream, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("connect in time")
            .expect("accept");
        let records = read_records(&mut stream, 4).await;
        assert!(records.iter().any(|r| r.name == "bottleAtPos1"));
        assert!(records.iter().any(|r| r.name == "bottleLeftPos5"));

        let extra = timeout(Duration::from_millis(150), listener.accept()).await;
        assert!(extra.is_err(), "second connection opened for the same address");
        assert!(first.is_linked() && second.is_linked());
        assert_eq!(handle.stats().connections, 1);

        handle.shutdown().await.expect("clean shutdown");
        assert!(!first.is_linked());
    }

    #[tokio::test]
    async fn duplicate_registration_keeps_registry_size() {
        let (_listener, address) = loopback_listener().await;
        let manager = OutputSignalManager::new(fast_settings());
        let signal = OutputSignal::new("capperDoProcess", "CapperControllerCD", address);
        manager.register(signal.clone());
        manager.register(signal.clone());
        let handle = manager.start();
        let mut stats = handle.subscribe_stats();
        timeout(Duration::from_secs(2), stats.wait_for(|s| s.tick >= 2))
            .await
            .expect("ticks in time")
            .expect("stats sender alive");
        assert_eq!(handle.stats().registered, 1);
        handle.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn status_set_before_connect_is_sent_first() {
        let (probe, address) = loopback_listener().await;
        drop(probe);

        let manager = OutputSignalManager::new(fast_settings());
        let signal = OutputSignal::new("bottleAtPos4", "CapperControllerCD", address.clone());
        manager.register(signal.clone());
        let handle = manager.start();
        let mut stats = handle.subscribe_stats();
        timeout(Duration::from_secs(2), stats.wait_for(|s| s.connect_failures >= 1))
            .await
            .expect("failed connect observed")
            .expect("stats sender alive");

        signal.set_status(true);
        let listener = TcpListener::bind(("127.0.0.1", address.port))
            .await
            .expect("rebind probed port");
        let (mut stream, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("reconnect in time")
            .expect("accept");
        let records = read_records(&mut stream, 1).await;
        assert_eq!(records[0], WireMessage::new("bottleAtPos4", "CapperControllerCD", true));

        handle.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn dropped_connection_is_redialled() {
        let (listener, address) = loopback_listener().await;
        let manager = OutputSignalManager::new(fast_settings());
        manager.register(OutputSignal::new("dosUnitAEvac", "FillerAControllerCD", address));
        let handle = manager.start();

        let (stream, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("connect in time")
            .expect("accept");
        drop(stream);

        let (mut again, _) = timeout(Duration::from_secs(3), listener.accept())
            .await
            .expect("redial in time")
            .expect("accept");
        let records = read_records(&mut again, 1).await;
        assert_eq!(records[0].name, "dosUnitAEvac");
        assert!(handle.stats().send_failures >= 1);

        handle.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn local_only_outputs_stay_off_the_wire() {
        let (listener, address) = loopback_listener().await;
        let manager = OutputSignalManager::new(fast_settings());
        manager.register(
            OutputSignal::new("move2NextPos", "RotaryTableControllerCD", address.clone())
                .send_once()
                .local_only(),
        );
        manager.register(OutputSignal::new(
            "tableAlignedWithSensor",
            "RotaryTableControllerCD",
            address,
        ));
        let handle = manager.start();

        let (mut stream, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("connect in time")
            .expect("accept");
        let records = read_records(&mut stream, 3).await;
        assert!(records.iter().all(|r| r.name == "tableAlignedWithSensor"));

        handle.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn station_with_only_local_outputs_is_never_dialled() {
        let (listener, address) = loopback_listener().await;
        let manager = OutputSignalManager::new(fast_settings());
        let trigger = OutputSignal::new("capperDoProcess", "CapperControllerCD", address)
            .send_once()
            .local_only();
        manager.register(trigger.clone());
        let handle = manager.start();
        let mut stats = handle.subscribe_stats();
        timeout(Duration::from_secs(2), stats.wait_for(|s| s.tick >= 5))
            .await
            .expect("ticks in time")
            .expect("stats sender alive");

        let dialled = timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(dialled.is_err(), "console dialled a station with nothing to send");
        let stats = handle.stats();
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.connect_failures, 0);
        assert!(!trigger.is_linked());

        handle.shutdown().await.expect("clean shutdown");
    }
}
