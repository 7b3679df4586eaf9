//! ---
//! lb_section: "02-signal-bus"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Station signal bus: model, wire codec, and socket managers."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
//! Inbound half of the bus.
//!
//! One task owns every listening socket and every accepted producer
//! connection. Their readiness is merged into a single [`SelectAll`] set, so
//! the task waits on all descriptors at once without spawning per-connection
//! work.
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::{self, BoxStream, SelectAll};
use futures::StreamExt;
use linebus_logging::{
    bus_debug, bus_info, bus_warn, log_system_event, LogContext, SystemEventOutcome,
};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::codec::{Decoded, RecordDecoder, WireMessage, DEFAULT_MAX_RECORD_BYTES};
use crate::metrics::{log_record, RecordDirection, SignalBusMetrics};
use crate::model::{InputSignal, SignalUpdate, SocketAddress};
use crate::registry::{Registrar, SignalRegistry};
use crate::{BusError, Result};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Receiving end of parsed signal updates.
pub type UpdateReceiver = mpsc::UnboundedReceiver<SignalUpdate>;

/// Tuning knobs of the input loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSettings {
    /// Longest idle wait on the readiness set before the loop turns over.
    pub poll_timeout: Duration,
    /// Bytes requested per socket read.
    pub read_chunk_bytes: usize,
    /// Bound on bytes pending without a record delimiter.
    pub max_record_bytes: usize,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            read_chunk_bytes: 1024,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }
}

/// Counters published after every handled event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputStats {
    /// Distinct input identities tracked.
    pub registered: usize,
    /// Bound listening sockets, one per address.
    pub listeners: usize,
    /// Open producer connections.
    pub connections: usize,
    /// Records delivered to the subscriber.
    pub records_received: u64,
    /// Fragments dropped as malformed or oversized.
    pub records_discarded: u64,
    /// Addresses that could not be bound.
    pub bind_failures: u64,
    /// Requested address paired with the address actually bound.
    pub bound: Vec<(SocketAddress, SocketAddress)>,
}

impl InputStats {
    /// Address actually bound for `requested`, if any.
    pub fn local_addr(&self, requested: &SocketAddress) -> Option<&SocketAddress> {
        self.bound
            .iter()
            .find(|(wanted, _)| wanted == requested)
            .map(|(_, actual)| actual)
    }
}

/// Owner of inbound listening sockets and producer connections.
pub struct InputSignalManager {
    settings: InputSettings,
    registrar: Registrar<InputSignal>,
    queue: mpsc::UnboundedReceiver<InputSignal>,
    updates: mpsc::UnboundedSender<SignalUpdate>,
    stats: watch::Sender<InputStats>,
    metrics: Option<SignalBusMetrics>,
}

impl InputSignalManager {
    /// Manager with the given settings plus the channel its updates arrive on.
    pub fn new(settings: InputSettings) -> (Self, UpdateReceiver) {
        let (registrar, queue) = Registrar::channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let (stats, _) = watch::channel(InputStats::default());
        let manager = Self {
            settings,
            registrar,
            queue,
            updates,
            stats,
            metrics: None,
        };
        (manager, updates_rx)
    }

    /// Report activity to the provided metrics.
    pub fn with_metrics(mut self, metrics: SignalBusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cloneable registration front door.
    pub fn registrar(&self) -> Registrar<InputSignal> {
        self.registrar.clone()
    }

    /// Queue an input for tracking.
    pub fn register(&self, signal: InputSignal) -> bool {
        self.registrar.register(signal)
    }

    /// Subscribe to the counters.
    pub fn stats(&self) -> watch::Receiver<InputStats> {
        self.stats.subscribe()
    }

    /// Spawn the loop on the current runtime.
    pub fn start(self) -> InputManagerHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let registrar = self.registrar.clone();
        let stats = self.stats.subscribe();
        let task = tokio::spawn(self.run(shutdown_rx));
        InputManagerHandle {
            registrar,
            stats,
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Serve listeners and producers until `shutdown` fires or its sender is dropped.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let poll_timeout = self.settings.poll_timeout;
        let mut queue = self.queue;
        let mut queue_open = true;
        let mut worker = InputWorker {
            settings: self.settings,
            registry: SignalRegistry::new(),
            listeners: HashMap::new(),
            failed_binds: HashSet::new(),
            connections: HashMap::new(),
            readiness: SelectAll::new(),
            updates: self.updates,
            stats: self.stats,
            metrics: self.metrics,
            next_connection: 0,
            records_received: 0,
            records_discarded: 0,
        };
        log_system_event(
            None,
            "input.start",
            "input signal manager running",
            SystemEventOutcome::Success,
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                registration = queue.recv(), if queue_open => match registration {
                    Some(signal) => worker.register(signal).await,
                    None => queue_open = false,
                },
                ready = worker.readiness.next(), if !worker.readiness.is_empty() => {
                    if let Some(event) = ready {
                        worker.handle(event);
                    }
                }
                _ = tokio::time::sleep(poll_timeout) => continue,
            }
            worker.publish_stats();
        }

        worker.close_all();
        log_system_event(
            None,
            "input.stop",
            "input signal manager stopped",
            SystemEventOutcome::Success,
        );
        Ok(())
    }
}

/// Handle to a spawned [`InputSignalManager`].
#[derive(Debug)]
pub struct InputManagerHandle {
    registrar: Registrar<InputSignal>,
    stats: watch::Receiver<InputStats>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl InputManagerHandle {
    /// Queue an input for tracking.
    pub fn register(&self, signal: InputSignal) -> bool {
        self.registrar.register(signal)
    }

    /// Cloneable registration front door.
    pub fn registrar(&self) -> Registrar<InputSignal> {
        self.registrar.clone()
    }

    /// Latest published counters.
    pub fn stats(&self) -> InputStats {
        self.stats.borrow().clone()
    }

    /// Subscribe to the counters.
    pub fn subscribe_stats(&self) -> watch::Receiver<InputStats> {
        self.stats.clone()
    }

    /// Address actually bound for `requested`, once its listener is up.
    pub fn local_addr(&self, requested: &SocketAddress) -> Option<SocketAddress> {
        self.stats.borrow().local_addr(requested).cloned()
    }

    /// Stop the loop, close listeners and producers, and wait for the task.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                log_system_event(
                    None,
                    "input.stop",
                    &format!("input signal manager task failed: {err}"),
                    SystemEventOutcome::Fault,
                );
                Err(BusError::Worker(err.to_string()))
            }
        }
    }
}

type ConnectionId = u64;

enum Readiness {
    Accepted {
        listener: SocketAddress,
        result: io::Result<(TcpStream, SocketAddr)>,
    },
    Data {
        connection: ConnectionId,
        bytes: Vec<u8>,
    },
    Closed {
        connection: ConnectionId,
        error: Option<io::Error>,
    },
}

struct InboundConnection {
    peer: SocketAddress,
    listener: SocketAddress,
    decoder: RecordDecoder,
}

struct InputWorker {
    settings: InputSettings,
    registry: SignalRegistry<InputSignal>,
    listeners: HashMap<SocketAddress, SocketAddress>,
    failed_binds: HashSet<SocketAddress>,
    connections: HashMap<ConnectionId, InboundConnection>,
    readiness: SelectAll<BoxStream<'static, Readiness>>,
    updates: mpsc::UnboundedSender<SignalUpdate>,
    stats: watch::Sender<InputStats>,
    metrics: Option<SignalBusMetrics>,
    next_connection: ConnectionId,
    records_received: u64,
    records_discarded: u64,
}

impl InputWorker {
    async fn register(&mut self, signal: InputSignal) {
        let address = signal.address().clone();
        if !self.registry.insert(signal) {
            return;
        }
        if self.listeners.contains_key(&address) || self.failed_binds.contains(&address) {
            return;
        }

        let rendered = address.to_string();
        let ctx = LogContext::new().with_address(&rendered);
        match bind(&address).await {
            Ok(listener) => {
                let actual = listener
                    .local_addr()
                    .map(SocketAddress::from)
                    .unwrap_or_else(|_| address.clone());
                bus_info!(context = ctx, "listening for station producers on {}", actual);
                self.listeners.insert(address.clone(), actual);
                self.readiness.push(accept_stream(address, listener));
                if let Some(metrics) = &self.metrics {
                    metrics.set_listeners(self.listeners.len());
                }
            }
            Err(err) => {
                log_system_event(
                    Some(&ctx),
                    "input.bind",
                    &format!("address will not be retried during this run: {err}"),
                    SystemEventOutcome::Degraded,
                );
                if let Some(metrics) = &self.metrics {
                    metrics.observe_bind_failure();
                }
                self.failed_binds.insert(address);
            }
        }
    }

    fn handle(&mut self, event: Readiness) {
        match event {
            Readiness::Accepted { listener, result } => match result {
                Ok((stream, peer)) => self.accept(listener, stream, peer),
                Err(err) => {
                    let rendered = listener.to_string();
                    bus_warn!(
                        context = LogContext::new().with_address(&rendered),
                        "accept failed: {}",
                        err
                    );
                }
            },
            Readiness::Data { connection, bytes } => {
                let decoded = match self.connections.get_mut(&connection) {
                    Some(conn) => conn.decoder.push(&bytes),
                    None => return,
                };
                self.consume(connection, decoded);
            }
            Readiness::Closed { connection, error } => self.close(connection, error),
        }
    }

    fn accept(&mut self, listener: SocketAddress, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_connection;
        self.next_connection += 1;
        let peer = SocketAddress::from(peer);
        let rendered = listener.to_string();
        bus_info!(
            context = LogContext::new().with_address(&rendered),
            "producer connected from {}",
            peer
        );
        self.connections.insert(
            id,
            InboundConnection {
                peer,
                listener,
                decoder: RecordDecoder::new(self.settings.max_record_bytes),
            },
        );
        self.readiness
            .push(read_stream(id, stream, self.settings.read_chunk_bytes));
        if let Some(metrics) = &self.metrics {
            metrics.set_producers(self.connections.len());
        }
    }

    fn close(&mut self, connection: ConnectionId, error: Option<io::Error>) {
        let Some(mut conn) = self.connections.remove(&connection) else {
            return;
        };
        if let Some(last) = conn.decoder.finish() {
            self.consume(connection, vec![last]);
        }
        let rendered = conn.listener.to_string();
        let ctx = LogContext::new().with_address(&rendered);
        match error {
            Some(err) => bus_warn!(context = ctx, "producer {} dropped: {}", conn.peer, err),
            None => bus_info!(context = ctx, "producer {} closed the connection", conn.peer),
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_producers(self.connections.len());
        }
    }

    fn consume(&mut self, connection: ConnectionId, decoded: Vec<Decoded>) {
        for outcome in decoded {
            match outcome {
                Decoded::Message(message) => self.deliver(connection, message),
                Decoded::Discarded(err) => {
                    self.records_discarded += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_discarded();
                    }
                    bus_debug!("dropped inbound fragment on connection {}: {}", connection, err);
                }
            }
        }
    }

    fn deliver(&mut self, connection: ConnectionId, message: WireMessage) {
        if let Some(conn) = self.connections.get(&connection) {
            log_record(RecordDirection::Inbound, &conn.listener, &message);
        }
        self.records_received += 1;
        if let Some(metrics) = &self.metrics {
            metrics.observe_received();
        }

        let update = SignalUpdate::from(message);
        if let Some(signal) = self.registry.get(&update.identity) {
            signal.state().set_level(update.level());
        }
        // A dropped subscriber only stops notifications; the input states
        // above keep tracking the line.
        let _ = self.updates.send(update);
    }

    fn publish_stats(&self) {
        self.stats.send_replace(InputStats {
            registered: self.registry.len(),
            listeners: self.listeners.len(),
            connections: self.connections.len(),
            records_received: self.records_received,
            records_discarded: self.records_discarded,
            bind_failures: self.failed_binds.len() as u64,
            bound: self
                .listeners
                .iter()
                .map(|(requested, actual)| (requested.clone(), actual.clone()))
                .collect(),
        });
    }

    fn close_all(&mut self) {
        self.readiness = SelectAll::new();
        self.connections.clear();
        self.listeners.clear();
        if let Some(metrics) = &self.metrics {
            metrics.set_listeners(0);
            metrics.set_producers(0);
        }
        self.publish_stats();
    }
}

async fn bind(address: &SocketAddress) -> Result<TcpListener> {
    TcpListener::bind((address.host.as_str(), address.port))
        .await
        .map_err(|source| BusError::BindFailed {
            address: address.clone(),
            source,
        })
}

fn accept_stream(address: SocketAddress, listener: TcpListener) -> BoxStream<'static, Readiness> {
    stream::unfold(listener, move |listener| {
        let address = address.clone();
        async move {
            let result = listener.accept().await;
            if result.is_err() {
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
            Some((
                Readiness::Accepted {
                    listener: address,
                    result,
                },
                listener,
            ))
        }
    })
    .boxed()
}

fn read_stream(
    connection: ConnectionId,
    stream: TcpStream,
    chunk: usize,
) -> BoxStream<'static, Readiness> {
    stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        let mut buf = vec![0u8; chunk];
        match stream.read(&mut buf).await {
            Ok(0) => Some((
                Readiness::Closed {
                    connection,
                    error: None,
                },
                None,
            )),
            Ok(n) => {
                buf.truncate(n);
                Some((Readiness::Data { connection, bytes: buf }, Some(stream)))
            }
            Err(err) => Some((
                Readiness::Closed {
                    connection,
                    error: Some(err),
                },
                None,
            )),
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_record;
    use crate::model::SignalIdentity;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    fn fast_settings() -> InputSettings {
        InputSettings {
            poll_timeout: Duration::from_millis(50),
            ..InputSettings::default()
        }
    }

    async fn wait_stats(
        handle: &InputManagerHandle,
        predicate: impl FnMut(&InputStats) -> bool,
    ) -> InputStats {
        let mut stats = handle.subscribe_stats();
        let guard = timeout(Duration::from_secs(2), stats.wait_for(predicate))
            .await
            .expect("stats reached in time")
            .expect("stats sender alive");
        (*guard).clone()
    }

    fn record(name: &str, cd: &str, status: bool) -> Vec<u8> {
        encode_record(&WireMessage::new(name, cd, status)).expect("encodable")
    }

    async fn producer(address: &SocketAddress) -> TcpStream {
        TcpStream::connect((address.host.as_str(), address.port))
            .await
            .expect("producer connects")
    }

    async fn next_update(updates: &mut UpdateReceiver) -> SignalUpdate {
        timeout(Duration::from_secs(2), updates.recv())
            .await
            .expect("update in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn shared_address_binds_once_and_serves_two_producers() {
        let requested = SocketAddress::loopback(0);
        let (manager, mut updates) = InputSignalManager::new(fast_settings());
        let filler = InputSignal::new("valveInjectorAOnOff", "FillerModel", requested.clone());
        let idle = InputSignal::new("fillerAIdle", "Coordinator", requested.clone());
        manager.register(filler);
        manager.register(idle);
        let handle = manager.start();

        let stats = wait_stats(&handle, |s| s.registered == 2 && s.listeners == 1).await;
        let actual = stats.local_addr(&requested).expect("bound").clone();

        let mut first = producer(&actual).await;
        let mut second = producer(&actual).await;
        wait_stats(&handle, |s| s.connections == 2).await;
        first
            .write_all(&record("valveInjectorAOnOff", "FillerModel", true))
            .await
            .unwrap();
        second
            .write_all(&record("fillerAIdle", "Coordinator", true))
            .await
            .unwrap();

        let mut names = vec![
            next_update(&mut updates).await.identity.name,
            next_update(&mut updates).await.identity.name,
        ];
        names.sort();
        assert_eq!(names, vec!["fillerAIdle", "valveInjectorAOnOff"]);
        assert_eq!(handle.stats().listeners, 1);

        handle.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn malformed_fragment_is_dropped_without_closing() {
        let requested = SocketAddress::loopback(0);
        let (manager, mut updates) = InputSignalManager::new(fast_settings());
        manager.register(InputSignal::new("capperIdle", "Coordinator", requested.clone()));
        let handle = manager.start();
        let actual = wait_stats(&handle, |s| s.listeners == 1)
            .await
            .local_addr(&requested)
            .cloned()
            .expect("bound");

        let mut stream = producer(&actual).await;
        stream.write_all(b"{\"name\":\"capperId\r\n").await.unwrap();
        stream
            .write_all(&record("capperIdle", "Coordinator", true))
            .await
            .unwrap();

        let update = next_update(&mut updates).await;
        assert_eq!(update.identity, SignalIdentity::new("capperIdle", "Coordinator"));
        assert!(updates.try_recv().is_err());
        let stats = wait_stats(&handle, |s| s.records_discarded == 1).await;
        assert_eq!(stats.connections, 1);

        handle.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn registered_input_tracks_latest_level() {
        let requested = SocketAddress::loopback(0);
        let (manager, mut updates) = InputSignalManager::new(fast_settings());
        let input = InputSignal::new("POS", "POS", requested.clone());
        manager.register(input.clone());
        let handle = manager.start();
        let actual = wait_stats(&handle, |s| s.listeners == 1)
            .await
            .local_addr(&requested)
            .cloned()
            .expect("bound");

        let mut stream = producer(&actual).await;
        let order = WireMessage::new("POS", "POS", true).with_value("{\"orderId\":12}");
        stream.write_all(&encode_record(&order).unwrap()).await.unwrap();

        let update = next_update(&mut updates).await;
        assert_eq!(update.value.as_deref(), Some("{\"orderId\":12}"));
        assert!(input.status());
        assert_eq!(input.state().level().value.as_deref(), Some("{\"orderId\":12}"));

        handle.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn closed_producer_is_deregistered() {
        let requested = SocketAddress::loopback(0);
        let (manager, mut updates) = InputSignalManager::new(fast_settings());
        let motor = InputSignal::new("motConveyorOnOff", "ConveyorModel", requested.clone());
        manager.register(motor);
        let handle = manager.start();
        let actual = wait_stats(&handle, |s| s.listeners == 1)
            .await
            .local_addr(&requested)
            .cloned()
            .expect("bound");

        let mut stream = producer(&actual).await;
        wait_stats(&handle, |s| s.connections == 1).await;
        // Last record without a delimiter is flushed when the producer hangs up.
        stream
            .write_all(b"{\"name\":\"motConveyorOnOff\",\"cd\":\"ConveyorModel\",\"status\":true}")
            .await
            .unwrap();
        drop(stream);

        let stats = wait_stats(&handle, |s| s.connections == 0).await;
        assert_eq!(stats.listeners, 1);
        assert!(next_update(&mut updates).await.status);

        handle.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn bind_failure_is_not_retried() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").expect("occupy port");
        let address = SocketAddress::from(occupied.local_addr().expect("local addr"));

        let (manager, _updates) = InputSignalManager::new(fast_settings());
        manager.register(InputSignal::new("rotaryIdle", "Coordinator", address.clone()));
        let handle = manager.start();
        wait_stats(&handle, |s| s.bind_failures == 1).await;

        handle.register(InputSignal::new("rotaryTableTrigger", "RotaryTableModel", address));
        let stats = wait_stats(&handle, |s| s.registered == 2).await;
        assert_eq!(stats.bind_failures, 1);
        assert_eq!(stats.listeners, 0);

        handle.shutdown().await.expect("clean shutdown");
    }
}
