//! ---
//! lb_section: "02-signal-bus"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Station signal bus: model, wire codec, and socket managers."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::codec::WireMessage;
use crate::BusError;

/// Default host stations bind and connect on.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Network endpoint used as the dedup key for connections and listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SocketAddress {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl SocketAddress {
    /// Construct an address from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address on the loopback interface.
    pub fn loopback(port: u16) -> Self {
        Self::new(DEFAULT_HOST, port)
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for SocketAddress {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| BusError::InvalidAddress(s.to_owned()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(BusError::InvalidAddress(s.to_owned()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| BusError::InvalidAddress(s.to_owned()))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for SocketAddress {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SocketAddress> for String {
    fn from(value: SocketAddress) -> Self {
        value.to_string()
    }
}

impl From<std::net::SocketAddr> for SocketAddress {
    fn from(value: std::net::SocketAddr) -> Self {
        Self::new(value.ip().to_string(), value.port())
    }
}

/// Identity of one logical signal: its name plus the controller-device tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalIdentity {
    /// Signal name, unique within its controller device.
    pub name: String,
    /// Controller-device tag grouping the signals of one station.
    pub controller_device: String,
}

impl SignalIdentity {
    /// Construct an identity.
    pub fn new(name: impl Into<String>, controller_device: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            controller_device: controller_device.into(),
        }
    }
}

impl fmt::Display for SignalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.controller_device, self.name)
    }
}

/// Status and optional payload of a signal, read and written together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalLevel {
    /// Boolean status shown as a light on the console.
    pub status: bool,
    /// Optional string payload (the POS station carries order JSON here).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl SignalLevel {
    /// Level with the given status and no payload.
    pub fn with_status(status: bool) -> Self {
        Self {
            status,
            value: None,
        }
    }
}

/// Shared cell holding the latest [`SignalLevel`] of a signal.
///
/// Writers on any thread replace the level atomically; the last write wins.
/// Readers either sample the current level or subscribe to changes.
#[derive(Debug, Clone)]
pub struct SignalState {
    cell: Arc<watch::Sender<SignalLevel>>,
}

impl SignalState {
    /// Create a cell seeded with `initial`.
    pub fn new(initial: SignalLevel) -> Self {
        let (cell, _) = watch::channel(initial);
        Self {
            cell: Arc::new(cell),
        }
    }

    /// Snapshot of the current level.
    pub fn level(&self) -> SignalLevel {
        self.cell.borrow().clone()
    }

    /// Current status.
    pub fn status(&self) -> bool {
        self.cell.borrow().status
    }

    /// Replace the whole level.
    pub fn set_level(&self, level: SignalLevel) {
        self.cell.send_if_modified(|current| {
            if *current == level {
                return false;
            }
            *current = level;
            true
        });
    }

    /// Replace the status, keeping the payload.
    pub fn set_status(&self, status: bool) {
        self.cell.send_if_modified(|current| {
            if current.status == status {
                return false;
            }
            current.status = status;
            true
        });
    }

    /// Replace the payload, keeping the status.
    pub fn set_value(&self, value: Option<String>) {
        self.cell.send_if_modified(|current| {
            if current.value == value {
                return false;
            }
            current.value = value;
            true
        });
    }

    /// Subscribe to level changes.
    pub fn subscribe(&self) -> watch::Receiver<SignalLevel> {
        self.cell.subscribe()
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new(SignalLevel::default())
    }
}

/// Output published by the console towards a remote station.
///
/// Clones share the same state cell, so the copy held by the console widgets
/// and the copy registered with the [`crate::OutputSignalManager`] always
/// agree on the latest level.
#[derive(Debug, Clone)]
pub struct OutputSignal {
    identity: SignalIdentity,
    address: SocketAddress,
    send_once: bool,
    local_only: bool,
    state: SignalState,
    link: Arc<AtomicBool>,
}

impl OutputSignal {
    /// Output bound to `address` with status `false`.
    pub fn new(
        name: impl Into<String>,
        controller_device: impl Into<String>,
        address: SocketAddress,
    ) -> Self {
        Self {
            identity: SignalIdentity::new(name, controller_device),
            address,
            send_once: false,
            local_only: false,
            state: SignalState::default(),
            link: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Seed the initial status.
    pub fn with_initial_status(self, status: bool) -> Self {
        self.state.set_status(status);
        self
    }

    /// Mark as a momentary "fire and reset" action rather than a toggle.
    pub fn send_once(mut self) -> Self {
        self.send_once = true;
        self
    }

    /// Keep the signal on the console only; it is tracked but never sent.
    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    /// Identity of the signal.
    pub fn identity(&self) -> &SignalIdentity {
        &self.identity
    }

    /// Signal name.
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Remote address the signal is delivered to.
    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    /// Whether the signal is a momentary action.
    pub fn is_send_once(&self) -> bool {
        self.send_once
    }

    /// Whether the signal is kept off the wire.
    pub fn is_local_only(&self) -> bool {
        self.local_only
    }

    /// Shared state cell.
    pub fn state(&self) -> &SignalState {
        &self.state
    }

    /// Snapshot of status and payload.
    pub fn level(&self) -> SignalLevel {
        self.state.level()
    }

    /// Current status.
    pub fn status(&self) -> bool {
        self.state.status()
    }

    /// Change the status. The new value goes out on the next tick.
    pub fn set_status(&self, status: bool) {
        self.state.set_status(status);
    }

    /// Change the payload.
    pub fn set_value(&self, value: Option<String>) {
        self.state.set_value(value);
    }

    /// Change status and payload together.
    pub fn set_level(&self, level: SignalLevel) {
        self.state.set_level(level);
    }

    /// Raise a momentary action. Resetting it is up to the caller.
    pub fn fire(&self) {
        self.state.set_status(true);
    }

    /// Subscribe to level changes.
    pub fn subscribe(&self) -> watch::Receiver<SignalLevel> {
        self.state.subscribe()
    }

    /// Whether the output manager holds a live connection for this address.
    pub fn is_linked(&self) -> bool {
        self.link.load(Ordering::Acquire)
    }

    pub(crate) fn set_linked(&self, linked: bool) {
        self.link.store(linked, Ordering::Release);
    }

    /// Wire projection of the current level.
    pub fn to_wire(&self) -> WireMessage {
        let level = self.level();
        WireMessage {
            name: self.identity.name.clone(),
            cd: self.identity.controller_device.clone(),
            status: level.status,
            value: level.value,
        }
    }
}

/// Passive registration describing where inbound data for a signal arrives.
#[derive(Debug, Clone)]
pub struct InputSignal {
    identity: SignalIdentity,
    address: SocketAddress,
    state: SignalState,
}

impl InputSignal {
    /// Input expected on the local `address`.
    pub fn new(
        name: impl Into<String>,
        controller_device: impl Into<String>,
        address: SocketAddress,
    ) -> Self {
        Self {
            identity: SignalIdentity::new(name, controller_device),
            address,
            state: SignalState::default(),
        }
    }

    /// Identity of the signal.
    pub fn identity(&self) -> &SignalIdentity {
        &self.identity
    }

    /// Signal name.
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Local address the signal's producer connects to.
    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    /// Shared state cell, written by the input manager.
    pub fn state(&self) -> &SignalState {
        &self.state
    }

    /// Current status.
    pub fn status(&self) -> bool {
        self.state.status()
    }

    /// Subscribe to level changes.
    pub fn subscribe(&self) -> watch::Receiver<SignalLevel> {
        self.state.subscribe()
    }
}

/// Notification raised when an inbound record has been parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalUpdate {
    /// Identity carried by the record.
    pub identity: SignalIdentity,
    /// Status carried by the record.
    pub status: bool,
    /// Optional payload carried by the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl SignalUpdate {
    /// Level described by the update.
    pub fn level(&self) -> SignalLevel {
        SignalLevel {
            status: self.status,
            value: self.value.clone(),
        }
    }
}

impl From<WireMessage> for SignalUpdate {
    fn from(message: WireMessage) -> Self {
        Self {
            identity: SignalIdentity::new(message.name, message.cd),
            status: message.status,
            value: message.value,
        }
    }
}
