//! ---
//! lb_section: "02-signal-bus"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Station signal bus: model, wire codec, and socket managers."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
use indexmap::map::Entry;
use indexmap::IndexMap;
use tokio::sync::mpsc;

use crate::model::{InputSignal, OutputSignal, SignalIdentity, SocketAddress};

/// Common view over signals the managers can track.
pub trait BusSignal: Clone + Send + 'static {
    /// Uniqueness key of the signal.
    fn identity(&self) -> &SignalIdentity;
    /// Address the signal travels through.
    fn address(&self) -> &SocketAddress;
}

impl BusSignal for OutputSignal {
    fn identity(&self) -> &SignalIdentity {
        OutputSignal::identity(self)
    }

    fn address(&self) -> &SocketAddress {
        OutputSignal::address(self)
    }
}

impl BusSignal for InputSignal {
    fn identity(&self) -> &SignalIdentity {
        InputSignal::identity(self)
    }

    fn address(&self) -> &SocketAddress {
        InputSignal::address(self)
    }
}

/// Identity-keyed set of signals kept in registration order.
#[derive(Debug)]
pub struct SignalRegistry<S> {
    signals: IndexMap<SignalIdentity, S>,
}

impl<S: BusSignal> SignalRegistry<S> {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            signals: IndexMap::new(),
        }
    }

    /// Track `signal` unless its identity is already known.
    ///
    /// Returns `true` when the signal was added.
    pub fn insert(&mut self, signal: S) -> bool {
        match self.signals.entry(signal.identity().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(signal);
                true
            }
        }
    }

    /// Look up a signal by identity.
    pub fn get(&self, identity: &SignalIdentity) -> Option<&S> {
        self.signals.get(identity)
    }

    /// Number of tracked signals.
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Whether no signal is tracked.
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Tracked signals in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &S> {
        self.signals.values()
    }

    /// Distinct addresses in first-registration order.
    pub fn addresses(&self) -> Vec<SocketAddress> {
        let mut seen: IndexMap<&SocketAddress, ()> = IndexMap::new();
        for signal in self.signals.values() {
            seen.entry(signal.address()).or_insert(());
        }
        seen.into_keys().cloned().collect()
    }

    /// Signals bound to `address`.
    pub fn bound_to<'a>(&'a self, address: &'a SocketAddress) -> impl Iterator<Item = &'a S> {
        self.signals
            .values()
            .filter(move |signal| signal.address() == address)
    }
}

impl<S: BusSignal> Default for SignalRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable, thread-safe front door of a manager's registration queue.
///
/// `register` never blocks and may be called from any thread, including
/// threads that are not part of the async runtime.
#[derive(Debug)]
pub struct Registrar<S> {
    tx: mpsc::UnboundedSender<S>,
}

impl<S> Clone for Registrar<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: BusSignal> Registrar<S> {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<S>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue `signal` for the manager. Returns `false` once the manager has stopped.
    pub fn register(&self, signal: S) -> bool {
        self.tx.send(signal).is_ok()
    }
}
