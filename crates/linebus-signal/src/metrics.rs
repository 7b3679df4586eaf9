//! ---
//! lb_section: "02-signal-bus"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Station signal bus: model, wire codec, and socket managers."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
use prometheus::{IntCounter, IntGauge, Opts, Registry};
use tracing::trace;

use crate::codec::WireMessage;
use crate::model::SocketAddress;

/// Direction of a record, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordDirection {
    /// Record written to a station.
    Outbound,
    /// Record read from a station.
    Inbound,
}

/// Emit a trace entry for one record crossing the bus.
pub fn log_record(direction: RecordDirection, address: &SocketAddress, message: &WireMessage) {
    trace!(
        direction = ?direction,
        address = %address,
        cd = %message.cd,
        signal = %message.name,
        status = message.status,
        has_value = message.value.is_some(),
        "signal record"
    );
}

/// Prometheus handles for signal bus activity.
#[derive(Clone, Debug)]
pub struct SignalBusMetrics {
    records_sent: IntCounter,
    records_received: IntCounter,
    records_discarded: IntCounter,
    connect_attempts: IntCounter,
    connect_failures: IntCounter,
    send_failures: IntCounter,
    bind_failures: IntCounter,
    connections_active: IntGauge,
    listeners_active: IntGauge,
    producers_active: IntGauge,
}

impl SignalBusMetrics {
    /// Register signal bus metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let records_sent = IntCounter::with_opts(Opts::new(
            "linebus_records_sent_total",
            "Signal records written to station connections",
        ))?;
        let records_received = IntCounter::with_opts(Opts::new(
            "linebus_records_received_total",
            "Signal records parsed from producer connections",
        ))?;
        let records_discarded = IntCounter::with_opts(Opts::new(
            "linebus_records_discarded_total",
            "Inbound fragments dropped as malformed or oversized",
        ))?;
        let connect_attempts = IntCounter::with_opts(Opts::new(
            "linebus_connect_attempts_total",
            "Outbound connection attempts",
        ))?;
        let connect_failures = IntCounter::with_opts(Opts::new(
            "linebus_connect_failures_total",
            "Outbound connection attempts that timed out or were refused",
        ))?;
        let send_failures = IntCounter::with_opts(Opts::new(
            "linebus_send_failures_total",
            "Writes that tore down an outbound connection",
        ))?;
        let bind_failures = IntCounter::with_opts(Opts::new(
            "linebus_bind_failures_total",
            "Local addresses that could not be bound",
        ))?;
        let connections_active = IntGauge::with_opts(Opts::new(
            "linebus_outbound_connections",
            "Live outbound station connections",
        ))?;
        let listeners_active = IntGauge::with_opts(Opts::new(
            "linebus_listeners",
            "Bound inbound listening sockets",
        ))?;
        let producers_active = IntGauge::with_opts(Opts::new(
            "linebus_inbound_connections",
            "Accepted producer connections",
        ))?;

        registry.register(Box::new(records_sent.clone()))?;
        registry.register(Box::new(records_received.clone()))?;
        registry.register(Box::new(records_discarded.clone()))?;
        registry.register(Box::new(connect_attempts.clone()))?;
        registry.register(Box::new(connect_failures.clone()))?;
        registry.register(Box::new(send_failures.clone()))?;
        registry.register(Box::new(bind_failures.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(listeners_active.clone()))?;
        registry.register(Box::new(producers_active.clone()))?;

        Ok(Self {
            records_sent,
            records_received,
            records_discarded,
            connect_attempts,
            connect_failures,
            send_failures,
            bind_failures,
            connections_active,
            listeners_active,
            producers_active,
        })
    }

    pub(crate) fn observe_sent(&self, records: usize) {
        self.records_sent.inc_by(records as u64);
    }

    pub(crate) fn observe_received(&self) {
        self.records_received.inc();
    }

    pub(crate) fn observe_discarded(&self) {
        self.records_discarded.inc();
    }

    pub(crate) fn observe_connect(&self, success: bool) {
        self.connect_attempts.inc();
        if !success {
            self.connect_failures.inc();
        }
    }

    pub(crate) fn observe_send_failure(&self) {
        self.send_failures.inc();
    }

    pub(crate) fn observe_bind_failure(&self) {
        self.bind_failures.inc();
    }

    pub(crate) fn set_connections(&self, count: usize) {
        self.connections_active.set(count as i64);
    }

    pub(crate) fn set_listeners(&self, count: usize) {
        self.listeners_active.set(count as i64);
    }

    pub(crate) fn set_producers(&self, count: usize) {
        self.producers_active.set(count as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_count() {
        let registry = Registry::new();
        let metrics = SignalBusMetrics::register(&registry).expect("register metrics");
        metrics.observe_sent(3);
        metrics.observe_connect(false);
        metrics.set_connections(1);

        let families = registry.gather();
        let sent = families
            .iter()
            .find(|f| f.get_name() == "linebus_records_sent_total")
            .expect("sent family");
        assert_eq!(sent.get_metric()[0].get_counter().get_value() as u64, 3);
        assert!(families
            .iter()
            .any(|f| f.get_name() == "linebus_connect_failures_total"));
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = Registry::new();
        SignalBusMetrics::register(&registry).expect("first registration");
        assert!(SignalBusMetrics::register(&registry).is_err());
    }
}
