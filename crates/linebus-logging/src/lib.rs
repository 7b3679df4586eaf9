//! ---
//! lb_section: "03-logging-metrics"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Structured logging context and lifecycle events."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
#![warn(missing_docs)]

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Install a plain stderr subscriber for one-shot tools and tests, without
/// any log files. Filtering follows `LINEBUS_LOG`, then `RUST_LOG`, then
/// info. Later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_env("LINEBUS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()));
    let _ = Registry::default()
        .with(filter)
        .with(subscriber_fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Station-level context attached to log events by the `bus_*` macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Controller-device tag of the station.
    pub station: Option<&'a str>,
    /// Signal name.
    pub signal: Option<&'a str>,
    /// Socket address rendered as `host:port`.
    pub address: Option<&'a str>,
    /// Manager tick counter.
    pub tick: Option<u64>,
}

impl<'a> LogContext<'a> {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the station tag.
    pub fn with_station(mut self, station: &'a str) -> Self {
        self.station = Some(station);
        self
    }

    /// Attach the signal name.
    pub fn with_signal(mut self, signal: &'a str) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Attach the socket address.
    pub fn with_address(mut self, address: &'a str) -> Self {
        self.address = Some(address);
        self
    }

    /// Attach the tick counter.
    pub fn with_tick(mut self, tick: u64) -> Self {
        self.tick = Some(tick);
        self
    }
}

/// Outcome attached to lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventOutcome {
    /// The operation completed.
    Success,
    /// The operation failed; the worker keeps running without it.
    Degraded,
    /// The operation failed.
    Fault,
}

impl SystemEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SystemEventOutcome::Success => "success",
            SystemEventOutcome::Degraded => "degraded",
            SystemEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a lifecycle event (worker start/stop, bind failure) with its outcome.
pub fn log_system_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: SystemEventOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    let station = ctx.station.unwrap_or("");
    let signal = ctx.signal.unwrap_or("");
    let address = ctx.address.unwrap_or("");
    let tick = ctx.tick.unwrap_or_default();
    // tracing::event! needs a constant level per call site.
    match outcome {
        SystemEventOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            station,
            signal,
            address,
            tick,
            message = %message
        ),
        SystemEventOutcome::Degraded => tracing::warn!(
            event,
            outcome = outcome.as_str(),
            station,
            signal,
            address,
            tick,
            message = %message
        ),
        SystemEventOutcome::Fault => tracing::error!(
            event,
            outcome = outcome.as_str(),
            station,
            signal,
            address,
            tick,
            message = %message
        ),
    }
}
