//! ---
//! lb_section: "01-core-functionality"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Shared configuration and tracing bootstrap for the console."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
//! Shared primitives for the linebus workspace.
//! This crate exposes the line configuration model and the tracing
//! bootstrap consumed by the daemon and tooling.

pub mod config;
pub mod logging;

pub use config::{
    BusConfig, InputConfig, LineConfig, LoadedLineConfig, LoggingConfig, MetricsConfig,
    OutputConfig, ReactionConfig, StationConfig, TriggerConfig,
};
pub use logging::{init_tracing, LogFormat};
