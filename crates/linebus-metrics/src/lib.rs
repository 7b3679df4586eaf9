//! ---
//! lb_section: "03-logging-metrics"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Metrics collection and export utilities."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder, TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the console.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener.local_addr().unwrap_or(addr);
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Address the exporter actually bound.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "linebusd_starts_total",
            "Total number of times the console daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "linebusd_config_load_seconds",
                "Time spent loading and validating the line configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "linebusd_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, profile])
            .set(1.0);
    }
}

/// Line-level view: stations wired and sequences run on their behalf.
#[derive(Clone, Debug)]
pub struct LineMetrics {
    registry: SharedRegistry,
    stations_total: IntGauge,
    station_signals: IntGaugeVec,
    sequences_run: IntCounterVec,
    sequence_failures: IntCounterVec,
}

impl LineMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let stations_total = IntGauge::with_opts(Opts::new(
            "linebus_stations_total",
            "Number of stations wired into the console",
        ))?;
        registry.register(Box::new(stations_total.clone()))?;

        let station_signals = IntGaugeVec::new(
            Opts::new(
                "linebus_station_signals",
                "Signals registered per station and direction",
            ),
            &["station", "direction"],
        )?;
        registry.register(Box::new(station_signals.clone()))?;

        let sequences_run = IntCounterVec::new(
            Opts::new(
                "linebus_sequences_run_total",
                "Sequences started by station, sequence and cause",
            ),
            &["station", "sequence", "cause"],
        )?;
        registry.register(Box::new(sequences_run.clone()))?;

        let sequence_failures = IntCounterVec::new(
            Opts::new(
                "linebus_sequence_failures_total",
                "Sequences that could not be run",
            ),
            &["station", "sequence"],
        )?;
        registry.register(Box::new(sequence_failures.clone()))?;

        Ok(Self {
            registry,
            stations_total,
            station_signals,
            sequences_run,
            sequence_failures,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn set_station_count(&self, count: usize) {
        self.stations_total.set(count as i64);
    }

    pub fn set_station_signals(&self, station: &str, outputs: usize, inputs: usize) {
        self.station_signals
            .with_label_values(&[station, "output"])
            .set(outputs as i64);
        self.station_signals
            .with_label_values(&[station, "input"])
            .set(inputs as i64);
    }

    pub fn record_sequence(&self, station: &str, sequence: &str, cause: &str) {
        self.sequences_run
            .with_label_values(&[station, sequence, cause])
            .inc();
    }

    pub fn record_sequence_failure(&self, station: &str, sequence: &str) {
        self.sequence_failures
            .with_label_values(&[station, sequence])
            .inc();
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn daemon_metrics_register_once() {
        let registry = new_registry();
        let metrics = DaemonMetrics::new(registry.clone()).expect("register");
        metrics.inc_start();
        metrics.set_build_info("0.1.0", "debug");
        assert!(DaemonMetrics::new(registry).is_err());
    }

    #[test]
    fn line_metrics_track_sequences() {
        let registry = new_registry();
        let metrics = LineMetrics::new(registry.clone()).expect("register");
        metrics.set_station_count(3);
        metrics.set_station_signals("capper", 6, 6);
        metrics.record_sequence("rotary", "align", "reaction");
        metrics.record_sequence("rotary", "align", "reaction");
        assert_eq!(
            metrics
                .sequences_run
                .with_label_values(&["rotary", "align", "reaction"])
                .get(),
            2
        );
        assert_eq!(metrics.stations_total.get(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exporter_serves_registered_metrics() {
        let registry = new_registry();
        let metrics = DaemonMetrics::new(registry.clone()).expect("register");
        metrics.inc_start();
        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).expect("spawn");

        let mut stream = tokio::net::TcpStream::connect(server.addr())
            .await
            .expect("connect");
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("write request");
        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .expect("read response");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response
            .to_ascii_lowercase()
            .contains("content-type: text/plain; version=0.0.4"));
        assert!(response.contains("linebusd_starts_total 1"));

        server.shutdown().await.expect("shutdown");
    }
}
