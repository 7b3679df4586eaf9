//! ---
//! lb_section: "01-core-functionality"
//! lb_subsection: "binary"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Binary entrypoint for the linebus console daemon."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
mod line;
mod tools;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use linebus_common::config::LineConfig;
use linebus_common::logging::init_tracing;
use linebus_metrics::{new_registry, spawn_http_server, DaemonMetrics};
use linebus_signal::{SocketAddress, WireMessage};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::line::start_line;

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("linebusd ", env!("CARGO_PKG_VERSION")),
    about = "Bottling line console: station signal bus daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the console against the configured stations")]
    Run {
        #[arg(
            long,
            value_name = "FILE",
            requires = "station",
            help = "Replay output changes from NDJSON"
        )]
        replay: Option<PathBuf>,
        #[arg(long, value_name = "NAME", help = "Station whose outputs the replay drives")]
        station: Option<String>,
    },
    #[command(about = "Send one record to a console input port")]
    Inject {
        #[arg(long, value_name = "HOST:PORT")]
        to: SocketAddress,
        #[arg(long)]
        name: String,
        #[arg(long)]
        cd: String,
        #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
        status: bool,
        #[arg(long)]
        value: Option<String>,
        #[arg(long, default_value_t = 1000, value_name = "MS")]
        connect_timeout_ms: u64,
    },
    #[command(about = "Listen like a station and print every record the console sends")]
    Monitor {
        #[arg(long, value_name = "HOST:PORT")]
        listen: SocketAddress,
    },
    #[command(about = "Load and validate the configuration, then print a summary")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run {
        replay: None,
        station: None,
    }) {
        Commands::Run { replay, station } => {
            let replay = replay.zip(station);
            run_daemon(cli.config, replay).await
        }
        Commands::Inject {
            to,
            name,
            cd,
            status,
            value,
            connect_timeout_ms,
        } => {
            init_tool_tracing();
            let mut message = WireMessage::new(name, cd, status);
            message.value = value;
            tools::inject(&to, &message, Duration::from_millis(connect_timeout_ms)).await
        }
        Commands::Monitor { listen } => {
            init_tool_tracing();
            run_monitor(listen).await
        }
        Commands::CheckConfig => check_config(cli.config),
    }
}

fn config_candidates(explicit: Option<PathBuf>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path);
    }
    candidates.push(PathBuf::from("configs/line.toml"));
    candidates.push(PathBuf::from("configs/line.example.toml"));
    candidates
}

fn init_tool_tracing() {
    // Bench tools log to stderr only; stdout carries monitored records.
    linebus_logging::init();
}

async fn run_daemon(config: Option<PathBuf>, replay: Option<(PathBuf, String)>) -> Result<()> {
    let load_started = Instant::now();
    let loaded = LineConfig::load_with_source(&config_candidates(config))?;
    let load_duration = load_started.elapsed();
    let config = loaded.config;

    init_tracing("linebusd", &config.logging)?;
    info!(
        config_path = %loaded.source.display(),
        stations = config.stations.len(),
        "configuration loaded"
    );

    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(
        env!("CARGO_PKG_VERSION"),
        if cfg!(debug_assertions) { "debug" } else { "release" },
    );

    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(daemon_metrics.registry(), config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let mut line = start_line(&config, Some(&registry))?;
    if let Some((path, station)) = replay {
        info!(station = %station, path = %path.display(), "replay scheduled");
        line.replay(&station, path)?;
    }

    info!("console running; waiting for termination signal");
    shutdown_signal().await;
    let sent = line.outputs().stats();
    let received = line.inputs().stats();
    info!(
        records_sent = sent.records_sent,
        records_received = received.records_received,
        records_discarded = received.records_discarded,
        "termination signal received; shutting down"
    );

    line.shutdown().await?;
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn run_monitor(listen: SocketAddress) -> Result<()> {
    let listener = TcpListener::bind((listen.host.as_str(), listen.port))
        .await
        .with_context(|| format!("failed to bind monitor on {}", listen))?;
    info!(address = %listen, "monitor listening");

    let (records_tx, mut records) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let monitor = tokio::spawn(tools::monitor(listener, records_tx, shutdown_rx));

    let stop = shutdown_signal();
    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            record = records.recv() => match record {
                Some(record) => println!("{}", serde_json::to_string(&record)?),
                None => break,
            },
        }
    }

    let _ = shutdown_tx.send(());
    monitor.await.context("monitor task panicked")?
}

fn check_config(config: Option<PathBuf>) -> Result<()> {
    let loaded = LineConfig::load_with_source(&config_candidates(config))?;
    let config = loaded.config;
    println!("Configuration: {}", loaded.source.display());
    println!(
        "Bus: tick {:?}, connect timeout {:?}, poll timeout {:?}",
        config.bus.tick_interval, config.bus.connect_timeout, config.bus.poll_timeout
    );
    for (name, station) in &config.stations {
        println!(
            "Station {name} ({}): outputs -> {} [{}], inputs <- {} [{}], sequences [{}]",
            station.controller_device,
            station.output_address(),
            station.outputs.len(),
            station.input_address(),
            station.inputs.len(),
            station
                .sequences
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    for reaction in &config.reactions {
        println!(
            "Reaction: {} = {} -> {}/{}",
            reaction.input, reaction.on_status, reaction.station, reaction.sequence
        );
    }
    for trigger in &config.triggers {
        println!(
            "Trigger: {}/{} -> {}",
            trigger.station, trigger.output, trigger.sequence
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable; waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn inject_arguments_parse() {
        let cli = Cli::parse_from([
            "linebusd",
            "inject",
            "--to",
            "127.0.0.1:41001",
            "--name",
            "rotaryTableTrigger",
            "--cd",
            "RotaryTableModel",
            "--status",
            "true",
        ]);
        match cli.command {
            Some(Commands::Inject { to, status, value, .. }) => {
                assert_eq!(to, SocketAddress::loopback(41001));
                assert!(status);
                assert!(value.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn replay_requires_station() {
        assert!(Cli::try_parse_from(["linebusd", "run", "--replay", "steps.ndjson"]).is_err());
        let cli = Cli::try_parse_from([
            "linebusd", "run", "--replay", "steps.ndjson", "--station", "capper",
        ])
        .expect("parse");
        assert!(matches!(cli.command, Some(Commands::Run { station: Some(_), .. })));
    }

    #[test]
    fn candidates_prefer_explicit_path() {
        let candidates = config_candidates(Some(PathBuf::from("custom.toml")));
        assert_eq!(candidates[0], PathBuf::from("custom.toml"));
        assert_eq!(candidates.len(), 3);
    }
}
