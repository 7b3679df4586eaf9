//! ---
//! lb_section: "01-core-functionality"
//! lb_subsection: "binary"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Station wiring, reaction dispatch and trigger watchers."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
//! Station wiring for a running line.
//!
//! Every configured station contributes its outputs to one output manager
//! and its inputs to one input manager. Inbound updates flow through a
//! dispatcher that logs level changes and starts reaction sequences; raised
//! trigger outputs start their sequences from a watcher task.
use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use linebus_common::{LineConfig, ReactionConfig};
use linebus_logging::{bus_debug, bus_error, bus_info, bus_warn, LogContext};
use linebus_metrics::{LineMetrics, SharedRegistry};
use linebus_signal::{
    replay_from_file, run_sequence, InputManagerHandle, InputSignalManager, OutputBank,
    OutputManagerHandle, OutputSignal, OutputSignalManager, Sequence, SignalBusMetrics,
    SignalIdentity, SignalLevel, SignalUpdate, UpdateReceiver,
};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, trace, warn};

/// Running line: both signal managers plus the reaction machinery.
pub struct LineHandle {
    banks: IndexMap<String, OutputBank>,
    outputs: OutputManagerHandle,
    inputs: InputManagerHandle,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

/// Build every station from `config`, register its signals and start the bus.
pub fn start_line(config: &LineConfig, registry: Option<&SharedRegistry>) -> Result<LineHandle> {
    let (bus_metrics, line_metrics) = match registry {
        Some(registry) => (
            Some(SignalBusMetrics::register(registry).context("registering signal bus metrics")?),
            Some(LineMetrics::new(registry.clone())?),
        ),
        None => (None, None),
    };

    let mut output_manager = OutputSignalManager::new(config.bus.output_settings());
    let (mut input_manager, updates) = InputSignalManager::new(config.bus.input_settings());
    if let Some(metrics) = &bus_metrics {
        output_manager = output_manager.with_metrics(metrics.clone());
        input_manager = input_manager.with_metrics(metrics.clone());
    }

    let mut banks = IndexMap::new();
    let mut stations = HashMap::new();
    for (name, station) in &config.stations {
        let outputs = station.output_signals();
        let inputs = station.input_signals();
        for signal in &outputs {
            output_manager.register(signal.clone());
        }
        for signal in inputs.iter() {
            stations.insert(signal.identity().clone(), name.clone());
            input_manager.register(signal.clone());
        }
        if let Some(metrics) = &line_metrics {
            metrics.set_station_signals(name, outputs.len(), inputs.len());
        }
        info!(
            station = %name,
            controller_device = %station.controller_device,
            outputs = outputs.len(),
            inputs = inputs.len(),
            "station wired"
        );
        banks.insert(name.clone(), OutputBank::new(name.clone(), outputs));
    }
    if let Some(metrics) = &line_metrics {
        metrics.set_station_count(banks.len());
    }

    let reactions = config
        .reactions
        .iter()
        .map(|rule| resolve_reaction(config, &banks, rule))
        .collect::<Result<Vec<_>>>()?;

    let mut watchers = Vec::new();
    for trigger in &config.triggers {
        let (bank, sequence) = resolve(config, &banks, &trigger.station, &trigger.sequence)?;
        let output = bank
            .get(&trigger.output)
            .cloned()
            .ok_or_else(|| anyhow!("trigger output '{}' not wired", trigger.output))?;
        watchers.push((bank, output, sequence));
    }

    let (shutdown, _) = broadcast::channel(4);
    let outputs = output_manager.start();
    let inputs = input_manager.start();

    // Receivers are created before spawning so no raise or stop is missed
    // while a task waits for its first poll.
    let dispatcher = Dispatcher::new(reactions, stations);
    let mut tasks = vec![tokio::spawn(dispatch(
        dispatcher,
        updates,
        shutdown.clone(),
        shutdown.subscribe(),
        line_metrics.clone(),
    ))];
    for (bank, output, sequence) in watchers {
        let levels = output.subscribe();
        tasks.push(tokio::spawn(watch_trigger(
            TriggerWatch {
                bank,
                output,
                levels,
                sequence,
            },
            shutdown.clone(),
            shutdown.subscribe(),
            line_metrics.clone(),
        )));
    }

    Ok(LineHandle {
        banks,
        outputs,
        inputs,
        shutdown,
        tasks,
    })
}

impl LineHandle {
    /// Outputs of one station.
    pub fn bank(&self, station: &str) -> Option<&OutputBank> {
        self.banks.get(station)
    }

    pub fn outputs(&self) -> &OutputManagerHandle {
        &self.outputs
    }

    pub fn inputs(&self) -> &InputManagerHandle {
        &self.inputs
    }

    /// Replay recorded output changes for `station` in the background.
    pub fn replay(&mut self, station: &str, path: PathBuf) -> Result<()> {
        let bank = self
            .bank(station)
            .cloned()
            .ok_or_else(|| anyhow!("replay targets unknown station '{}'", station))?;
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(async move {
            let ctx = LogContext::new().with_station(bank.station());
            tokio::select! {
                _ = shutdown.recv() => {}
                result = replay_from_file(&bank, &path) => match result {
                    Ok(count) => bus_info!(
                        context = ctx,
                        "replayed {} records from {}",
                        count,
                        path.display()
                    ),
                    Err(err) => bus_warn!(
                        context = ctx,
                        "replay of {} failed: {}",
                        path.display(),
                        err
                    ),
                },
            }
        }));
        Ok(())
    }

    /// Stop reactions and triggers, then both managers.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "line task ended abnormally");
            }
        }
        self.outputs.shutdown().await?;
        self.inputs.shutdown().await?;
        Ok(())
    }
}

struct Reaction {
    rule: ReactionConfig,
    bank: OutputBank,
    sequence: Sequence,
}

fn resolve(
    config: &LineConfig,
    banks: &IndexMap<String, OutputBank>,
    station: &str,
    sequence: &str,
) -> Result<(OutputBank, Sequence)> {
    let bank = banks
        .get(station)
        .cloned()
        .ok_or_else(|| anyhow!("unknown station '{}'", station))?;
    let sequence = config
        .station(station)
        .and_then(|s| s.sequence(sequence))
        .ok_or_else(|| anyhow!("station '{}' has no sequence '{}'", station, sequence))?;
    Ok((bank, sequence))
}

fn resolve_reaction(
    config: &LineConfig,
    banks: &IndexMap<String, OutputBank>,
    rule: &ReactionConfig,
) -> Result<Reaction> {
    let (bank, sequence) = resolve(config, banks, &rule.station, &rule.sequence)?;
    Ok(Reaction {
        rule: rule.clone(),
        bank,
        sequence,
    })
}

/// Tracks the last level seen per input so reactions fire on edges only.
struct Dispatcher {
    reactions: Vec<Reaction>,
    stations: HashMap<SignalIdentity, String>,
    last_seen: HashMap<SignalIdentity, SignalLevel>,
}

impl Dispatcher {
    fn new(reactions: Vec<Reaction>, stations: HashMap<SignalIdentity, String>) -> Self {
        Self {
            reactions,
            stations,
            last_seen: HashMap::new(),
        }
    }

    /// Record `update`; returns whether its status differs from the last one seen.
    fn observe(&mut self, update: &SignalUpdate) -> bool {
        let level = update.level();
        let previous = self.last_seen.insert(update.identity.clone(), level.clone());
        let station = self
            .stations
            .get(&update.identity)
            .map(String::as_str)
            .unwrap_or("unregistered");
        let signal = update.identity.to_string();
        let ctx = LogContext::new().with_station(station).with_signal(&signal);
        match &previous {
            Some(previous) if *previous == level => {
                trace!(station, signal = %signal, "input unchanged");
            }
            _ => bus_info!(context = ctx, "input level now {}", update.status),
        }
        previous.map_or(true, |previous| previous.status != level.status)
    }

    fn matching<'a>(&'a self, update: &'a SignalUpdate) -> impl Iterator<Item = &'a Reaction> {
        self.reactions
            .iter()
            .filter(move |reaction| reaction.rule.matches(update))
    }
}

async fn dispatch(
    mut dispatcher: Dispatcher,
    mut updates: UpdateReceiver,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown: broadcast::Receiver<()>,
    metrics: Option<LineMetrics>,
) {
    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            update = updates.recv() => {
                let Some(update) = update else { break };
                if !dispatcher.observe(&update) {
                    continue;
                }
                for reaction in dispatcher.matching(&update) {
                    running.spawn(run_logged(
                        reaction.bank.clone(),
                        reaction.sequence.clone(),
                        shutdown_tx.subscribe(),
                        metrics.clone(),
                        "reaction",
                    ));
                }
            }
            Some(_) = running.join_next(), if !running.is_empty() => {}
        }
    }
    running.shutdown().await;
}

/// Trigger output with the sequence it starts.
struct TriggerWatch {
    bank: OutputBank,
    output: OutputSignal,
    levels: watch::Receiver<SignalLevel>,
    sequence: Sequence,
}

async fn watch_trigger(
    trigger: TriggerWatch,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown: broadcast::Receiver<()>,
    metrics: Option<LineMetrics>,
) {
    let TriggerWatch {
        bank,
        output,
        mut levels,
        sequence,
    } = trigger;
    // An output already high (raised early or configured high) counts as a raise.
    let mut raised = levels.borrow_and_update().status;
    loop {
        while !raised {
            tokio::select! {
                _ = shutdown.recv() => return,
                changed = levels.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    raised = levels.borrow_and_update().status;
                }
            }
        }
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = run_logged(
                bank.clone(),
                sequence.clone(),
                shutdown_tx.subscribe(),
                metrics.clone(),
                "trigger",
            ) => {}
        }
        if output.is_send_once() {
            output.set_status(false);
        }
        levels.borrow_and_update();
        raised = false;
    }
}

async fn run_logged(
    bank: OutputBank,
    sequence: Sequence,
    shutdown: broadcast::Receiver<()>,
    metrics: Option<LineMetrics>,
    cause: &'static str,
) {
    if let Some(metrics) = &metrics {
        metrics.record_sequence(bank.station(), &sequence.name, cause);
    }
    let ctx = LogContext::new().with_station(bank.station());
    match run_sequence(&bank, &sequence, shutdown).await {
        Ok(applied) => bus_debug!(
            context = ctx,
            "sequence '{}' ({}) applied {} of {} steps",
            sequence.name,
            cause,
            applied,
            sequence.steps.len()
        ),
        Err(err) => {
            if let Some(metrics) = &metrics {
                metrics.record_sequence_failure(bank.station(), &sequence.name);
            }
            bus_error!(context = ctx, "sequence '{}' failed: {}", sequence.name, err);
        }
    }
}
