//! ---
//! lb_section: "02-signal-bus"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Station signal bus: model, wire codec, and socket managers."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
//! Scripted station behaviour.
//!
//! Sequences drive a station's outputs through timed steps so the console can
//! exercise a line without the physical controllers attached.
use std::path::Path;
use std::time::Duration;

use indexmap::IndexMap;
use linebus_logging::{bus_debug, bus_info, LogContext};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{OutputSignal, SignalLevel};
use crate::{BusError, Result};

/// One timed change of an output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceStep {
    /// Output name within the station.
    pub signal: String,
    /// Status applied by the step.
    pub status: bool,
    /// Optional payload applied together with the status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Pause after the step before the next one runs.
    #[serde(default)]
    pub delay_ms: u64,
}

impl SequenceStep {
    /// Step setting `signal` to `status`, then pausing `delay_ms`.
    pub fn new(signal: impl Into<String>, status: bool, delay_ms: u64) -> Self {
        Self {
            signal: signal.into(),
            status,
            value: None,
            delay_ms,
        }
    }
}

/// Named list of steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    /// Sequence name, unique per station.
    pub name: String,
    /// Steps in execution order.
    #[serde(default)]
    pub steps: Vec<SequenceStep>,
}

/// Name-indexed view over one station's outputs.
///
/// Signals are shared handles, so changes made through the bank are what the
/// output manager broadcasts on its next tick.
#[derive(Debug, Clone, Default)]
pub struct OutputBank {
    station: String,
    outputs: IndexMap<String, OutputSignal>,
}

impl OutputBank {
    /// Bank for `station` built from its outputs. Later duplicates are ignored.
    pub fn new(station: impl Into<String>, outputs: impl IntoIterator<Item = OutputSignal>) -> Self {
        let mut bank = IndexMap::new();
        for signal in outputs {
            bank.entry(signal.name().to_string()).or_insert(signal);
        }
        Self {
            station: station.into(),
            outputs: bank,
        }
    }

    /// Station the bank belongs to.
    pub fn station(&self) -> &str {
        &self.station
    }

    /// Output by name.
    pub fn get(&self, name: &str) -> Option<&OutputSignal> {
        self.outputs.get(name)
    }

    /// Output by name, or [`BusError::UnknownSignal`].
    pub fn require(&self, name: &str) -> Result<&OutputSignal> {
        self.get(name)
            .ok_or_else(|| BusError::UnknownSignal(format!("{}/{}", self.station, name)))
    }

    /// Outputs in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &OutputSignal> {
        self.outputs.values()
    }

    /// Number of outputs.
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Whether the bank holds no outputs.
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    fn apply(&self, signal: &OutputSignal, status: bool, value: Option<String>) {
        match value {
            Some(value) => signal.set_level(SignalLevel {
                status,
                value: Some(value),
            }),
            None => signal.set_status(status),
        }
    }
}

/// Run `sequence` against `bank`, returning how many steps were applied.
///
/// Every step is checked before the first one runs, so a sequence naming an
/// unknown output changes nothing. A shutdown during a pause ends the run
/// early with the steps applied so far.
pub async fn run_sequence(
    bank: &OutputBank,
    sequence: &Sequence,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<usize> {
    let signals = sequence
        .steps
        .iter()
        .map(|step| bank.require(&step.signal))
        .collect::<Result<Vec<_>>>()?;

    let ctx = LogContext::new().with_station(bank.station());
    bus_info!(context = ctx, "running sequence '{}'", sequence.name);

    let mut applied = 0usize;
    for (step, signal) in sequence.steps.iter().zip(signals) {
        bank.apply(signal, step.status, step.value.clone());
        applied += 1;
        if step.delay_ms == 0 {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(step.delay_ms)) => {}
            _ = shutdown.recv() => {
                bus_debug!(
                    context = ctx,
                    "sequence '{}' interrupted after {} steps",
                    sequence.name,
                    applied
                );
                return Ok(applied);
            }
        }
    }
    Ok(applied)
}

#[derive(Debug, Deserialize)]
struct ReplayRecord {
    #[serde(default)]
    delay_ms: Option<u64>,
    name: String,
    status: bool,
    #[serde(default)]
    value: Option<String>,
}

/// Replay output changes from a newline-delimited JSON file.
///
/// Each line holds `{"name": ..., "status": ...}` with optional `value` and
/// `delay_ms` fields; the delay is waited before the change is applied.
pub async fn replay_from_file<P: AsRef<Path>>(bank: &OutputBank, path: P) -> Result<usize> {
    let contents = tokio::fs::read_to_string(path).await?;
    let mut count = 0usize;

    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let record: ReplayRecord = serde_json::from_str(line)?;
        let signal = bank.require(&record.name)?;
        if let Some(delay) = record.delay_ms {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        bank.apply(signal, record.status, record.value);
        count += 1;
    }

    Ok(count)
}
