//! ---
//! lb_section: "01-core-functionality"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Shared configuration and tracing bootstrap for the console."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use linebus_signal::{
    InputSettings, InputSignal, OutputSettings, OutputSignal, Sequence, SequenceStep,
    SignalUpdate, SocketAddress,
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_tick_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(10)
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_write_timeout() -> Duration {
    Duration::from_millis(250)
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_read_chunk_bytes() -> usize {
    1024
}

fn default_max_record_bytes() -> usize {
    64 * 1024
}

fn default_host() -> String {
    linebus_signal::model::DEFAULT_HOST.to_owned()
}

fn default_on_status() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 9899))
}

/// Complete description of a bottling line as seen from the console.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub stations: IndexMap<String, StationConfig>,
    #[serde(default)]
    pub reactions: Vec<ReactionConfig>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// A [`LineConfig`] together with the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedLineConfig {
    pub config: LineConfig,
    pub source: PathBuf,
}

impl LineConfig {
    pub const ENV_CONFIG_PATH: &'static str = "LINEBUS_CONFIG";

    /// Load configuration from disk, respecting the `LINEBUS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedLineConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedLineConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedLineConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Read, parse and validate one file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<LineConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Retrieve a station by its configuration key.
    pub fn station(&self, name: &str) -> Option<&StationConfig> {
        self.stations.get(name)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.bus.validate()?;
        if self.stations.is_empty() {
            return Err(anyhow!("configuration must contain at least one station"));
        }
        for (name, station) in &self.stations {
            station.validate(name)?;
        }
        for reaction in &self.reactions {
            let station = self.station(&reaction.station).ok_or_else(|| {
                anyhow!(
                    "reaction on '{}' targets unknown station '{}'",
                    reaction.input,
                    reaction.station
                )
            })?;
            if !station.sequences.contains_key(&reaction.sequence) {
                return Err(anyhow!(
                    "reaction on '{}' targets unknown sequence '{}' of station '{}'",
                    reaction.input,
                    reaction.sequence,
                    reaction.station
                ));
            }
            let known = self.stations.values().any(|s| {
                s.inputs.iter().any(|input| {
                    input.name == reaction.input
                        && reaction
                            .cd
                            .as_deref()
                            .map_or(true, |cd| input.controller_device(s) == cd)
                })
            });
            if !known {
                return Err(anyhow!(
                    "reaction listens for '{}' which no station declares as an input",
                    reaction.input
                ));
            }
        }
        for trigger in &self.triggers {
            let station = self.station(&trigger.station).ok_or_else(|| {
                anyhow!(
                    "trigger '{}' targets unknown station '{}'",
                    trigger.output,
                    trigger.station
                )
            })?;
            if !station.has_output(&trigger.output) {
                return Err(anyhow!(
                    "trigger output '{}' is not declared by station '{}'",
                    trigger.output,
                    trigger.station
                ));
            }
            if !station.sequences.contains_key(&trigger.sequence) {
                return Err(anyhow!(
                    "trigger '{}' targets unknown sequence '{}' of station '{}'",
                    trigger.output,
                    trigger.sequence,
                    trigger.station
                ));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for LineConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: LineConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Timings and bounds shared by both signal managers.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_tick_interval", rename = "tick_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
    #[serde(default = "default_connect_timeout", rename = "connect_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_settle_delay", rename = "settle_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub settle_delay: Duration,
    #[serde(default = "default_write_timeout", rename = "write_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub write_timeout: Duration,
    #[serde(default = "default_poll_timeout", rename = "poll_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_timeout: Duration,
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            connect_timeout: default_connect_timeout(),
            settle_delay: default_settle_delay(),
            write_timeout: default_write_timeout(),
            poll_timeout: default_poll_timeout(),
            read_chunk_bytes: default_read_chunk_bytes(),
            max_record_bytes: default_max_record_bytes(),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(anyhow!("bus tick_interval_ms must be greater than zero"));
        }
        if self.connect_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(anyhow!("bus connect and write timeouts must be greater than zero"));
        }
        if self.read_chunk_bytes == 0 {
            return Err(anyhow!("bus read_chunk_bytes must be greater than zero"));
        }
        if self.max_record_bytes < self.read_chunk_bytes {
            return Err(anyhow!(
                "bus max_record_bytes ({}) must be at least read_chunk_bytes ({})",
                self.max_record_bytes,
                self.read_chunk_bytes
            ));
        }
        Ok(())
    }

    pub fn output_settings(&self) -> OutputSettings {
        OutputSettings {
            tick_interval: self.tick_interval,
            connect_timeout: self.connect_timeout,
            settle_delay: self.settle_delay,
            write_timeout: self.write_timeout,
        }
    }

    pub fn input_settings(&self) -> InputSettings {
        InputSettings {
            poll_timeout: self.poll_timeout,
            read_chunk_bytes: self.read_chunk_bytes,
            max_record_bytes: self.max_record_bytes,
        }
    }
}

/// One station controller: where its outputs go and where its inputs arrive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default)]
    pub description: Option<String>,
    pub controller_device: String,
    /// Host of the station's receiving socket.
    #[serde(default = "default_host")]
    pub host: String,
    /// Local interface the console listens on for this station's inputs.
    #[serde(default = "default_host")]
    pub listen_host: String,
    pub output_port: u16,
    pub input_port: u16,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    #[serde(default)]
    pub sequences: IndexMap<String, Vec<SequenceStep>>,
}

impl StationConfig {
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.controller_device.trim().is_empty() {
            return Err(anyhow!("station '{}' must set controller_device", name));
        }
        if self.output_port == 0 || self.input_port == 0 {
            return Err(anyhow!("station '{}' ports must be non-zero", name));
        }
        if self.output_port == self.input_port && self.host == self.listen_host {
            return Err(anyhow!(
                "station '{}' uses port {} for both directions",
                name,
                self.output_port
            ));
        }
        let mut outputs = HashSet::new();
        for output in &self.outputs {
            if !outputs.insert(output.name.as_str()) {
                return Err(anyhow!(
                    "station '{}' declares output '{}' twice",
                    name,
                    output.name
                ));
            }
        }
        for (sequence, steps) in &self.sequences {
            if let Some(step) = steps.iter().find(|step| !outputs.contains(step.signal.as_str())) {
                return Err(anyhow!(
                    "sequence '{}' of station '{}' drives unknown output '{}'",
                    sequence,
                    name,
                    step.signal
                ));
            }
        }
        Ok(())
    }

    pub fn output_address(&self) -> SocketAddress {
        SocketAddress::new(self.host.clone(), self.output_port)
    }

    pub fn input_address(&self) -> SocketAddress {
        SocketAddress::new(self.listen_host.clone(), self.input_port)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|output| output.name == name)
    }

    /// Named sequence as a runnable [`Sequence`].
    pub fn sequence(&self, name: &str) -> Option<Sequence> {
        self.sequences.get(name).map(|steps| Sequence {
            name: name.to_owned(),
            steps: steps.clone(),
        })
    }

    /// Output signals described by this station, in declaration order.
    pub fn output_signals(&self) -> Vec<OutputSignal> {
        let address = self.output_address();
        self.outputs
            .iter()
            .map(|output| output.to_signal(self, address.clone()))
            .collect()
    }

    /// Input signals described by this station, in declaration order.
    pub fn input_signals(&self) -> Vec<InputSignal> {
        let address = self.input_address();
        self.inputs
            .iter()
            .map(|input| {
                InputSignal::new(
                    input.name.clone(),
                    input.controller_device(self),
                    address.clone(),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    /// Controller device override; defaults to the station's.
    #[serde(default)]
    pub cd: Option<String>,
    #[serde(default)]
    pub initial_status: bool,
    #[serde(default)]
    pub send_once: bool,
    #[serde(default)]
    pub local_only: bool,
}

impl OutputConfig {
    fn to_signal(&self, station: &StationConfig, address: SocketAddress) -> OutputSignal {
        let cd = self
            .cd
            .clone()
            .unwrap_or_else(|| station.controller_device.clone());
        let mut signal =
            OutputSignal::new(self.name.clone(), cd, address).with_initial_status(self.initial_status);
        if self.send_once {
            signal = signal.send_once();
        }
        if self.local_only {
            signal = signal.local_only();
        }
        signal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    pub name: String,
    /// Controller device of the producer; defaults to the station's.
    #[serde(default)]
    pub cd: Option<String>,
}

impl InputConfig {
    pub fn controller_device<'a>(&'a self, station: &'a StationConfig) -> &'a str {
        self.cd.as_deref().unwrap_or(&station.controller_device)
    }
}

/// Run a station sequence when a matching inbound update arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionConfig {
    pub input: String,
    #[serde(default)]
    pub cd: Option<String>,
    #[serde(default = "default_on_status")]
    pub on_status: bool,
    pub station: String,
    pub sequence: String,
}

impl ReactionConfig {
    pub fn matches(&self, update: &SignalUpdate) -> bool {
        update.identity.name == self.input
            && update.status == self.on_status
            && self
                .cd
                .as_deref()
                .map_or(true, |cd| update.identity.controller_device == cd)
    }
}

/// Run a station sequence when one of its outputs is raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub station: String,
    pub output: String,
    pub sequence: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: LogFormat::default(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linebus_signal::SignalIdentity;

    const ROTARY: &str = r#"
[bus]
tick_interval_ms = 100

[stations.rotary]
controller_device = "RotaryTableControllerCD"
output_port = 40001
input_port = 41001
outputs = [
    { name = "tableAlignedWithSensor", initial_status = true },
    { name = "move2NextPos", send_once = true, local_only = true },
]
inputs = [
    { name = "rotaryTableTrigger", cd = "RotaryTableModel" },
    { name = "rotaryIdle", cd = "Coordinator" },
]

[stations.rotary.sequences]
align = [
    { signal = "tableAlignedWithSensor", status = false, delay_ms = 1000 },
    { signal = "tableAlignedWithSensor", status = true },
]

[[reactions]]
input = "rotaryTableTrigger"
station = "rotary"
sequence = "align"

[[triggers]]
station = "rotary"
output = "move2NextPos"
sequence = "align"
"#;

    #[test]
    fn parses_station_with_sequences() {
        let config: LineConfig = ROTARY.parse().expect("valid config");
        assert_eq!(config.bus.tick_interval, Duration::from_millis(100));
        assert_eq!(config.bus.settle_delay, Duration::from_millis(500));

        let rotary = config.station("rotary").expect("station");
        assert_eq!(rotary.output_address(), SocketAddress::loopback(40001));
        assert_eq!(rotary.input_address(), SocketAddress::loopback(41001));

        let outputs = rotary.output_signals();
        assert!(outputs[0].status());
        assert!(outputs[1].is_send_once() && outputs[1].is_local_only());

        let inputs = rotary.input_signals();
        assert_eq!(
            inputs[0].identity(),
            &SignalIdentity::new("rotaryTableTrigger", "RotaryTableModel")
        );

        let align = rotary.sequence("align").expect("sequence");
        assert_eq!(align.steps.len(), 2);
        assert_eq!(align.steps[1].delay_ms, 0);
    }

    #[test]
    fn reaction_matches_status_and_device() {
        let config: LineConfig = ROTARY.parse().expect("valid config");
        let reaction = &config.reactions[0];
        let update = SignalUpdate {
            identity: SignalIdentity::new("rotaryTableTrigger", "RotaryTableModel"),
            status: true,
            value: None,
        };
        assert!(reaction.matches(&update));
        assert!(!reaction.matches(&SignalUpdate {
            status: false,
            ..update.clone()
        }));

        let narrowed = ReactionConfig {
            cd: Some("Coordinator".into()),
            ..reaction.clone()
        };
        assert!(!narrowed.matches(&update));
    }

    #[test]
    fn rejects_empty_configuration() {
        let err = "".parse::<LineConfig>().unwrap_err();
        assert!(err.to_string().contains("at least one station"));
    }

    #[test]
    fn rejects_sequence_on_unknown_output() {
        let broken = ROTARY.replace(
            "{ signal = \"tableAlignedWithSensor\", status = true }",
            "{ signal = \"tableMissing\", status = true }",
        );
        let err = broken.parse::<LineConfig>().unwrap_err();
        assert!(err.to_string().contains("tableMissing"));
    }

    #[test]
    fn rejects_reaction_on_undeclared_input() {
        let broken = ROTARY.replace(
            "input = \"rotaryTableTrigger\"",
            "input = \"capperIdle\"",
        );
        let err = broken.parse::<LineConfig>().unwrap_err();
        assert!(err.to_string().contains("capperIdle"));
    }

    #[test]
    fn rejects_shared_port() {
        let broken = ROTARY.replace("input_port = 41001", "input_port = 40001");
        assert!(broken.parse::<LineConfig>().is_err());
    }

    #[test]
    fn settings_follow_bus_section() {
        let config: LineConfig = ROTARY.parse().expect("valid config");
        let output = config.bus.output_settings();
        assert_eq!(output.tick_interval, Duration::from_millis(100));
        assert_eq!(output.connect_timeout, Duration::from_millis(10));
        let input = config.bus.input_settings();
        assert_eq!(input.poll_timeout, Duration::from_secs(1));
        assert_eq!(input.max_record_bytes, 64 * 1024);
    }

    #[test]
    fn example_configuration_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/line.example.toml");
        let config = LineConfig::from_path(&path).expect("example config loads");
        assert!(config.station("conveyor").is_some());
        assert_eq!(
            config.station("pos").map(|s| s.output_port),
            Some(50000)
        );
    }

    #[test]
    fn load_with_source_reports_candidate() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("line.toml");
        fs::write(&path, ROTARY).expect("write config");
        let missing = dir.path().join("missing.toml");
        // Only meaningful when the override is not set in the test environment.
        if std::env::var(LineConfig::ENV_CONFIG_PATH).is_err() {
            let loaded = LineConfig::load_with_source(&[missing, path.clone()]).expect("load");
            assert_eq!(loaded.source, path);
        }
    }
}
