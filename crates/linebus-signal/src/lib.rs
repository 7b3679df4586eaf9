//! ---
//! lb_section: "02-signal-bus"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Station signal bus: model, wire codec, and socket managers."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
//! Signal bus shared by the line console and the station controllers.
//!
//! Two independent workers make up the bus. The [`OutputSignalManager`] keeps
//! one client connection per remote address and re-broadcasts every output it
//! knows about on a fixed tick. The [`InputSignalManager`] owns one listening
//! socket per local address, multiplexes every accepted producer connection,
//! and hands parsed updates back to the owner through a channel.
#![warn(missing_docs)]

pub mod codec;
pub mod error;
pub mod input;
pub mod metrics;
pub mod model;
pub mod output;
pub mod registry;
pub mod script;
mod tick;

pub use codec::{encode_record, Decoded, RecordDecoder, WireMessage, RECORD_DELIMITER};
pub use error::{BusError, Result};
pub use input::{
    InputManagerHandle, InputSettings, InputSignalManager, InputStats, UpdateReceiver,
};
pub use metrics::SignalBusMetrics;
pub use model::{
    InputSignal, OutputSignal, SignalIdentity, SignalLevel, SignalState, SignalUpdate,
    SocketAddress,
};
pub use output::{OutputManagerHandle, OutputSettings, OutputSignalManager, OutputStats};
pub use registry::{Registrar, SignalRegistry};
pub use script::{replay_from_file, run_sequence, OutputBank, Sequence, SequenceStep};
