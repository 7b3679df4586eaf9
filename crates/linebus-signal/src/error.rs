//! ---
//! lb_section: "02-signal-bus"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Station signal bus: model, wire codec, and socket managers."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
use std::time::Duration;

use crate::model::SocketAddress;

/// Shared result type for signal bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Failures raised inside the signal bus.
///
/// None of these are fatal to the process. The managers log them and either
/// retry on the next tick or drop the offending record.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Outbound connect was refused or failed outright.
    #[error("connect to {address} failed: {source}")]
    ConnectFailed {
        /// Remote address that was dialled.
        address: SocketAddress,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// Outbound connect did not complete within the configured timeout.
    #[error("connect to {address} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Remote address that was dialled.
        address: SocketAddress,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// Write on an established connection failed.
    #[error("send to {address} failed: {source}")]
    SendFailed {
        /// Remote address of the broken connection.
        address: SocketAddress,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// Write on an established connection stalled past the write timeout.
    #[error("send to {address} stalled for more than {timeout:?}")]
    SendTimeout {
        /// Remote address of the stalled connection.
        address: SocketAddress,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// Listener could not be created for a local address.
    #[error("bind on {address} failed: {source}")]
    BindFailed {
        /// Local address that was requested.
        address: SocketAddress,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// A record fragment was not a valid wire message.
    #[error("malformed record: {0}")]
    ParseFailed(String),
    /// Pending bytes exceeded the record bound without a delimiter.
    #[error("record exceeded {limit} bytes without a delimiter")]
    RecordTooLong {
        /// Configured record bound.
        limit: usize,
    },
    /// Address text could not be parsed as `host:port`.
    #[error("invalid socket address '{0}'")]
    InvalidAddress(String),
    /// A sequence step names an output the station does not own.
    #[error("unknown output signal '{0}'")]
    UnknownSignal(String),
    /// A manager task panicked or was aborted.
    #[error("signal worker terminated abnormally: {0}")]
    Worker(String),
    /// Wrapper for IO errors outside connection handling.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_address() {
        let address = SocketAddress::loopback(40000);
        let timeout = BusError::ConnectTimeout {
            address: address.clone(),
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.to_string().contains("127.0.0.1:40000"));

        let bind = BusError::BindFailed {
            address,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(bind.to_string().contains("127.0.0.1:40000"));
    }
}
