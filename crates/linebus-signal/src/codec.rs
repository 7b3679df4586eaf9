//! ---
//! lb_section: "02-signal-bus"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Station signal bus: model, wire codec, and socket managers."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
//! Wire format: one compact JSON object per record, records separated by CRLF.
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{BusError, Result};

/// Delimiter placed after every record.
pub const RECORD_DELIMITER: &[u8] = b"\r\n";

/// Default bound on a single pending record.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 64 * 1024;

/// Serialized form of a signal exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Signal name.
    pub name: String,
    /// Controller-device tag.
    pub cd: String,
    /// Boolean status.
    pub status: bool,
    /// Optional payload, omitted from the JSON when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl WireMessage {
    /// Message without payload.
    pub fn new(name: impl Into<String>, cd: impl Into<String>, status: bool) -> Self {
        Self {
            name: name.into(),
            cd: cd.into(),
            status,
            value: None,
        }
    }

    /// Attach a payload.
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Encode one record including its trailing delimiter.
pub fn encode_record(message: &WireMessage) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.extend_from_slice(RECORD_DELIMITER);
    Ok(bytes)
}

/// Outcome of decoding one delimited fragment.
#[derive(Debug)]
pub enum Decoded {
    /// Fragment parsed into a wire message.
    Message(WireMessage),
    /// Fragment dropped; the connection stays open.
    Discarded(BusError),
}

/// Per-connection scanner that splits a byte stream into records.
///
/// Bytes after the last delimiter are kept and completed by later reads, so
/// a record split across two socket reads is still delivered intact.
#[derive(Debug)]
pub struct RecordDecoder {
    buffer: BytesMut,
    max_record_bytes: usize,
}

impl RecordDecoder {
    /// Decoder bounding pending records to `max_record_bytes`.
    pub fn new(max_record_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_record_bytes,
        }
    }

    /// Number of bytes waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Feed a chunk read from the socket and return every completed fragment.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        self.buffer.extend_from_slice(chunk);
        let mut decoded = Vec::new();

        while let Some(position) = find_delimiter(&self.buffer) {
            let fragment = self.buffer.split_to(position);
            self.buffer.advance(RECORD_DELIMITER.len());
            if let Some(outcome) = decode_fragment(&fragment) {
                decoded.push(outcome);
            }
        }

        if self.buffer.len() > self.max_record_bytes {
            self.buffer.clear();
            decoded.push(Decoded::Discarded(BusError::RecordTooLong {
                limit: self.max_record_bytes,
            }));
        }

        decoded
    }

    /// Flush the trailing fragment once the peer has closed.
    pub fn finish(&mut self) -> Option<Decoded> {
        let rest = self.buffer.split();
        decode_fragment(&rest)
    }
}

impl Default for RecordDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORD_BYTES)
    }
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(RECORD_DELIMITER.len())
        .position(|window| window == RECORD_DELIMITER)
}

fn decode_fragment(fragment: &[u8]) -> Option<Decoded> {
    let text = match std::str::from_utf8(fragment) {
        Ok(text) => text.trim(),
        Err(err) => {
            return Some(Decoded::Discarded(BusError::ParseFailed(format!(
                "invalid utf-8: {err}"
            ))))
        }
    };
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<WireMessage>(text) {
        Ok(message) => Some(Decoded::Message(message)),
        Err(err) => Some(Decoded::Discarded(BusError::ParseFailed(err.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(decoded: Vec<Decoded>) -> Vec<WireMessage> {
        decoded
            .into_iter()
            .filter_map(|d| match d {
                Decoded::Message(m) => Some(m),
                Decoded::Discarded(_) => None,
            })
            .collect()
    }

    #[test]
    fn encoded_record_omits_absent_value() {
        let bytes = encode_record(&WireMessage::new("x", "y", true)).expect("encode");
        let text = String::from_utf8(bytes).expect("utf-8");
        assert_eq!(text, "{\"name\":\"x\",\"cd\":\"y\",\"status\":true}\r\n");
    }

    #[test]
    fn value_is_carried_when_present() {
        let message = WireMessage::new("POS", "POS", true).with_value("{\"orderId\":3}");
        let mut decoder = RecordDecoder::default();
        let out = messages(decoder.push(&encode_record(&message).expect("encode")));
        assert_eq!(out, vec![message]);
    }

    #[test]
    fn splits_multiple_records_in_one_chunk() {
        let mut decoder = RecordDecoder::default();
        let chunk = b"{\"name\":\"a\",\"cd\":\"c\",\"status\":true}\r\n{\"name\":\"b\",\"cd\":\"c\",\"status\":false}\r\n";
        let out = messages(decoder.push(chunk));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].name, "a");
        assert!(!out[1].status);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn record_straddling_reads_is_reassembled() {
        let mut decoder = RecordDecoder::default();
        assert!(decoder.push(b"{\"name\":\"bottleAtPos1\",\"cd\":\"Conv").is_empty());
        assert!(decoder.push(b"eyorCD\",\"status\":true}\r").is_empty());
        let out = messages(decoder.push(b"\n"));
        assert_eq!(out, vec![WireMessage::new("bottleAtPos1", "ConveyorCD", true)]);
    }

    #[test]
    fn malformed_fragment_is_discarded_and_next_record_survives() {
        let mut decoder = RecordDecoder::default();
        let decoded =
            decoder.push(b"{\"name\":\"trunc\r\n{\"name\":\"ok\",\"cd\":\"c\",\"status\":true}\r\n");
        assert_eq!(decoded.len(), 2);
        assert!(matches!(
            decoded[0],
            Decoded::Discarded(BusError::ParseFailed(_))
        ));
        assert!(matches!(&decoded[1], Decoded::Message(m) if m.name == "ok"));
    }

    #[test]
    fn blank_fragments_are_skipped() {
        let mut decoder = RecordDecoder::default();
        assert!(decoder.push(b"\r\n  \r\n").is_empty());
    }

    #[test]
    fn invalid_utf8_is_discarded() {
        let mut decoder = RecordDecoder::default();
        let decoded = decoder.push(&[0xff, 0xfe, b'\r', b'\n']);
        assert!(matches!(
            decoded.as_slice(),
            [Decoded::Discarded(BusError::ParseFailed(_))]
        ));
    }

    #[test]
    fn oversized_pending_bytes_are_dropped() {
        let mut decoder = RecordDecoder::new(16);
        let decoded = decoder.push(&[b'a'; 32]);
        assert!(matches!(
            decoded.as_slice(),
            [Decoded::Discarded(BusError::RecordTooLong { limit: 16 })]
        ));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn finish_flushes_unterminated_record() {
        let mut decoder = RecordDecoder::default();
        assert!(decoder
            .push(b"{\"name\":\"last\",\"cd\":\"c\",\"status\":true}")
            .is_empty());
        assert!(matches!(decoder.finish(), Some(Decoded::Message(m)) if m.name == "last"));
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn pretty_printed_json_inside_a_record_is_accepted() {
        let mut decoder = RecordDecoder::default();
        let out = messages(decoder.push(
            b"{\n    \"name\": \"x\",\n    \"cd\": \"y\",\n    \"status\": true\n}\r\n",
        ));
        assert_eq!(out, vec![WireMessage::new("x", "y", true)]);
    }
}
