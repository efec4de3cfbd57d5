//! Replication Protocol
//!
//! Defines the wire protocol between shipping clients and the collector.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{AvailabilityReport, LogRecord, PROTOCOL_VERSION};
use crate::codec::{LogId, Schema};
use crate::error::{Error, Result};

/// Oldest protocol version the collector still accepts
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Largest frame body either side will read
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Whether this build can decode a given protocol version
pub fn is_supported_version(version: u16) -> bool {
    (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version)
}

/// One stream's rows as sent from client to collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub protocol_version: u16,
    pub client_hostname: String,
    pub file_prefix: String,
    pub tags: BTreeMap<String, String>,
    pub log_type: String,
    pub headers: Vec<String>,
    pub column_types: Vec<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn new(protocol_version: u16, log_id: &LogId, payload: Vec<u8>) -> Self {
        Self {
            protocol_version,
            client_hostname: log_id.client_hostname().to_string(),
            file_prefix: log_id.file_prefix().to_string(),
            tags: log_id.tags().clone(),
            log_type: log_id.log_type().to_string(),
            headers: log_id.headers().to_vec(),
            column_types: log_id.schema().column_type_bytes(),
            payload,
        }
    }

    /// Rebuild the stream identity and row payload
    pub fn into_record(self) -> Result<LogRecord> {
        let schema = Schema::from_type_bytes(self.headers, &self.column_types)?;
        let log_id = LogId::with_schema(
            self.file_prefix,
            self.log_type,
            self.client_hostname,
            self.tags,
            schema,
        );
        Ok(LogRecord {
            protocol_version: self.protocol_version,
            log_id,
            payload: self.payload,
        })
    }
}

/// Protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Shipping ==========
    /// Rows from a client; record `i` has message id `first_message_id + i`
    Append {
        session_id: Uuid,
        client_hostname: String,
        first_message_id: u64,
        records: Vec<WireMessage>,
    },

    /// Reply to `Append`. `last_message_id` is the highest id durably written
    /// for the session.
    Ack {
        acknowledged: bool,
        last_message_id: u64,
        availability: AvailabilityReport,
    },

    // ========== Status ==========
    /// Status request
    StatusRequest,

    /// Status response
    StatusResponse {
        server_hostname: String,
        availability: AvailabilityReport,
    },

    // ========== Errors ==========
    /// Request refused; resending it will not help
    Rejected { reason: String },

    /// Error response
    Error { code: ErrorCode, message: String },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Frame body failed its checksum
    Checksum,
    /// Frame body could not be decoded
    Decode,
    /// Message is valid but not expected here
    Unexpected,
    /// Internal error
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Append { .. } => "Append",
            Message::Ack { .. } => "Ack",
            Message::StatusRequest => "StatusRequest",
            Message::StatusResponse { .. } => "StatusResponse",
            Message::Rejected { .. } => "Rejected",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for versioned, length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Protocol version of the body
    pub version: u16,
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 10;

    /// Create a header for a body at the current protocol version
    pub fn new(data: &[u8]) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.version.to_le_bytes());
        bytes[2..6].copy_from_slice(&self.length.to_le_bytes());
        bytes[6..10].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            version: u16::from_le_bytes([bytes[0], bytes[1]]),
            length: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            checksum: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
        }
    }

    /// Reject headers whose body would be unreasonably large
    pub fn check_length(&self) -> Result<()> {
        if self.length as usize > MAX_FRAME_BYTES {
            return Err(Error::Protocol(format!(
                "Frame of {} bytes exceeds limit of {}",
                self.length, MAX_FRAME_BYTES
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ColumnType, TypeTag};

    #[test]
    fn test_message_serialization() {
        let msg = Message::Ack {
            acknowledged: true,
            last_message_id: 42,
            availability: AvailabilityReport {
                available: false,
                free_bytes: 10,
                required_bytes: 20,
            },
        };

        let bytes = msg.serialize().unwrap();
        let restored = Message::deserialize(&bytes).unwrap();

        match restored {
            Message::Ack {
                acknowledged,
                last_message_id,
                availability,
            } => {
                assert!(acknowledged);
                assert_eq!(last_message_id, 42);
                assert!(!availability.available);
                assert_eq!(availability.required_bytes, 20);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(restored.version, PROTOCOL_VERSION);
        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }

    #[test]
    fn test_wire_message_rebuilds_log_id() {
        let mut tags = BTreeMap::new();
        tags.insert("tenant".to_string(), "acme".to_string());
        let id = LogId::new(
            "clicks",
            "click",
            "web-1",
            tags,
            vec!["user".into(), "items".into()],
            vec![TypeTag::Enum.into(), ColumnType::List(TypeTag::Long)],
        )
        .unwrap();

        let wire = WireMessage::new(PROTOCOL_VERSION, &id, b"payload".to_vec());
        let record = wire.into_record().unwrap();

        // ENUM travels as STRING, so the schema hash survives the trip
        assert_eq!(record.log_id.schema_hash(), id.schema_hash());
        assert_eq!(record.log_id.tags(), id.tags());
        assert_eq!(record.payload, b"payload");
    }

    #[test]
    fn test_bad_column_types_fail_decode() {
        let id = LogId::new("p", "t", "h", BTreeMap::new(), vec!["a".into()], vec![TypeTag::Long.into()])
            .unwrap();
        let mut wire = WireMessage::new(PROTOCOL_VERSION, &id, vec![]);
        wire.column_types = vec![vec![99]];
        assert!(wire.into_record().is_err());
    }

    #[test]
    fn test_supported_versions() {
        assert!(is_supported_version(PROTOCOL_VERSION));
        assert!(!is_supported_version(0));
        assert!(!is_supported_version(PROTOCOL_VERSION + 1));
    }
}
