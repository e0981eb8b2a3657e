//! Transport-agnostic message model
//!
//! A [`Message`] is what both the socket side and the broker side hand to the
//! router table. `cmd` doubles as the routing key.

use bytes::Bytes;
use std::collections::HashMap;

/// Metadata carried next to the payload; keys are unique within one message
pub type Metadata = HashMap<String, String>;

/// Payload serialization marker (4 bits on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SerializeType {
    /// Raw bytes, no serialization
    #[default]
    None,
    Json,
    ProtoBuffer,
    /// Any other 4-bit value, preserved as-is
    Other(u8),
}

impl SerializeType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            0 => Self::None,
            1 => Self::Json,
            2 => Self::ProtoBuffer,
            other => Self::Other(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Json => 1,
            Self::ProtoBuffer => 2,
            Self::Other(v) => v & 0x0F,
        }
    }
}

/// Payload compression marker (2 bits on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressType {
    #[default]
    None,
    Gzip,
    Brotli,
    Other(u8),
}

impl CompressType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::None,
            1 => Self::Gzip,
            2 => Self::Brotli,
            other => Self::Other(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
            Self::Brotli => 2,
            Self::Other(v) => v & 0x03,
        }
    }
}

/// Request/response marker (2 bits on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageType {
    #[default]
    Request,
    Response,
    Other(u8),
}

impl MessageType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Request,
            1 => Self::Response,
            other => Self::Other(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Response => 1,
            Self::Other(v) => v & 0x03,
        }
    }
}

/// One decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Command identifier, also the routing key
    pub cmd: u16,
    /// Result/status code, meaningful on responses
    pub ret: u16,
    pub version: u8,
    pub serialize_type: SerializeType,
    pub compress_type: CompressType,
    pub message_type: MessageType,
    /// Caller-assigned correlation number
    pub seq: u64,
    pub metadata: Metadata,
    pub data: Bytes,
}

impl Message {
    /// Create a request message with version 1 and no sequence number
    pub fn new(
        cmd: u16,
        ret: u16,
        serialize_type: SerializeType,
        metadata: Metadata,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            cmd,
            ret,
            version: 1,
            serialize_type,
            compress_type: CompressType::None,
            message_type: MessageType::Request,
            seq: 0,
            metadata,
            data: data.into(),
        }
    }

    /// Build the response to `request`: same cmd, seq, version and serialization
    pub fn response_to(request: &Message, ret: u16, data: impl Into<Bytes>) -> Self {
        Self {
            cmd: request.cmd,
            ret,
            version: request.version,
            serialize_type: request.serialize_type,
            compress_type: CompressType::None,
            message_type: MessageType::Response,
            seq: request.seq,
            metadata: Metadata::new(),
            data: data.into(),
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_compress_type(mut self, compress_type: CompressType) -> Self {
        self.compress_type = compress_type;
        self
    }

    /// Routing key used by router tables
    pub fn msg_id(&self) -> u16 {
        self.cmd
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Pack the three type markers into the flags byte
    pub fn flags(&self) -> u8 {
        (self.serialize_type.bits() << 4)
            | (self.compress_type.bits() << 2)
            | self.message_type.bits()
    }

    /// Unpack the flags byte into the three type markers
    pub fn set_flags(&mut self, flags: u8) {
        self.serialize_type = SerializeType::from_bits(flags >> 4);
        self.compress_type = CompressType::from_bits(flags >> 2);
        self.message_type = MessageType::from_bits(flags);
    }

    /// Clear every field, keeping allocated capacity of the metadata map
    pub fn reset(&mut self) {
        self.cmd = 0;
        self.ret = 0;
        self.version = 0;
        self.serialize_type = SerializeType::None;
        self.compress_type = CompressType::None;
        self.message_type = MessageType::Request;
        self.seq = 0;
        self.metadata.clear();
        self.data = Bytes::new();
    }
}
