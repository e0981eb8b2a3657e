//! NSQ TCP protocol, version 2
//!
//! ```text
//! client → nsqd   "  V2" once, then newline-terminated commands
//!                 PUB <topic>\n [size:u32][body]
//! nsqd → client   [size:u32][frame_type:i32][data]   size counts type + data
//!                 frame_type 0 = response, 1 = error, 2 = message
//! message data    [timestamp:i64][attempts:u16][id:16 bytes][body]
//! ```
//!
//! Integers are big-endian. [`NsqCodec`] plugs into `tokio_util::codec::Framed`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Protocol selector sent right after connecting
pub const MAGIC_V2: &[u8; 4] = b"  V2";

pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const OK: &[u8] = b"OK";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

pub const MSG_ID_LEN: usize = 16;

/// nsqd's default --max-msg-size plus framing slack
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024 + 64;

const FRAME_TYPE_RESPONSE: i32 = 0;
const FRAME_TYPE_ERROR: i32 = 1;
const FRAME_TYPE_MESSAGE: i32 = 2;

/// Fixed message prefix: timestamp + attempts + id
const MESSAGE_HEADER_LEN: usize = 8 + 2 + MSG_ID_LEN;

const MAX_NAME_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unknown frame type {0}")]
    UnknownFrameType(i32),

    #[error("Connection closed by nsqd")]
    Closed,

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

pub type MessageId = [u8; MSG_ID_LEN];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    Req { id: MessageId, delay: Duration },
    Touch(MessageId),
    Nop,
    Cls,
    Pub { topic: String, body: Bytes },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sub { .. } => "SUB",
            Self::Rdy(_) => "RDY",
            Self::Fin(_) => "FIN",
            Self::Req { .. } => "REQ",
            Self::Touch(_) => "TOUCH",
            Self::Nop => "NOP",
            Self::Cls => "CLS",
            Self::Pub { .. } => "PUB",
        }
    }
}

/// A message frame's payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsqMessage {
    pub id: MessageId,
    pub attempts: u16,
    /// Nanoseconds since the epoch, set by nsqd
    pub timestamp: i64,
    pub body: Bytes,
}

impl NsqMessage {
    pub fn id_str(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(NsqMessage),
}

impl Frame {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Response(data) if data.as_ref() == HEARTBEAT)
    }
}

/// Topic and channel names: 1 to 64 of `[.a-zA-Z0-9_-]`, optional `#ephemeral`
pub fn is_valid_name(name: &str) -> bool {
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    !base.is_empty()
        && name.len() <= MAX_NAME_LEN
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

#[derive(Debug, Clone)]
pub struct NsqCodec {
    max_frame_len: usize,
}

impl NsqCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for NsqCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for NsqCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if size < 4 {
            return Err(ProtocolError::Malformed(format!(
                "frame size {size} shorter than its type field"
            )));
        }
        if size > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_len,
            });
        }
        if src.len() < 4 + size {
            src.reserve(4 + size - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = src.get_i32();
        let mut data = src.split_to(size - 4).freeze();

        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Some(Frame::Response(data))),
            FRAME_TYPE_ERROR => Ok(Some(Frame::Error(data))),
            FRAME_TYPE_MESSAGE => {
                if data.len() < MESSAGE_HEADER_LEN {
                    return Err(ProtocolError::Malformed(format!(
                        "message frame of {} bytes, need at least {}",
                        data.len(),
                        MESSAGE_HEADER_LEN
                    )));
                }
                let timestamp = data.get_i64();
                let attempts = data.get_u16();
                let mut id = [0u8; MSG_ID_LEN];
                data.copy_to_slice(&mut id);
                Ok(Some(Frame::Message(NsqMessage {
                    id,
                    attempts,
                    timestamp,
                    body: data,
                })))
            }
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

impl Encoder<Command> for NsqCodec {
    type Error = ProtocolError;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match cmd {
            Command::Sub { topic, channel } => {
                dst.put_slice(b"SUB ");
                dst.put_slice(topic.as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(channel.as_bytes());
                dst.put_u8(b'\n');
            }
            Command::Rdy(count) => {
                dst.put_slice(format!("RDY {count}\n").as_bytes());
            }
            Command::Fin(id) => put_id_command(dst, b"FIN ", &id),
            Command::Touch(id) => put_id_command(dst, b"TOUCH ", &id),
            Command::Req { id, delay } => {
                dst.put_slice(b"REQ ");
                dst.put_slice(&id);
                dst.put_slice(format!(" {}\n", delay.as_millis()).as_bytes());
            }
            Command::Nop => dst.put_slice(b"NOP\n"),
            Command::Cls => dst.put_slice(b"CLS\n"),
            Command::Pub { topic, body } => {
                let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
                    size: body.len(),
                    max: u32::MAX as usize,
                })?;
                dst.reserve(topic.len() + 9 + body.len());
                dst.put_slice(b"PUB ");
                dst.put_slice(topic.as_bytes());
                dst.put_u8(b'\n');
                dst.put_u32(len);
                dst.put_slice(&body);
            }
        }
        Ok(())
    }
}

fn put_id_command(dst: &mut BytesMut, verb: &[u8], id: &MessageId) {
    dst.put_slice(verb);
    dst.put_slice(id);
    dst.put_u8(b'\n');
}
