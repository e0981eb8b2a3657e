//! # Conduit Wire Codec
//!
//! ## Purpose
//!
//! Byte-exact encoding of the Conduit binary message format and the stream
//! framing that sits in front of it:
//! - [`Message`] model with the packed serialize/compress/message-type flags
//! - [`DataPack`] trait and the default big-endian [`BinaryDataPack`]
//! - Metadata block encoding (`len,key,len,value,...`)
//! - [`FrameDecoder`] implementations for stream transports
//!
//! ## Architecture Role
//!
//! ```text
//! socket bytes → [FrameDecoder] → frames → [DataPack::unpack] → Message → dispatch
//! broker body  ─────────────────────────→ [DataPack::unpack] → Message → dispatch
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Socket management or connection handling (belongs in network/)
//! - Routing and worker pools (belongs in dispatch/)

pub mod datapack;
pub mod error;
pub mod frame;
pub mod message;

pub use datapack::{
    decode_metadata, encode_metadata, pack, unpack, BinaryDataPack, DataPack, HEADER_LEN,
    MIN_MESSAGE_LEN,
};
pub use error::{CodecError, CodecResult, FrameError, FrameResult};
pub use frame::{
    FrameDecoder, LengthFieldConfig, LengthFieldFrameDecoder, MessageFrameDecoder,
    DEFAULT_MAX_FRAME_LEN,
};
pub use message::{CompressType, Message, MessageType, Metadata, SerializeType};
