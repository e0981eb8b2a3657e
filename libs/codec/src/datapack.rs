//! # Binary Data Pack
//!
//! Packs and unpacks [`Message`]s in the Conduit wire layout. Big-endian
//! throughout:
//!
//! ```text
//! +------+------+---------+-----------+----------+----------+----------+------+----------+------+
//! | cmd  | ret  | version | serialize | compress | msg type |   seq    | meta | metadata | data | data
//! | u16  | u16  |   u8    |   4 bit   |  2 bit   |  2 bit   |   u64    | len  |  block   | len  |
//! +------+------+---------+-----------+----------+----------+----------+------+----------+------+
//! |<------------------------- header: 14 bytes --------------------->| u32  | meta len | u32  |
//! ```
//!
//! The metadata block is a run of `(key_len:u32, key, val_len:u32, val)` tuples
//! with no separators or terminator. Both block lengths are explicit; nothing is
//! inferred from surrounding stream state.

use crate::error::{CodecError, CodecResult};
use crate::message::{Message, Metadata};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

/// Fixed header: cmd(2) + ret(2) + version(1) + flags(1) + seq(8)
pub const HEADER_LEN: usize = 14;

/// Smallest valid encoding: header plus two empty length-prefixed blocks
pub const MIN_MESSAGE_LEN: usize = HEADER_LEN + 4 + 4;

/// Offset of the metadata length field
pub const META_LEN_OFFSET: usize = HEADER_LEN;

/// Pluggable message encoding used by connections and the broker bridge
pub trait DataPack: Send + Sync {
    /// Length of the fixed header
    fn head_len(&self) -> usize;

    /// Encode `msg` into a fresh buffer
    fn pack(&self, msg: &Message) -> CodecResult<Bytes>;

    /// Decode one message from `data`; must never panic outward
    fn unpack(&self, data: &[u8]) -> CodecResult<Message>;
}

/// Default big-endian binary pack
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryDataPack;

impl BinaryDataPack {
    pub fn new() -> Self {
        Self
    }
}

impl DataPack for BinaryDataPack {
    fn head_len(&self) -> usize {
        HEADER_LEN
    }

    fn pack(&self, msg: &Message) -> CodecResult<Bytes> {
        pack(msg)
    }

    fn unpack(&self, data: &[u8]) -> CodecResult<Message> {
        unpack(data)
    }
}

/// Encode a message into its wire form
pub fn pack(msg: &Message) -> CodecResult<Bytes> {
    let meta_len = encoded_metadata_len(&msg.metadata)?;
    if meta_len > u32::MAX as usize {
        return Err(CodecError::field_too_large("metadata", meta_len));
    }
    if msg.data.len() > u32::MAX as usize {
        return Err(CodecError::field_too_large("data", msg.data.len()));
    }

    let mut buf = BytesMut::with_capacity(MIN_MESSAGE_LEN + meta_len + msg.data.len());
    buf.put_u16(msg.cmd);
    buf.put_u16(msg.ret);
    buf.put_u8(msg.version);
    buf.put_u8(msg.flags());
    buf.put_u64(msg.seq);

    buf.put_u32(meta_len as u32);
    encode_metadata(&msg.metadata, &mut buf);

    buf.put_u32(msg.data.len() as u32);
    buf.put_slice(&msg.data);

    Ok(buf.freeze())
}

/// Decode a message from its wire form
///
/// Any fault raised while decoding is caught here, logged with a backtrace,
/// and returned as [`CodecError::Internal`].
pub fn unpack(data: &[u8]) -> CodecResult<Message> {
    match panic::catch_unwind(AssertUnwindSafe(|| unpack_inner(data))) {
        Ok(result) => result,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!(
                buffer_len = data.len(),
                backtrace = %Backtrace::force_capture(),
                "panic in message decode: {}",
                reason
            );
            Err(CodecError::Internal(reason))
        }
    }
}

fn unpack_inner(data: &[u8]) -> CodecResult<Message> {
    let mut buf = data;
    let mut msg = Message::default();

    ensure(buf, 2, "cmd")?;
    msg.cmd = buf.get_u16();
    ensure(buf, 2, "ret")?;
    msg.ret = buf.get_u16();
    ensure(buf, 1, "version")?;
    msg.version = buf.get_u8();
    ensure(buf, 1, "flags")?;
    let flags = buf.get_u8();
    msg.set_flags(flags);
    ensure(buf, 8, "seq")?;
    msg.seq = buf.get_u64();

    ensure(buf, 4, "meta len")?;
    let meta_len = buf.get_u32() as usize;
    if meta_len > 0 {
        ensure(buf, meta_len, "metadata")?;
        msg.metadata = decode_metadata(&buf[..meta_len])?;
        buf.advance(meta_len);
    }

    ensure(buf, 4, "data len")?;
    let data_len = buf.get_u32() as usize;
    if data_len > 0 {
        ensure(buf, data_len, "data")?;
        msg.data = Bytes::copy_from_slice(&buf[..data_len]);
    }

    Ok(msg)
}

fn ensure(buf: &[u8], need: usize, field: &'static str) -> CodecResult<()> {
    if buf.len() < need {
        return Err(CodecError::truncated(field, need, buf.len()));
    }
    Ok(())
}

/// Byte length of the encoded metadata block
pub fn encoded_metadata_len(metadata: &Metadata) -> CodecResult<usize> {
    let mut total = 0usize;
    for (k, v) in metadata {
        if k.len() > u32::MAX as usize {
            return Err(CodecError::field_too_large("metadata key", k.len()));
        }
        if v.len() > u32::MAX as usize {
            return Err(CodecError::field_too_large("metadata value", v.len()));
        }
        total += 8 + k.len() + v.len();
    }
    Ok(total)
}

/// len,key,len,value,... with no terminator
pub fn encode_metadata(metadata: &Metadata, buf: &mut BytesMut) {
    for (k, v) in metadata {
        buf.put_u32(k.len() as u32);
        buf.put_slice(k.as_bytes());
        buf.put_u32(v.len() as u32);
        buf.put_slice(v.as_bytes());
    }
}

/// Decode a metadata block whose declared length is `block.len()`
///
/// Fails with [`CodecError::MetaKvMissing`] when a key or value would read past
/// the end of the block.
pub fn decode_metadata(block: &[u8]) -> CodecResult<Metadata> {
    let limit = block.len();
    let mut metadata = Metadata::with_capacity(8);
    let mut n = 0usize;

    while n < limit {
        let key = read_chunk(block, &mut n)?;
        let value = read_chunk(block, &mut n)?;
        metadata.insert(
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
    }

    Ok(metadata)
}

fn read_chunk<'a>(block: &'a [u8], n: &mut usize) -> CodecResult<&'a [u8]> {
    let len_end = n.checked_add(4).ok_or(CodecError::MetaKvMissing)?;
    if len_end > block.len() {
        return Err(CodecError::MetaKvMissing);
    }
    let mut len_bytes = &block[*n..len_end];
    let len = len_bytes.get_u32() as usize;

    let end = len_end.checked_add(len).ok_or(CodecError::MetaKvMissing)?;
    if end > block.len() {
        return Err(CodecError::MetaKvMissing);
    }
    *n = end;
    Ok(&block[len_end..end])
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
