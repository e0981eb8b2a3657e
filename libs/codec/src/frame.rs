//! Stream framing
//!
//! A single read from a stream socket may hold zero, one or many frames, or the
//! start of a frame that continues in the next read. A [`FrameDecoder`] buffers
//! the partial tail internally and hands back only complete frames.
//!
//! Message-oriented transports (WebSocket, broker payloads) deliver whole
//! messages and run without a decoder.

use crate::datapack::{HEADER_LEN, META_LEN_OFFSET, MIN_MESSAGE_LEN};
use crate::error::{FrameError, FrameResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

/// Default upper bound on one frame
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Splits and merges raw stream bytes into protocol frames
pub trait FrameDecoder: Send {
    /// Feed `raw` into the decoder and push every completed frame onto `out`
    ///
    /// Frames completed before an error in the same call are still pushed.
    fn decode(&mut self, raw: &[u8], out: &mut Vec<Bytes>) -> FrameResult<()>;

    /// Frame one outbound message for the wire
    fn encode(&self, frame: &[u8], dst: &mut BytesMut) -> FrameResult<()> {
        dst.extend_from_slice(frame);
        Ok(())
    }

    /// Bytes held back waiting for the rest of a frame
    fn buffered(&self) -> usize;
}

/// Delimits frames of the native wire format using its own length fields
#[derive(Debug, Clone)]
pub struct MessageFrameDecoder {
    buffer: BytesMut,
    max_frame_len: usize,
}

impl MessageFrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_frame_len,
        }
    }

    /// Total length of the frame at the head of the buffer, if fully known
    fn peek_frame_len(&self) -> FrameResult<Option<usize>> {
        if self.buffer.len() < META_LEN_OFFSET + 4 {
            return Ok(None);
        }
        let mut meta_len_bytes = &self.buffer[META_LEN_OFFSET..META_LEN_OFFSET + 4];
        let meta_len = meta_len_bytes.get_u32() as usize;

        let lower_bound = MIN_MESSAGE_LEN + meta_len;
        if lower_bound > self.max_frame_len {
            return Err(FrameError::FrameTooLarge {
                size: lower_bound,
                max: self.max_frame_len,
            });
        }

        let data_len_offset = HEADER_LEN + 4 + meta_len;
        if self.buffer.len() < data_len_offset + 4 {
            return Ok(None);
        }
        let mut data_len_bytes = &self.buffer[data_len_offset..data_len_offset + 4];
        let data_len = data_len_bytes.get_u32() as usize;

        let total = lower_bound + data_len;
        if total > self.max_frame_len {
            return Err(FrameError::FrameTooLarge {
                size: total,
                max: self.max_frame_len,
            });
        }

        if self.buffer.len() < total {
            return Ok(None);
        }
        Ok(Some(total))
    }
}

impl Default for MessageFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameDecoder for MessageFrameDecoder {
    fn decode(&mut self, raw: &[u8], out: &mut Vec<Bytes>) -> FrameResult<()> {
        self.buffer.extend_from_slice(raw);
        loop {
            match self.peek_frame_len() {
                Ok(Some(len)) => out.push(self.buffer.split_to(len).freeze()),
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(buffered = self.buffer.len(), "discarding frame buffer: {}", e);
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Layout of a generic length-field framed stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthFieldConfig {
    /// Largest frame accepted, length field included
    pub max_frame_len: usize,
    /// Offset of the length field from the start of the frame
    pub length_field_offset: usize,
    /// Width of the length field: 1, 2, 4 or 8 bytes, big-endian
    pub length_field_length: usize,
    /// Added to the field value to get the number of bytes after the field
    pub length_adjustment: i64,
    /// Bytes dropped from the front of each decoded frame
    pub initial_bytes_to_strip: usize,
}

impl LengthFieldConfig {
    /// `u32` big-endian length prefix that counts only the body, stripped on decode
    pub fn u32_prefixed(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            length_field_offset: 0,
            length_field_length: 4,
            length_adjustment: 0,
            initial_bytes_to_strip: 4,
        }
    }

    fn header_end(&self) -> usize {
        self.length_field_offset + self.length_field_length
    }
}

impl Default for LengthFieldConfig {
    fn default() -> Self {
        Self::u32_prefixed(DEFAULT_MAX_FRAME_LEN)
    }
}

/// Generic length-field frame decoder
///
/// Cloning a freshly built decoder is the cheap way to stamp out one per
/// connection after validating the layout once.
#[derive(Debug, Clone)]
pub struct LengthFieldFrameDecoder {
    config: LengthFieldConfig,
    buffer: BytesMut,
}

impl LengthFieldFrameDecoder {
    pub fn new(config: LengthFieldConfig) -> FrameResult<Self> {
        if !matches!(config.length_field_length, 1 | 2 | 4 | 8) {
            return Err(FrameError::Configuration(format!(
                "length field must be 1, 2, 4 or 8 bytes, got {}",
                config.length_field_length
            )));
        }
        if config.header_end() > config.max_frame_len {
            return Err(FrameError::Configuration(format!(
                "length field ends at byte {} but max frame length is {}",
                config.header_end(),
                config.max_frame_len
            )));
        }
        Ok(Self {
            config,
            buffer: BytesMut::with_capacity(4096),
        })
    }

    pub fn config(&self) -> &LengthFieldConfig {
        &self.config
    }

    fn read_length_field(&self) -> u64 {
        let start = self.config.length_field_offset;
        let mut field = &self.buffer[start..start + self.config.length_field_length];
        match self.config.length_field_length {
            1 => field.get_u8() as u64,
            2 => field.get_u16() as u64,
            4 => field.get_u32() as u64,
            _ => field.get_u64(),
        }
    }

    fn peek_frame_len(&self) -> FrameResult<Option<usize>> {
        let header_end = self.config.header_end();
        if self.buffer.len() < header_end {
            return Ok(None);
        }

        let raw = self.read_length_field();
        let body = raw as i128 + self.config.length_adjustment as i128;
        if body < 0 {
            return Err(FrameError::InvalidLength {
                length: raw as i64,
                reason: format!(
                    "adjusted length {} is negative (adjustment {})",
                    body, self.config.length_adjustment
                ),
            });
        }

        let total = header_end as i128 + body;
        if total > self.config.max_frame_len as i128 {
            return Err(FrameError::FrameTooLarge {
                size: usize::try_from(total).unwrap_or(usize::MAX),
                max: self.config.max_frame_len,
            });
        }
        let total = total as usize;
        if total < self.config.initial_bytes_to_strip {
            return Err(FrameError::InvalidLength {
                length: raw as i64,
                reason: format!(
                    "frame of {} bytes is shorter than the {} bytes to strip",
                    total, self.config.initial_bytes_to_strip
                ),
            });
        }

        if self.buffer.len() < total {
            return Ok(None);
        }
        Ok(Some(total))
    }
}

impl FrameDecoder for LengthFieldFrameDecoder {
    fn decode(&mut self, raw: &[u8], out: &mut Vec<Bytes>) -> FrameResult<()> {
        self.buffer.extend_from_slice(raw);
        loop {
            match self.peek_frame_len() {
                Ok(Some(len)) => {
                    let mut frame = self.buffer.split_to(len);
                    frame.advance(self.config.initial_bytes_to_strip);
                    out.push(frame.freeze());
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(buffered = self.buffer.len(), "discarding frame buffer: {}", e);
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }
    }

    /// Prepends the length field when the decoder strips exactly the prefix;
    /// any other layout expects the caller to supply its own header
    fn encode(&self, frame: &[u8], dst: &mut BytesMut) -> FrameResult<()> {
        let cfg = &self.config;
        if cfg.length_field_offset != 0 || cfg.initial_bytes_to_strip != cfg.length_field_length {
            dst.extend_from_slice(frame);
            return Ok(());
        }

        let value = frame.len() as i128 - cfg.length_adjustment as i128;
        let total = cfg.length_field_length + frame.len();
        if value < 0 || total > cfg.max_frame_len {
            return Err(FrameError::FrameTooLarge {
                size: total,
                max: cfg.max_frame_len,
            });
        }
        let value = value as u64;
        let fits = match cfg.length_field_length {
            1 => value <= u8::MAX as u64,
            2 => value <= u16::MAX as u64,
            4 => value <= u32::MAX as u64,
            _ => true,
        };
        if !fits {
            return Err(FrameError::FrameTooLarge {
                size: total,
                max: cfg.max_frame_len,
            });
        }

        dst.reserve(total);
        match cfg.length_field_length {
            1 => dst.put_u8(value as u8),
            2 => dst.put_u16(value as u16),
            4 => dst.put_u32(value as u32),
            _ => dst.put_u64(value),
        }
        dst.extend_from_slice(frame);
        Ok(())
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapack::{pack, unpack};
    use crate::message::{Message, Metadata, SerializeType};

    fn sample(cmd: u16, data: &str) -> Bytes {
        let mut metadata = Metadata::new();
        metadata.insert("trace".to_string(), format!("t-{}", cmd));
        pack(&Message::new(cmd, 0, SerializeType::None, metadata, data.to_string())).unwrap()
    }

    #[test]
    fn test_message_decoder_many_frames_one_read() {
        let mut decoder = MessageFrameDecoder::default();
        let mut stream = BytesMut::new();
        for cmd in 1..=3 {
            stream.extend_from_slice(&sample(cmd, "body"));
        }

        let mut frames = Vec::new();
        decoder.decode(&stream, &mut frames).unwrap();

        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(unpack(frame).unwrap().cmd, i as u16 + 1);
        }
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_message_decoder_byte_at_a_time() {
        let mut decoder = MessageFrameDecoder::default();
        let wire = sample(7, "split across many reads");
        let mut frames = Vec::new();

        for (i, byte) in wire.iter().enumerate() {
            decoder.decode(&[*byte], &mut frames).unwrap();
            if i + 1 < wire.len() {
                assert!(frames.is_empty());
                assert_eq!(decoder.buffered(), i + 1);
            }
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], wire);
    }

    #[test]
    fn test_message_decoder_partial_tail_kept() {
        let mut decoder = MessageFrameDecoder::default();
        let first = sample(1, "a");
        let second = sample(2, "b");
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second[..5]);

        let mut frames = Vec::new();
        decoder.decode(&stream, &mut frames).unwrap();
        assert_eq!(frames, vec![first]);
        assert_eq!(decoder.buffered(), 5);

        decoder.decode(&second[5..], &mut frames).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], second);
    }

    #[test]
    fn test_message_decoder_rejects_oversize() {
        let mut decoder = MessageFrameDecoder::new(64);
        let good = sample(1, "ok");
        let big = sample(2, &"x".repeat(100));
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&good);
        stream.extend_from_slice(&big);

        let mut frames = Vec::new();
        let err = decoder.decode(&stream, &mut frames).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { max: 64, .. }));
        // the frame ahead of the bad one is still delivered
        assert_eq!(frames, vec![good]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_length_field_round_trip() {
        let mut decoder = LengthFieldFrameDecoder::new(LengthFieldConfig::default()).unwrap();
        let mut wire = BytesMut::new();
        decoder.encode(b"hello", &mut wire).unwrap();
        decoder.encode(b"", &mut wire).unwrap();
        decoder.encode(b"world!", &mut wire).unwrap();
        assert_eq!(&wire[..4], &5u32.to_be_bytes());

        let mut frames = Vec::new();
        decoder.decode(&wire[..7], &mut frames).unwrap();
        assert!(frames.is_empty());
        decoder.decode(&wire[7..], &mut frames).unwrap();
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"hello"),
                Bytes::from_static(b""),
                Bytes::from_static(b"world!"),
            ]
        );
    }

    #[test]
    fn test_length_field_with_header_kept() {
        // 2-byte tag, 2-byte length covering the whole frame, nothing stripped
        let config = LengthFieldConfig {
            max_frame_len: 1024,
            length_field_offset: 2,
            length_field_length: 2,
            length_adjustment: -4,
            initial_bytes_to_strip: 0,
        };
        let mut decoder = LengthFieldFrameDecoder::new(config).unwrap();
        let wire = [0xCA, 0xFE, 0x00, 0x07, b'a', b'b', b'c'];

        let mut frames = Vec::new();
        decoder.decode(&wire, &mut frames).unwrap();
        assert_eq!(frames, vec![Bytes::copy_from_slice(&wire)]);
    }

    #[test]
    fn test_length_field_negative_adjusted_length() {
        let config = LengthFieldConfig {
            length_adjustment: -10,
            ..LengthFieldConfig::default()
        };
        let mut decoder = LengthFieldFrameDecoder::new(config).unwrap();
        let mut frames = Vec::new();
        let err = decoder.decode(&[0, 0, 0, 2, 1, 2], &mut frames).unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength { .. }));
    }

    #[test]
    fn test_length_field_bad_config() {
        let config = LengthFieldConfig {
            length_field_length: 3,
            ..LengthFieldConfig::default()
        };
        assert!(matches!(
            LengthFieldFrameDecoder::new(config),
            Err(FrameError::Configuration(_))
        ));
    }
}
