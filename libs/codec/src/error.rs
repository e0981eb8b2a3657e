//! Codec-level errors for message packing, unpacking and stream framing
//!
//! Decode errors are local to one message: callers log them and carry on with
//! the next frame. Each variant records what was being read and how many bytes
//! were expected so the log line is actionable on its own.

use thiserror::Error;

/// Message encode/decode errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer ended before a fixed-size field or a declared block was complete
    #[error("Truncated message: {field} needs {need} bytes, {got} available")]
    Truncated {
        field: &'static str,
        need: usize,
        got: usize,
    },

    /// Metadata block does not hold the key/value pairs its length declares
    #[error("wrong metadata lines. some keys or values are missing")]
    MetaKvMissing,

    /// A length that must fit the 32-bit wire field does not
    #[error("Field too large: {field} is {size} bytes, wire limit is {limit}")]
    FieldTooLarge {
        field: &'static str,
        size: usize,
        limit: usize,
    },

    /// Fault caught inside the codec; the message is dropped, the caller continues
    #[error("Internal codec fault: {0}")]
    Internal(String),
}

impl CodecError {
    /// Create a truncation error for `field`
    pub fn truncated(field: &'static str, need: usize, got: usize) -> Self {
        Self::Truncated { field, need, got }
    }

    /// Create an oversize error for a 32-bit length field
    pub fn field_too_large(field: &'static str, size: usize) -> Self {
        Self::FieldTooLarge {
            field,
            size,
            limit: u32::MAX as usize,
        }
    }
}

/// Stream framing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Declared frame length exceeds the decoder's configured maximum
    #[error("Frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Length field produced a length smaller than the bytes it must cover
    #[error("Invalid frame length {length}: {reason}")]
    InvalidLength { length: i64, reason: String },

    /// Decoder configuration cannot describe a valid frame layout
    #[error("Invalid frame decoder configuration: {0}")]
    Configuration(String),
}

/// Result type for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Result type for framing operations
pub type FrameResult<T> = std::result::Result<T, FrameError>;
