//! Network Error Types
//!
//! Socket failures are fatal to the one connection that hit them and surface
//! to callers only as a closed connection plus a log line. The error values
//! here are what `send_*`, property lookups and server startup return.

use codec::{CodecError, FrameError};
use dispatch::DispatchError;
use std::net::SocketAddr;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug)]
pub enum NetworkError {
    /// Write attempted after the socket was closed
    #[error("Connection {conn_id} closed")]
    ConnectionClosed { conn_id: u64 },

    /// Property key absent from the connection's property bag
    #[error("No property found: {key}")]
    PropertyNotFound { key: String },

    /// Socket I/O failure
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// WebSocket handshake or frame failure
    #[error("WebSocket error: {message} (remote: {remote_addr:?})")]
    WebSocket {
        message: String,
        remote_addr: Option<SocketAddr>,
        #[source]
        source: Box<tungstenite::Error>,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Invalid server or connection settings
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },
}

pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

impl NetworkError {
    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Create a WebSocket error with context
    pub fn websocket(
        message: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        source: tungstenite::Error,
    ) -> Self {
        Self::WebSocket {
            message: message.into(),
            remote_addr,
            source: Box::new(source),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }
}
