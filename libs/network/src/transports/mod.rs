//! Stream transports behind one reader/writer seam
//!
//! A [`Connection`](crate::Connection) never sees a concrete socket type. It
//! owns one [`StreamReader`] (driven only by its read loop) and one
//! [`StreamWriter`] (behind the connection's write lock).

use crate::NetworkResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;

pub mod tcp;
pub mod websocket;

pub use tcp::{TcpReader, TcpWriter};
pub use websocket::{WsReader, WsWriter};

/// Result of one read from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes received; for message transports, exactly one message
    Data(Bytes),
    /// Transport activity that carries no message bytes
    Idle,
    /// Peer closed its side
    Eof,
}

#[async_trait]
pub trait StreamReader: Send {
    async fn read(&mut self) -> NetworkResult<ReadOutcome>;
}

#[async_trait]
pub trait StreamWriter: Send {
    /// Write all of `data` and flush it
    async fn write(&mut self, data: Bytes) -> NetworkResult<()>;

    /// Close the write side; later writes fail
    async fn close(&mut self) -> NetworkResult<()>;
}

/// Both halves of an accepted socket plus its addresses
pub struct Transport {
    pub reader: Box<dyn StreamReader>,
    pub writer: Box<dyn StreamWriter>,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
