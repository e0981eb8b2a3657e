//! # Conduit Network
//!
//! The socket side of Conduit:
//! - [`Connection`]: one accepted socket with its read loop, heartbeat,
//!   property bag and serialized writes
//! - [`ConnManager`]: sharded registry of live connections
//! - [`HeartbeatChecker`]: keep-alive command and liveness timer
//! - [`Server`]: TCP or WebSocket accept loop feeding a shared
//!   [`dispatch::TaskHandler`]
//!
//! Decoded messages leave this crate as [`dispatch::Task`]s whose origin is the
//! connection itself, so routers can reply through [`dispatch::Session`].

pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod manager;
pub mod server;
pub mod transports;

pub use connection::{ConnHook, Connection, ConnectionOptions, DEFAULT_READ_BUFFER_SIZE};
pub use error::{NetworkError, NetworkResult};
pub use heartbeat::{HeartbeatChecker, DEFAULT_HEARTBEAT_CMD};
pub use manager::{ConnManager, DEFAULT_SHARD_COUNT};
pub use server::{next_conn_id, FrameDecoderFactory, Server, ServerConfig, ServerKind};
pub use transports::{ReadOutcome, StreamReader, StreamWriter, Transport};
