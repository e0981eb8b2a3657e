//! # Conduit Gateway
//!
//! Serves clients over TCP and WebSocket and bridges them to a message
//! broker:
//!
//! ```text
//! client ── cmd 1 ──▶ EchoRouter ──▶ response on the same connection
//! client ── cmd 2 ──▶ ForwardRouter ──▶ Bridge::publish ──▶ broker topic
//! broker topic ──▶ Bridge ── cmd 3 ──▶ BroadcastRouter ──▶ every client
//! ```

pub mod gateway;
pub mod routers;

pub use gateway::{broker_for, Gateway};
pub use routers::{
    BroadcastRouter, EchoRouter, ForwardRouter, BROADCAST_MSG_ID, ECHO_MSG_ID, FORWARD_MSG_ID,
    RET_FORWARD_FAILED,
};
