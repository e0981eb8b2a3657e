//! # Conduit Bus
//!
//! ## Purpose
//!
//! Bridges the router model to a message broker:
//! - [`Bridge`]: broker deliveries dispatched straight to routers, plus
//!   buffered and direct publishing with a drain-on-shutdown guarantee
//! - [`Broker`], [`Producer`], [`Consumer`], [`DeliveryHandler`] seams
//! - [`NsqBroker`]: nsqd TCP protocol V2 with nsqlookupd discovery
//! - [`MemoryBroker`]: in-process broker with the same delivery semantics
//!
//! ## Architecture Role
//!
//! ```text
//! broker → Consumer → Bridge (unpack → RouterTable → Router) → ack / requeue
//! Router → Bridge::publish → buffer → writer per Producer → broker
//! ```

pub mod bridge;
pub mod broker;
pub mod error;
pub mod memory;
pub mod nsq;
pub mod payload;

pub use bridge::{Bridge, BridgeBuilder, BridgeConfig, DEFAULT_ENQUEUE_TIMEOUT};
pub use broker::{Broker, Consumer, ConsumerOptions, Delivery, DeliveryHandler, Producer};
pub use error::{BusError, BusResult};
pub use memory::{MemoryBroker, MemoryBrokerConfig};
pub use nsq::{NsqBroker, NsqConfig};
pub use payload::{Payload, PayloadPool, PayloadPoolExt};
