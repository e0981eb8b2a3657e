//! # Conduit Dispatch
//!
//! ## Purpose
//!
//! Turns decoded messages into units of work and runs them:
//! - [`Router`] capability bound to one message id, collected in a [`RouterTable`]
//! - Pooled [`Task`]s carrying the message and its origin (socket session or
//!   broker delivery)
//! - [`TaskHandler`], the bounded worker pool shared by every socket connection
//!
//! ## Architecture Role
//!
//! ```text
//! Connection read loop ─→ TaskHandler queue ─→ worker ─→ RouterTable ─→ Router
//! Broker delivery ───────────────────────────────────→ RouterTable ─→ Router
//! ```
//!
//! The broker side shares the router model but not the queue; see the `bus`
//! crate.

pub mod error;
pub mod handler;
pub mod pool;
pub mod router;
pub mod task;

pub use error::{panic_message, DispatchError, DispatchResult};
pub use handler::{TaskHandler, TaskHandlerBuilder, TaskHandlerConfig};
pub use pool::{ObjectPool, PoolStats, Poolable};
pub use router::{MsgId, Router, RouterTable};
pub use task::{DeliveryHandle, FuncTask, Job, Session, Task, TaskOrigin, TaskPool, Touch};
