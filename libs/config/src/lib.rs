//! # Conduit Configuration
//!
//! Serde structs for a gateway process and their loading:
//!
//! - [`ServerConfig`]: listeners, worker pool, read buffers, heartbeats, framing
//! - [`BusConfig`]: broker bridge, nsqd and nsqlookupd endpoints
//! - [`LogConfig`]: log filter and output format
//!
//! ## Usage
//!
//! ```rust,no_run
//! use config::ConduitConfig;
//! use std::path::Path;
//!
//! let config = ConduitConfig::load(Some(Path::new("conduit.toml")))?;
//! println!("{} workers", config.server.worker_pool_size);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod loader;
pub mod settings;

pub use loader::{ENV_PREFIX, ENV_SEPARATOR};
pub use settings::{BusConfig, ConduitConfig, FrameDecoderKind, LogConfig, ServerConfig};
