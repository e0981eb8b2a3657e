//! Configuration structs and their defaults
//!
//! Durations are stored as integer milliseconds so TOML files and
//! environment overrides stay plain numbers; the accessor methods hand
//! out [`Duration`]s.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration of a Conduit gateway
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConduitConfig {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub log: LogConfig,
}

/// How inbound stream bytes are cut into frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameDecoderKind {
    /// Every read is unpacked as one message
    None,
    /// Native wire format, delimited by its own length fields
    #[default]
    Message,
    /// u32 big-endian length prefix
    LengthField,
}

/// Socket-serving side: listeners, worker pool and heartbeats
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub tcp_addr: String,
    /// WebSocket listener; empty disables it
    pub ws_addr: String,
    pub worker_pool_size: usize,
    pub max_task_queue_len: usize,
    pub task_pool_capacity: usize,
    pub read_buffer_size: usize,
    /// 0 disables heartbeat checking
    pub heartbeat_interval_ms: u64,
    pub heartbeat_cmd: u16,
    /// 0 means unlimited
    pub max_conn: usize,
    pub max_frame_len: usize,
    pub frame_decoder: FrameDecoderKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "conduit".to_string(),
            tcp_addr: "0.0.0.0:8999".to_string(),
            ws_addr: "0.0.0.0:9000".to_string(),
            worker_pool_size: 10,
            max_task_queue_len: 1024,
            task_pool_capacity: 1024,
            read_buffer_size: 4096,
            heartbeat_interval_ms: 10_000,
            heartbeat_cmd: 99,
            max_conn: 0,
            max_frame_len: 16 * 1024 * 1024,
            frame_decoder: FrameDecoderKind::Message,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn tcp_socket_addr(&self) -> Result<SocketAddr> {
        self.tcp_addr
            .parse()
            .with_context(|| format!("server.tcp_addr '{}' is not a socket address", self.tcp_addr))
    }

    pub fn ws_socket_addr(&self) -> Result<Option<SocketAddr>> {
        if self.ws_addr.is_empty() {
            return Ok(None);
        }
        self.ws_addr
            .parse()
            .map(Some)
            .with_context(|| format!("server.ws_addr '{}' is not a socket address", self.ws_addr))
    }

    fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            bail!("server.worker_pool_size must be at least 1");
        }
        if self.max_task_queue_len == 0 {
            bail!("server.max_task_queue_len must be at least 1");
        }
        if self.read_buffer_size == 0 {
            bail!("server.read_buffer_size must be at least 1");
        }
        if self.max_frame_len == 0 {
            bail!("server.max_frame_len must be at least 1");
        }
        self.tcp_socket_addr()?;
        self.ws_socket_addr()?;
        Ok(())
    }
}

/// Broker bridge and its NSQ endpoints
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    pub enabled: bool,
    /// nsqd TCP addresses; one producer each
    pub nsqd_addrs: Vec<String>,
    /// nsqlookupd HTTP addresses for consumer discovery
    pub lookupd_addrs: Vec<String>,
    pub channel: String,
    /// Topic the gateway forwards client messages to
    pub forward_topic: String,
    pub concurrency: usize,
    pub max_in_flight: usize,
    pub buffer_capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub lookupd_poll_interval_ms: u64,
    pub requeue_delay_ms: u64,
    /// Unset retries a failing payload until it succeeds
    pub drain_max_attempts: Option<u32>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            nsqd_addrs: Vec::new(),
            lookupd_addrs: Vec::new(),
            channel: "conduit".to_string(),
            forward_topic: "conduit.forward".to_string(),
            concurrency: 1,
            max_in_flight: 100,
            buffer_capacity: 1024,
            enqueue_timeout_ms: 5,
            lookupd_poll_interval_ms: 1000,
            requeue_delay_ms: 1000,
            drain_max_attempts: None,
        }
    }
}

impl BusConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn lookupd_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lookupd_poll_interval_ms)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.nsqd_addrs.is_empty() {
            bail!("bus.nsqd_addrs must name at least one nsqd when the bus is enabled");
        }
        if self.channel.is_empty() {
            bail!("bus.channel must not be empty");
        }
        if self.forward_topic.is_empty() {
            bail!("bus.forward_topic must not be empty");
        }
        if self.concurrency == 0 {
            bail!("bus.concurrency must be at least 1");
        }
        if self.max_in_flight == 0 {
            bail!("bus.max_in_flight must be at least 1");
        }
        if self.buffer_capacity == 0 {
            bail!("bus.buffer_capacity must be at least 1");
        }
        if self.enqueue_timeout_ms == 0 {
            bail!("bus.enqueue_timeout_ms must be at least 1");
        }
        if !self.lookupd_addrs.is_empty() && self.lookupd_poll_interval_ms == 0 {
            bail!("bus.lookupd_poll_interval_ms must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ConduitConfig {
    /// Reject settings that would fail later at startup
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.bus.validate()?;
        if self.log.level.trim().is_empty() {
            bail!("log.level must not be empty");
        }
        Ok(())
    }

    /// Expand `$VAR` and `${VAR}` in every address
    pub fn expand_env_vars(&mut self) -> Result<()> {
        let expand = |value: &mut String, field: &str| -> Result<()> {
            let expanded = shellexpand::env(value.as_str())
                .with_context(|| format!("Failed to expand {field}"))?
                .into_owned();
            *value = expanded;
            Ok(())
        };
        expand(&mut self.server.tcp_addr, "server.tcp_addr")?;
        expand(&mut self.server.ws_addr, "server.ws_addr")?;
        for addr in &mut self.bus.nsqd_addrs {
            expand(addr, "bus.nsqd_addrs")?;
        }
        for addr in &mut self.bus.lookupd_addrs {
            expand(addr, "bus.lookupd_addrs")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConduitConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bus.enqueue_timeout(), Duration::from_millis(5));
        assert_eq!(
            config.server.heartbeat_interval(),
            Some(Duration::from_secs(10))
        );
        assert!(!config.bus.enabled);
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = ConduitConfig::default();
        config.server.worker_pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = ConduitConfig::default();
        config.server.read_buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = ConduitConfig::default();
        config.bus.enabled = true;
        config.bus.nsqd_addrs = vec!["127.0.0.1:4150".into()];
        config.bus.concurrency = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bus.concurrency"));
    }

    #[test]
    fn test_enabled_bus_needs_producers() {
        let mut config = ConduitConfig::default();
        config.bus.enabled = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("nsqd_addrs"));
    }

    #[test]
    fn test_disabled_websocket() {
        let mut config = ServerConfig::default();
        config.ws_addr.clear();
        assert_eq!(config.ws_socket_addr().unwrap(), None);
        config.ws_addr = "not-an-addr".into();
        assert!(config.ws_socket_addr().is_err());
    }

    #[test]
    fn test_heartbeat_disabled_with_zero() {
        let config = ServerConfig {
            heartbeat_interval_ms: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.heartbeat_interval(), None);
    }
}
