//! NSQ broker
//!
//! [`NsqBroker`] speaks the nsqd TCP protocol directly: one lazily connected
//! [`NsqProducer`] per configured nsqd, and one [`NsqConsumer`] per topic that
//! finds nsqd nodes through nsqlookupd (or the static nsqd list when no
//! lookupd is configured).

pub mod consumer;
pub mod lookup;
pub mod producer;
pub mod protocol;

pub use consumer::NsqConsumer;
pub use lookup::LookupClient;
pub use producer::NsqProducer;
pub use protocol::{
    is_valid_name, Command, Frame, MessageId, NsqCodec, NsqMessage, ProtocolError,
    DEFAULT_MAX_FRAME_LEN, MAGIC_V2,
};

use crate::broker::{Broker, Consumer, ConsumerOptions, Producer};
use crate::error::{BusError, BusResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

pub(crate) type NsqFramed = Framed<TcpStream, NsqCodec>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsqConfig {
    /// nsqd TCP addresses; one producer each
    pub nsqd_addrs: Vec<String>,
    /// nsqlookupd HTTP addresses used for consumer discovery
    pub lookupd_addrs: Vec<String>,
    pub dial_timeout: Duration,
    /// Upper bound on one PUB round trip
    pub publish_timeout: Duration,
    pub lookupd_poll_interval: Duration,
    /// HTTP timeout of one lookup query
    pub lookupd_poll_timeout: Duration,
    /// Pause before redialing a statically configured nsqd
    pub reconnect_backoff: Duration,
    pub max_frame_len: usize,
}

impl Default for NsqConfig {
    fn default() -> Self {
        Self {
            nsqd_addrs: Vec::new(),
            lookupd_addrs: Vec::new(),
            dial_timeout: Duration::from_secs(1),
            publish_timeout: Duration::from_secs(5),
            lookupd_poll_interval: Duration::from_secs(1),
            lookupd_poll_timeout: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(1),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl NsqConfig {
    pub fn validate(&self) -> BusResult<()> {
        if self.nsqd_addrs.is_empty() && self.lookupd_addrs.is_empty() {
            return Err(BusError::configuration(
                "at least one nsqd or nsqlookupd address is required",
                Some("nsqd_addrs"),
            ));
        }
        if self.lookupd_poll_interval.is_zero() {
            return Err(BusError::configuration(
                "lookupd poll interval must be non-zero",
                Some("lookupd_poll_interval"),
            ));
        }
        if self.max_frame_len < 64 {
            return Err(BusError::configuration(
                "max frame length is too small",
                Some("max_frame_len"),
            ));
        }
        Ok(())
    }
}

pub struct NsqBroker {
    config: Arc<NsqConfig>,
    lookup: Option<Arc<LookupClient>>,
}

impl NsqBroker {
    pub fn new(config: NsqConfig) -> BusResult<Self> {
        config.validate()?;
        let lookup = if config.lookupd_addrs.is_empty() {
            None
        } else {
            Some(Arc::new(LookupClient::new(
                config.lookupd_addrs.clone(),
                config.lookupd_poll_timeout,
            )?))
        };
        Ok(Self {
            config: Arc::new(config),
            lookup,
        })
    }

    pub fn config(&self) -> &NsqConfig {
        &self.config
    }
}

impl Broker for NsqBroker {
    fn producers(&self) -> BusResult<Vec<Arc<dyn Producer>>> {
        Ok(self
            .config
            .nsqd_addrs
            .iter()
            .map(|addr| {
                Arc::new(NsqProducer::new(addr.clone(), self.config.clone())) as Arc<dyn Producer>
            })
            .collect())
    }

    fn consumer(&self, topic: &str, options: &ConsumerOptions) -> BusResult<Arc<dyn Consumer>> {
        for name in [topic, options.channel.as_str()] {
            if !is_valid_name(name) {
                return Err(BusError::InvalidName {
                    name: name.to_string(),
                });
            }
        }
        Ok(Arc::new(NsqConsumer::new(
            topic,
            options.clone(),
            self.config.clone(),
            self.lookup.clone(),
        )))
    }
}

impl std::fmt::Debug for NsqBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NsqBroker")
            .field("config", &self.config)
            .finish()
    }
}

/// Dial nsqd and select protocol V2
pub(crate) async fn connect(addr: &str, config: &NsqConfig) -> BusResult<NsqFramed> {
    let mut stream = tokio::time::timeout(config.dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| BusError::timeout("connect", addr, config.dial_timeout))?
        .map_err(|e| BusError::protocol(addr, e.into()))?;
    stream
        .set_nodelay(true)
        .map_err(|e| BusError::protocol(addr, e.into()))?;
    stream
        .write_all(MAGIC_V2)
        .await
        .map_err(|e| BusError::protocol(addr, e.into()))?;
    debug!(addr, "connected to nsqd");
    Ok(Framed::new(stream, NsqCodec::new(config.max_frame_len)))
}
