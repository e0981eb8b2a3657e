//! Publishing to one nsqd

use super::protocol::{is_valid_name, Command, Frame, ProtocolError, OK};
use super::{connect, NsqConfig, NsqFramed};
use crate::broker::Producer;
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Producer bound to a single nsqd
///
/// The connection is dialed on first publish and redialed after any transport
/// failure. Publishes on one producer are serialized: each `PUB` waits for its
/// `OK` before the next is written.
pub struct NsqProducer {
    addr: String,
    config: Arc<NsqConfig>,
    conn: Mutex<Option<NsqFramed>>,
    stopped: AtomicBool,
}

impl NsqProducer {
    pub fn new(addr: String, config: Arc<NsqConfig>) -> Self {
        Self {
            addr,
            config,
            conn: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    async fn publish_on(
        &self,
        conn: &mut Option<NsqFramed>,
        topic: &str,
        body: Bytes,
    ) -> BusResult<()> {
        if conn.is_none() {
            *conn = Some(connect(&self.addr, &self.config).await?);
        }
        let Some(framed) = conn.as_mut() else {
            return Err(BusError::protocol(&self.addr, ProtocolError::Closed));
        };

        framed
            .send(Command::Pub {
                topic: topic.to_string(),
                body,
            })
            .await
            .map_err(|e| BusError::protocol(&self.addr, e))?;

        loop {
            let frame = match framed.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(BusError::protocol(&self.addr, e)),
                None => return Err(BusError::protocol(&self.addr, ProtocolError::Closed)),
            };
            if frame.is_heartbeat() {
                framed
                    .send(Command::Nop)
                    .await
                    .map_err(|e| BusError::protocol(&self.addr, e))?;
                continue;
            }
            return match frame {
                Frame::Response(data) if data.as_ref() == OK => Ok(()),
                Frame::Response(data) => Err(BusError::protocol(
                    &self.addr,
                    ProtocolError::UnexpectedResponse(String::from_utf8_lossy(&data).into_owned()),
                )),
                Frame::Error(data) => Err(BusError::Nsq {
                    addr: self.addr.clone(),
                    command: "PUB",
                    message: String::from_utf8_lossy(&data).into_owned(),
                }),
                Frame::Message(_) => Err(BusError::protocol(
                    &self.addr,
                    ProtocolError::UnexpectedResponse("message frame on a producer".into()),
                )),
            };
        }
    }
}

#[async_trait]
impl Producer for NsqProducer {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn publish(&self, topic: &str, body: Bytes) -> BusResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BusError::Stopped);
        }
        if topic.is_empty() {
            return Err(BusError::EmptyTopic);
        }
        if !is_valid_name(topic) {
            return Err(BusError::InvalidName {
                name: topic.to_string(),
            });
        }
        if body.is_empty() {
            return Err(BusError::EmptyPayload {
                topic: topic.to_string(),
            });
        }

        let mut conn = self.conn.lock().await;
        let timeout = self.config.publish_timeout;
        match tokio::time::timeout(timeout, self.publish_on(&mut conn, topic, body)).await {
            Ok(Ok(())) => Ok(()),
            // nsqd answered; the connection is still good
            Ok(Err(e @ BusError::Nsq { .. })) => Err(e),
            Ok(Err(e)) => {
                if conn.take().is_some() {
                    warn!(addr = %self.addr, "dropping nsqd connection: {}", e);
                }
                Err(e)
            }
            Err(_) => {
                conn.take();
                Err(BusError::timeout("PUB", &self.addr, timeout))
            }
        }
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut framed) = self.conn.lock().await.take() {
            if let Err(e) = framed.close().await {
                debug!(addr = %self.addr, "closing nsqd connection: {}", e);
            }
        }
        info!(addr = %self.addr, "nsq producer stopped");
    }
}

impl std::fmt::Debug for NsqProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NsqProducer")
            .field("addr", &self.addr)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}
