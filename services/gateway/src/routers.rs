//! Built-in routers

use anyhow::Context;
use async_trait::async_trait;
use bus::Bridge;
use codec::{Message, Metadata};
use dispatch::{MsgId, Router, Task};
use network::ConnManager;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, warn};

/// Client request echoed back as a response
pub const ECHO_MSG_ID: MsgId = 1;
/// Client request forwarded to the broker
pub const FORWARD_MSG_ID: MsgId = 2;
/// Broker delivery pushed to every connected client
pub const BROADCAST_MSG_ID: MsgId = 3;

/// `ret` of the response sent when forwarding fails
pub const RET_FORWARD_FAILED: u16 = 1;

pub struct EchoRouter;

#[async_trait]
impl Router for EchoRouter {
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        let request = task.message();
        let response = Message::response_to(request, 0, request.data.clone());
        task.reply(&response).await?;
        Ok(())
    }
}

/// Publishes the request body to `topic` as a broadcast message
pub struct ForwardRouter {
    bridge: Arc<Bridge>,
    topic: String,
}

impl ForwardRouter {
    pub fn new(bridge: Arc<Bridge>, topic: impl Into<String>) -> Self {
        Self {
            bridge,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl Router for ForwardRouter {
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        let request = task.message();
        let mut metadata = Metadata::new();
        if let Some(session) = task.session() {
            metadata.insert("origin".to_string(), session.conn_id().to_string());
        }
        let forwarded = Message::new(
            BROADCAST_MSG_ID,
            0,
            request.serialize_type,
            metadata,
            request.data.clone(),
        )
        .with_seq(request.seq);

        if let Err(e) = self.bridge.publish_msg(&self.topic, &forwarded).await {
            let failed = Message::response_to(request, RET_FORWARD_FAILED, e.to_string());
            if let Err(reply_err) = task.reply(&failed).await {
                debug!("could not report forward failure: {}", reply_err);
            }
            return Err(e).with_context(|| format!("forward to topic {}", self.topic));
        }
        debug!(topic = %self.topic, seq = request.seq, "forwarded");
        Ok(())
    }
}

/// Sends every delivery to each connection of the given managers
pub struct BroadcastRouter {
    managers: Vec<Arc<ConnManager>>,
}

impl BroadcastRouter {
    pub fn new(managers: Vec<Arc<ConnManager>>) -> Self {
        Self { managers }
    }
}

#[async_trait]
impl Router for BroadcastRouter {
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        let mut conns = Vec::new();
        for manager in &self.managers {
            let _ = manager.range(|_, conn| {
                conns.push(conn.clone());
                Ok::<(), Infallible>(())
            });
        }

        let msg = task.message();
        let mut sent = 0usize;
        for conn in &conns {
            match conn.send_msg(msg).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(conn_id = conn.conn_id(), "broadcast failed: {}", e),
            }
        }
        debug!(sent, total = conns.len(), "broadcast delivered");
        Ok(())
    }
}
