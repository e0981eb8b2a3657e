//! Per-connection heartbeat checking
//!
//! A heartbeat frame (its `cmd` equals [`HeartbeatChecker::cmd`]) never
//! reaches the worker pool. The read loop answers it straight away with the
//! checker's acknowledgment. Independently, a timer task checks
//! [`Connection::is_alive`] every interval and fires the not-alive action.

use crate::connection::Connection;
use crate::error::{NetworkError, NetworkResult};
use codec::Message;
use dispatch::MsgId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default command id of heartbeat frames
pub const DEFAULT_HEARTBEAT_CMD: MsgId = 99;

pub type MakeAck = Arc<dyn Fn(&Message) -> Message + Send + Sync>;
pub type OnRemoteNotAlive = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

#[derive(Clone)]
pub struct HeartbeatChecker {
    interval: Duration,
    max_idle: Duration,
    cmd: MsgId,
    make_ack: Option<MakeAck>,
    on_remote_not_alive: Option<OnRemoteNotAlive>,
}

impl HeartbeatChecker {
    /// Check every `interval`; a connection idle for longer than one interval is not alive.
    /// A zero interval is rejected: leave the checker off to disable heartbeats.
    pub fn new(interval: Duration, cmd: MsgId) -> NetworkResult<Self> {
        if interval.is_zero() {
            return Err(NetworkError::configuration(
                "heartbeat interval must be greater than zero",
                Some("interval"),
            ));
        }
        Ok(Self {
            interval,
            max_idle: interval,
            cmd,
            make_ack: None,
            on_remote_not_alive: None,
        })
    }

    /// Tolerate longer silences than the check interval
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Replace the default acknowledgment builder
    pub fn with_ack<F>(mut self, make_ack: F) -> Self
    where
        F: Fn(&Message) -> Message + Send + Sync + 'static,
    {
        self.make_ack = Some(Arc::new(make_ack));
        self
    }

    /// Replace the default not-alive action, which stops the connection
    pub fn with_on_remote_not_alive<F>(mut self, action: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_remote_not_alive = Some(Arc::new(action));
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_idle(&self) -> Duration {
        self.max_idle
    }

    pub fn cmd(&self) -> MsgId {
        self.cmd
    }

    /// Acknowledgment for a received heartbeat frame
    pub fn ack_for(&self, heartbeat: &Message) -> Message {
        match &self.make_ack {
            Some(make_ack) => make_ack(heartbeat),
            None => Message::response_to(heartbeat, 0, bytes::Bytes::new()),
        }
    }

    pub(crate) fn start(&self, conn: Arc<Connection>) -> HeartbeatHandle {
        let token = conn.cancel_token().child_token();
        let checker = self.clone();
        let loop_token = token.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(checker.interval);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if conn.is_alive() {
                    continue;
                }
                info!(
                    conn_id = conn.conn_id(),
                    remote = %conn.remote_addr(),
                    "remote not alive"
                );
                match &checker.on_remote_not_alive {
                    Some(action) => action(&conn),
                    None => conn.stop(),
                }
            }
            debug!(conn_id = conn.conn_id(), "heartbeat checker stopped");
        });
        HeartbeatHandle { token, join }
    }
}

impl fmt::Debug for HeartbeatChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatChecker")
            .field("interval", &self.interval)
            .field("max_idle", &self.max_idle)
            .field("cmd", &self.cmd)
            .field("custom_ack", &self.make_ack.is_some())
            .field("custom_not_alive", &self.on_remote_not_alive.is_some())
            .finish()
    }
}

pub(crate) struct HeartbeatHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub(crate) async fn stop(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}
