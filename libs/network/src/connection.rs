//! # Connection
//!
//! One accepted socket: its read loop, heartbeat, property bag and the write
//! lock that serializes outbound frames.
//!
//! ## Lifecycle
//!
//! `Created → Running → Closed`. [`Connection::start`] runs the start hook,
//! starts the heartbeat, spawns the read loop and then waits for the lifetime
//! token. Once cancelled it runs, in this order: stop hook, heartbeat stop,
//! socket close, removal from the owning [`ConnManager`]. The stop hook still
//! sees an open socket.
//!
//! The token is cancelled by [`Connection::stop`], a read or write failure, a
//! peer close, or the owning server shutting down. Manager removal never
//! closes a connection.

use crate::error::{NetworkError, NetworkResult};
use crate::heartbeat::{HeartbeatChecker, HeartbeatHandle};
use crate::manager::ConnManager;
use crate::transports::{ReadOutcome, StreamReader, StreamWriter, Transport};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use codec::{BinaryDataPack, DataPack, FrameDecoder, Message};
use dispatch::{Session, TaskHandler, TaskOrigin};
use futures::FutureExt;
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default socket read buffer
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Hook run on connection start or stop
pub type ConnHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Everything a connection needs besides its socket
pub struct ConnectionOptions {
    pub version: i32,
    pub datapack: Arc<dyn DataPack>,
    pub frame_decoder: Option<Box<dyn FrameDecoder>>,
    pub heartbeat: Option<HeartbeatChecker>,
    pub on_start: Option<ConnHook>,
    pub on_stop: Option<ConnHook>,
    /// Registry that tracks this connection; it is removed on close
    pub manager: Option<Arc<ConnManager>>,
    /// Lifetime token becomes a child of this one
    pub parent_token: Option<CancellationToken>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            version: 0,
            datapack: Arc::new(BinaryDataPack::new()),
            frame_decoder: None,
            heartbeat: None,
            on_start: None,
            on_stop: None,
            manager: None,
            parent_token: None,
        }
    }
}

pub struct Connection {
    conn_id: u64,
    conn_id_str: String,
    version: i32,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,

    task_handler: Arc<TaskHandler>,
    datapack: Arc<dyn DataPack>,
    decoder: Mutex<Option<Box<dyn FrameDecoder>>>,
    has_decoder: bool,
    heartbeat: Option<HeartbeatChecker>,
    on_start: Option<ConnHook>,
    on_stop: Option<ConnHook>,
    manager: Option<Weak<ConnManager>>,

    reader: Mutex<Option<Box<dyn StreamReader>>>,
    writer: tokio::sync::Mutex<Box<dyn StreamWriter>>,
    closed: AtomicBool,
    started: AtomicBool,
    token: CancellationToken,

    properties: Mutex<Option<HashMap<String, String>>>,
    created_at: Instant,
    /// Milliseconds after `created_at`
    last_activity_ms: AtomicU64,
}

impl Connection {
    pub fn new(
        conn_id: u64,
        transport: Transport,
        task_handler: Arc<TaskHandler>,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        let token = match &options.parent_token {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let has_decoder = options.frame_decoder.is_some();

        Arc::new(Self {
            conn_id,
            conn_id_str: conn_id.to_string(),
            version: options.version,
            remote_addr: transport.remote_addr,
            local_addr: transport.local_addr,
            task_handler,
            datapack: options.datapack,
            decoder: Mutex::new(options.frame_decoder),
            has_decoder,
            heartbeat: options.heartbeat,
            on_start: options.on_start,
            on_stop: options.on_stop,
            manager: options.manager.as_ref().map(Arc::downgrade),
            reader: Mutex::new(Some(transport.reader)),
            writer: tokio::sync::Mutex::new(transport.writer),
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            token,
            properties: Mutex::new(None),
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        })
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn conn_id_str(&self) -> &str {
        &self.conn_id_str
    }

    pub fn conn_version(&self) -> i32 {
        self.version
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn has_frame_decoder(&self) -> bool {
        self.has_decoder
    }

    pub fn task_handler(&self) -> &Arc<TaskHandler> {
        &self.task_handler
    }

    /// Lifetime token; cancelled once the connection starts closing
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run the connection until it is stopped
    ///
    /// Returns after the socket is closed and the connection has left its
    /// manager. Calling it a second time returns immediately.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!(conn_id = self.conn_id, "connection already started");
            return;
        }
        debug!(conn_id = self.conn_id, remote = %self.remote_addr, "connection starting");

        if let Some(hook) = &self.on_start {
            hook(self);
        }

        let heartbeat = self.heartbeat.as_ref().map(|checker| {
            self.touch();
            checker.start(self.clone())
        });

        let reader = self.reader.lock().take();
        match reader {
            Some(reader) => {
                let conn = self.clone();
                tokio::spawn(async move { conn.run_reader(reader).await });
            }
            None => self.stop(),
        }

        self.token.cancelled().await;

        if let Some(hook) = &self.on_stop {
            hook(self);
        }
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }
        self.close_socket().await;
        if let Some(manager) = self.manager.as_ref().and_then(Weak::upgrade) {
            manager.remove(self);
        }
        info!(conn_id = self.conn_id, remote = %self.remote_addr, "connection closed");
    }

    /// Cancel the lifetime token; cleanup runs inside [`Connection::start`]
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// False once stopping, or when idle longer than the heartbeat allows
    pub fn is_alive(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        match &self.heartbeat {
            Some(checker) => self.idle_for() <= checker.max_idle(),
            None => true,
        }
    }

    /// Time since the last received bytes
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }

    fn touch(&self) {
        let now = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    /// Write raw bytes to the socket
    pub async fn send_data(&self, data: Bytes) -> NetworkResult<()> {
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed {
                conn_id: self.conn_id,
            });
        }
        if let Err(e) = writer.write(data).await {
            error!(conn_id = self.conn_id, "send failed, stopping connection: {}", e);
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    /// Pack `msg` and write it, framed by the connection's decoder if any
    pub async fn send_msg(&self, msg: &Message) -> NetworkResult<()> {
        let packed = self.datapack.pack(msg)?;
        let data = {
            let decoder = self.decoder.lock();
            match decoder.as_ref() {
                Some(decoder) => {
                    let mut framed = BytesMut::with_capacity(packed.len() + 8);
                    decoder.encode(&packed, &mut framed)?;
                    framed.freeze()
                }
                None => packed,
            }
        };
        debug!(conn_id = self.conn_id, cmd = msg.cmd, seq = msg.seq, "send msg");
        self.send_data(data).await
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.properties
            .lock()
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
    }

    pub fn get_property(&self, key: &str) -> NetworkResult<String> {
        self.properties
            .lock()
            .as_ref()
            .and_then(|props| props.get(key).cloned())
            .ok_or_else(|| NetworkError::PropertyNotFound {
                key: key.to_string(),
            })
    }

    pub fn remove_property(&self, key: &str) {
        if let Some(props) = self.properties.lock().as_mut() {
            props.remove(key);
        }
    }

    async fn close_socket(&self) {
        let mut writer = self.writer.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = writer.close().await {
            debug!(conn_id = self.conn_id, "socket close: {}", e);
        }
    }

    async fn run_reader(self: Arc<Self>, reader: Box<dyn StreamReader>) {
        debug!(conn_id = self.conn_id, "reader running");
        let result = AssertUnwindSafe(self.clone().read_loop(reader))
            .catch_unwind()
            .await;
        if let Err(payload) = result {
            error!(
                conn_id = self.conn_id,
                backtrace = %Backtrace::force_capture(),
                "reader panicked: {}",
                dispatch::panic_message(payload.as_ref())
            );
        }
        self.stop();
        debug!(conn_id = self.conn_id, "reader exit");
    }

    async fn read_loop(self: Arc<Self>, mut reader: Box<dyn StreamReader>) {
        let mut frames = Vec::new();
        loop {
            let outcome = tokio::select! {
                _ = self.token.cancelled() => return,
                outcome = reader.read() => outcome,
            };
            match outcome {
                Ok(ReadOutcome::Data(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    self.touch();
                    if let Err(e) = self.process(data, &mut frames).await {
                        if !e.is_closed() {
                            warn!(conn_id = self.conn_id, "closing connection: {}", e);
                        }
                        return;
                    }
                }
                Ok(ReadOutcome::Idle) => self.touch(),
                Ok(ReadOutcome::Eof) => {
                    debug!(conn_id = self.conn_id, "peer closed");
                    return;
                }
                Err(e) => {
                    warn!(conn_id = self.conn_id, "read error: {}", e);
                    return;
                }
            }
        }
    }

    /// Turn one read into tasks; an error ends the read loop
    async fn process(self: &Arc<Self>, data: Bytes, frames: &mut Vec<Bytes>) -> NetworkResult<()> {
        if self.has_decoder {
            let mut decoder = self.decoder.lock();
            if let Some(decoder) = decoder.as_mut() {
                // frames completed ahead of a framing error are still handled
                if let Err(e) = decoder.decode(&data, frames) {
                    warn!(conn_id = self.conn_id, "frame decode: {}", e);
                }
            }
        } else {
            frames.push(data);
        }

        for frame in frames.drain(..) {
            let msg = match self.datapack.unpack(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(conn_id = self.conn_id, bytes = frame.len(), "unpack: {}", e);
                    continue;
                }
            };

            if let Some(checker) = &self.heartbeat {
                if msg.cmd == checker.cmd() {
                    self.send_msg(&checker.ack_for(&msg)).await?;
                    continue;
                }
            }

            let task = self
                .task_handler
                .new_task(TaskOrigin::Session(self.clone()), msg);
            tokio::select! {
                _ = self.token.cancelled() => {
                    return Err(NetworkError::ConnectionClosed { conn_id: self.conn_id });
                }
                submitted = self.task_handler.submit(task) => submitted?,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Session for Connection {
    fn conn_id(&self) -> u64 {
        self.conn_id
    }

    fn is_alive(&self) -> bool {
        Connection::is_alive(self)
    }

    async fn send_msg(&self, msg: &Message) -> anyhow::Result<()> {
        Connection::send_msg(self, msg).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
