//! Socket-serving side
//!
//! A [`Server`] listens on one address (raw TCP or WebSocket), assigns each
//! accepted socket a process-unique id, registers it with its
//! [`ConnManager`] and runs it until it closes. All connections share one
//! [`TaskHandler`].

use crate::connection::{ConnHook, Connection, ConnectionOptions, DEFAULT_READ_BUFFER_SIZE};
use crate::error::{NetworkError, NetworkResult};
use crate::heartbeat::HeartbeatChecker;
use crate::manager::ConnManager;
use crate::transports::Transport;
use codec::{BinaryDataPack, DataPack, FrameDecoder};
use dispatch::TaskHandler;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Next process-unique connection id, starting at 1
pub fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Builds a fresh decoder for each accepted stream connection
pub type FrameDecoderFactory = Arc<dyn Fn() -> Box<dyn FrameDecoder> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Tcp,
    WebSocket,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub kind: ServerKind,
    pub bind_addr: SocketAddr,
    /// 0 means unlimited
    pub max_conn: usize,
    pub read_buffer_size: usize,
    pub conn_version: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "conduit".to_string(),
            kind: ServerKind::Tcp,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_conn: 0,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            conn_version: 0,
        }
    }
}

pub struct Server {
    config: ServerConfig,
    task_handler: Arc<TaskHandler>,
    manager: Arc<ConnManager>,
    datapack: Arc<dyn DataPack>,
    decoder_factory: Option<FrameDecoderFactory>,
    heartbeat: Option<HeartbeatChecker>,
    on_conn_start: Option<ConnHook>,
    on_conn_stop: Option<ConnHook>,
    token: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(config: ServerConfig, task_handler: Arc<TaskHandler>) -> Self {
        Self {
            config,
            task_handler,
            manager: Arc::new(ConnManager::new()),
            datapack: Arc::new(BinaryDataPack::new()),
            decoder_factory: None,
            heartbeat: None,
            on_conn_start: None,
            on_conn_stop: None,
            token: CancellationToken::new(),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    pub fn with_datapack(mut self, datapack: Arc<dyn DataPack>) -> Self {
        self.datapack = datapack;
        self
    }

    pub fn with_frame_decoder<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn FrameDecoder> + Send + Sync + 'static,
    {
        self.decoder_factory = Some(Arc::new(factory));
        self
    }

    pub fn with_heartbeat(mut self, checker: HeartbeatChecker) -> Self {
        self.heartbeat = Some(checker);
        self
    }

    pub fn with_on_conn_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_conn_start = Some(Arc::new(hook));
        self
    }

    pub fn with_on_conn_stop<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_conn_stop = Some(Arc::new(hook));
        self
    }

    pub fn with_manager(mut self, manager: Arc<ConnManager>) -> Self {
        self.manager = manager;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ConnManager> {
        &self.manager
    }

    /// Bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bind and spawn the accept loop; returns the bound address
    pub async fn start(self: &Arc<Self>) -> NetworkResult<SocketAddr> {
        if self.token.is_cancelled() {
            return Err(NetworkError::configuration(
                "server was stopped and cannot be restarted",
                None,
            ));
        }
        if self.config.read_buffer_size == 0 {
            return Err(NetworkError::configuration(
                "read buffer size must be non-zero",
                Some("read_buffer_size"),
            ));
        }

        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| NetworkError::io(format!("Failed to bind {}", self.config.bind_addr), e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| NetworkError::io("Failed to read listener address", e))?;
        *self.local_addr.lock() = Some(addr);

        info!(
            server = %self.config.name,
            kind = ?self.config.kind,
            %addr,
            max_conn = self.config.max_conn,
            "server listening"
        );

        let server = self.clone();
        let handle = tokio::spawn(async move { server.accept_loop(listener).await });
        *self.accept_task.lock() = Some(handle);
        Ok(addr)
    }

    /// [`Server::start`], then wait until [`Server::stop`]
    pub async fn serve(self: &Arc<Self>) -> NetworkResult<()> {
        self.start().await?;
        self.token.cancelled().await;
        Ok(())
    }

    /// Stop accepting and stop every live connection
    pub async fn stop(&self) {
        self.token.cancel();
        self.manager.clear_all();
        let handle = self.accept_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(server = %self.config.name, "server stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(server = %self.config.name, "accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            if self.config.max_conn > 0 && self.manager.count() >= self.config.max_conn {
                warn!(
                    server = %self.config.name,
                    %remote,
                    max_conn = self.config.max_conn,
                    "too many connections, rejecting"
                );
                drop(stream);
                continue;
            }

            let conn_id = next_conn_id();
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_stream(conn_id, stream).await {
                    error!(conn_id, %remote, "connection setup failed: {}", e);
                }
            });
        }
        debug!(server = %self.config.name, "accept loop exited");
    }

    async fn serve_stream(&self, conn_id: u64, stream: TcpStream) -> NetworkResult<()> {
        let transport = match self.config.kind {
            ServerKind::Tcp => Transport::tcp(stream, self.config.read_buffer_size)?,
            ServerKind::WebSocket => Transport::accept_websocket(stream).await?,
        };
        // message transports deliver whole frames
        let frame_decoder = match self.config.kind {
            ServerKind::Tcp => self.decoder_factory.as_ref().map(|factory| factory()),
            ServerKind::WebSocket => None,
        };

        let options = ConnectionOptions {
            version: self.config.conn_version,
            datapack: self.datapack.clone(),
            frame_decoder,
            heartbeat: self.heartbeat.clone(),
            on_start: self.on_conn_start.clone(),
            on_stop: self.on_conn_stop.clone(),
            manager: Some(self.manager.clone()),
            parent_token: Some(self.token.clone()),
        };
        let conn = Connection::new(conn_id, transport, self.task_handler.clone(), options);
        self.manager.add(conn.clone());
        conn.start().await;
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr())
            .field("connections", &self.manager.count())
            .finish()
    }
}
