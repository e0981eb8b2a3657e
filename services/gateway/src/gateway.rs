//! Process wiring: config to servers, worker pool and bridge

use crate::routers::{
    BroadcastRouter, EchoRouter, ForwardRouter, BROADCAST_MSG_ID, ECHO_MSG_ID, FORWARD_MSG_ID,
};
use anyhow::{Context, Result};
use bus::{Bridge, BridgeConfig, Broker, ConsumerOptions, MemoryBroker, NsqBroker, NsqConfig};
use codec::{FrameDecoder, LengthFieldConfig, LengthFieldFrameDecoder, MessageFrameDecoder};
use config::{BusConfig, ConduitConfig, FrameDecoderKind};
use dispatch::{TaskHandler, TaskHandlerConfig};
use network::{ConnManager, HeartbeatChecker, Server, ServerConfig, ServerKind};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// A running gateway
pub struct Gateway {
    handler: Arc<TaskHandler>,
    bridge: Arc<Bridge>,
    tcp: Arc<Server>,
    ws: Option<Arc<Server>>,
}

/// NSQ when the bus is enabled, otherwise an in-process broker
pub fn broker_for(bus: &BusConfig) -> Result<Arc<dyn Broker>> {
    if !bus.enabled {
        info!("bus disabled, forwarding through the in-process broker");
        return Ok(Arc::new(MemoryBroker::default()));
    }
    let broker = NsqBroker::new(NsqConfig {
        nsqd_addrs: bus.nsqd_addrs.clone(),
        lookupd_addrs: bus.lookupd_addrs.clone(),
        lookupd_poll_interval: bus.lookupd_poll_interval(),
        ..NsqConfig::default()
    })
    .context("Failed to create NSQ broker")?;
    Ok(Arc::new(broker))
}

fn bridge_config(bus: &BusConfig) -> BridgeConfig {
    BridgeConfig {
        consumer: ConsumerOptions {
            channel: bus.channel.clone(),
            concurrency: bus.concurrency,
            max_in_flight: bus.max_in_flight,
            requeue_delay: bus.requeue_delay(),
        },
        buffer_capacity: bus.buffer_capacity,
        enqueue_timeout: bus.enqueue_timeout(),
        drain_max_attempts: bus.drain_max_attempts,
        ..BridgeConfig::default()
    }
}

impl Gateway {
    pub async fn start(config: &ConduitConfig) -> Result<Self> {
        config.validate()?;
        let broker = broker_for(&config.bus)?;
        Self::start_with_broker(config, broker).await
    }

    /// Bring everything up; the bridge is built before any socket is accepted
    pub async fn start_with_broker(config: &ConduitConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        config.validate()?;
        let server = &config.server;
        let tcp_manager = Arc::new(ConnManager::new());
        let ws_manager = Arc::new(ConnManager::new());

        let mut bridge = Bridge::builder(bridge_config(&config.bus), broker);
        bridge.add_router(
            &config.bus.forward_topic,
            BROADCAST_MSG_ID,
            Arc::new(BroadcastRouter::new(vec![
                tcp_manager.clone(),
                ws_manager.clone(),
            ])),
        )?;
        let bridge = bridge.build()?;

        let mut handler = TaskHandler::builder(TaskHandlerConfig {
            worker_pool_size: server.worker_pool_size,
            max_task_queue_len: server.max_task_queue_len,
            task_pool_capacity: server.task_pool_capacity,
        });
        handler.add_router(ECHO_MSG_ID, Arc::new(EchoRouter))?;
        handler.add_router(
            FORWARD_MSG_ID,
            Arc::new(ForwardRouter::new(bridge.clone(), &config.bus.forward_topic)),
        )?;
        let handler = handler.start()?;

        let listening = async {
            bridge.start().await?;

            let tcp = Arc::new(
                with_framing(
                    Self::server(config, ServerKind::Tcp, server.tcp_socket_addr()?, &handler)?,
                    config,
                )?
                .with_manager(tcp_manager),
            );
            tcp.start().await?;

            let ws = match server.ws_socket_addr()? {
                Some(addr) => {
                    let ws = Arc::new(
                        Self::server(config, ServerKind::WebSocket, addr, &handler)?
                            .with_manager(ws_manager),
                    );
                    if let Err(e) = ws.start().await {
                        tcp.stop().await;
                        return Err(e.into());
                    }
                    Some(ws)
                }
                None => None,
            };
            Ok::<_, anyhow::Error>((tcp, ws))
        };
        let (tcp, ws) = match listening.await {
            Ok(servers) => servers,
            Err(e) => {
                handler.stop().await;
                bridge.stop().await;
                return Err(e);
            }
        };

        info!(
            tcp = ?tcp.local_addr(),
            ws = ?ws.as_ref().and_then(|s| s.local_addr()),
            bus = config.bus.enabled,
            "gateway started"
        );
        Ok(Self {
            handler,
            bridge,
            tcp,
            ws,
        })
    }

    fn server(
        config: &ConduitConfig,
        kind: ServerKind,
        bind_addr: SocketAddr,
        handler: &Arc<TaskHandler>,
    ) -> Result<Server> {
        let suffix = match kind {
            ServerKind::Tcp => "tcp",
            ServerKind::WebSocket => "ws",
        };
        let server_config = ServerConfig {
            name: format!("{}-{}", config.server.name, suffix),
            kind,
            bind_addr,
            max_conn: config.server.max_conn,
            read_buffer_size: config.server.read_buffer_size,
            conn_version: 0,
        };
        let server = Server::new(server_config, handler.clone());
        Ok(match config.server.heartbeat_interval() {
            Some(interval) => server.with_heartbeat(
                HeartbeatChecker::new(interval, config.server.heartbeat_cmd)
                    .context("Invalid heartbeat settings")?,
            ),
            None => server,
        })
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws.as_ref().and_then(|ws| ws.local_addr())
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn connections(&self) -> usize {
        self.tcp.manager().count() + self.ws.as_ref().map_or(0, |ws| ws.manager().count())
    }

    /// Servers first, then the worker pool, then the bridge
    pub async fn shutdown(self) {
        info!("gateway shutting down");
        self.tcp.stop().await;
        if let Some(ws) = &self.ws {
            ws.stop().await;
        }
        self.handler.stop().await;
        self.bridge.stop().await;
        info!("gateway stopped");
    }
}

fn with_framing(server: Server, config: &ConduitConfig) -> Result<Server> {
    let max_frame_len = config.server.max_frame_len;
    Ok(match config.server.frame_decoder {
        FrameDecoderKind::None => server,
        FrameDecoderKind::Message => {
            let prototype = MessageFrameDecoder::new(max_frame_len);
            server.with_frame_decoder(move || Box::new(prototype.clone()) as Box<dyn FrameDecoder>)
        }
        FrameDecoderKind::LengthField => {
            let prototype =
                LengthFieldFrameDecoder::new(LengthFieldConfig::u32_prefixed(max_frame_len))
                    .context("Invalid length-field framing")?;
            server.with_frame_decoder(move || Box::new(prototype.clone()) as Box<dyn FrameDecoder>)
        }
    })
}
