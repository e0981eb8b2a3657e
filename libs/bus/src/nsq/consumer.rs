//! Subscribing to one topic across nsqd nodes
//!
//! Each nsqd node gets one session task:
//!
//! 1. dial, `SUB <topic> <channel>`, wait for `OK`, `RDY <max_in_flight>`
//! 2. read frames; heartbeats are answered with `NOP`, messages go onto a
//!    bounded work queue shared by `concurrency` delivery workers
//! 3. workers run the [`DeliveryHandler`] and send back `FIN` (success) or
//!    `REQ` (failure, delayed by attempt count); a handler that needs longer
//!    than nsqd's message timeout can `TOUCH` through its delivery handle
//! 4. on stop the session sends `CLS`, stops queueing, lets workers finish what
//!    is queued and writes their `FIN`/`REQ` before closing
//!
//! Nodes found through nsqlookupd are re-polled every
//! `lookupd_poll_interval`; a lost node is picked up again by the next poll.
//! Statically configured nodes are redialed after `reconnect_backoff`.

use super::lookup::LookupClient;
use super::protocol::{Command, Frame, MessageId, NsqMessage, ProtocolError, CLOSE_WAIT, OK};
use super::{connect, NsqConfig};
use crate::broker::{Consumer, ConsumerOptions, Delivery, DeliveryHandler};
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use dashmap::DashSet;
use dispatch::{panic_message, DeliveryHandle, Touch};
use futures::{FutureExt, SinkExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct NsqConsumer {
    shared: Arc<Shared>,
    started: AtomicBool,
}

struct Shared {
    topic: String,
    options: ConsumerOptions,
    config: Arc<NsqConfig>,
    lookup: Option<Arc<LookupClient>>,
    token: CancellationToken,
    /// nsqd nodes with a live session task
    nodes: DashSet<String>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl NsqConsumer {
    pub fn new(
        topic: &str,
        options: ConsumerOptions,
        config: Arc<NsqConfig>,
        lookup: Option<Arc<LookupClient>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                topic: topic.to_string(),
                options,
                config,
                lookup,
                token: CancellationToken::new(),
                nodes: DashSet::new(),
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
            started: AtomicBool::new(false),
        }
    }

    /// nsqd nodes currently subscribed or being dialed
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<_> = self.shared.nodes.iter().map(|n| n.key().clone()).collect();
        nodes.sort();
        nodes
    }
}

#[async_trait]
impl Consumer for NsqConsumer {
    fn topic(&self) -> &str {
        &self.shared.topic
    }

    async fn start(&self, handler: Arc<dyn DeliveryHandler>) -> BusResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(BusError::configuration(
                format!("consumer for '{}' already started", self.shared.topic),
                None,
            ));
        }

        let shared = self.shared.clone();
        match shared.lookup.clone() {
            Some(lookup) => {
                let discovery = tokio::spawn(shared.clone().discover(lookup, handler));
                shared.tasks.lock().push(discovery);
            }
            None => {
                for addr in &shared.config.nsqd_addrs {
                    shared.spawn_node(addr.clone(), handler.clone(), true);
                }
            }
        }
        info!(
            topic = %shared.topic,
            channel = %shared.options.channel,
            concurrency = shared.options.concurrency,
            max_in_flight = shared.options.max_in_flight,
            "nsq consumer started"
        );
        Ok(())
    }

    async fn stop(&self) {
        self.shared.token.cancel();
        // node tasks may still be registering while discovery winds down
        loop {
            let tasks = std::mem::take(&mut *self.shared.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            for handle in tasks {
                if let Err(e) = handle.await {
                    error!(topic = %self.shared.topic, "consumer task exited abnormally: {}", e);
                }
            }
        }
        info!(topic = %self.shared.topic, "nsq consumer stopped");
    }
}

impl Shared {
    fn spawn_node(self: &Arc<Self>, addr: String, handler: Arc<dyn DeliveryHandler>, redial: bool) {
        if self.token.is_cancelled() || !self.nodes.insert(addr.clone()) {
            return;
        }
        let handle = tokio::spawn(self.clone().run_node(addr, handler, redial));
        self.tasks.lock().push(handle);
    }

    async fn discover(self: Arc<Self>, lookup: Arc<LookupClient>, handler: Arc<dyn DeliveryHandler>) {
        let mut ticker = tokio::time::interval(self.config.lookupd_poll_interval);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match lookup.lookup(&self.topic).await {
                Ok(addrs) => {
                    for addr in addrs {
                        self.spawn_node(addr, handler.clone(), false);
                    }
                }
                Err(e) => warn!(topic = %self.topic, "nsqlookupd poll failed: {}", e),
            }
        }
        debug!(topic = %self.topic, "discovery stopped");
    }

    async fn run_node(self: Arc<Self>, addr: String, handler: Arc<dyn DeliveryHandler>, redial: bool) {
        loop {
            match self.session(&addr, &handler).await {
                Ok(()) => debug!(topic = %self.topic, nsqd = %addr, "session closed"),
                Err(e) => warn!(topic = %self.topic, nsqd = %addr, "session failed: {}", e),
            }
            if !redial || self.token.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
        }
        self.nodes.remove(&addr);
    }

    async fn session(&self, addr: &str, handler: &Arc<dyn DeliveryHandler>) -> BusResult<()> {
        let framed = connect(addr, &self.config).await?;
        let (mut sink, mut stream) = framed.split();
        let proto = |e: ProtocolError| BusError::protocol(addr, e);

        sink.send(Command::Sub {
            topic: self.topic.clone(),
            channel: self.options.channel.clone(),
        })
        .await
        .map_err(proto)?;
        loop {
            match stream.next().await {
                Some(Ok(frame)) if frame.is_heartbeat() => {
                    sink.send(Command::Nop).await.map_err(proto)?;
                }
                Some(Ok(Frame::Response(data))) if data.as_ref() == OK => break,
                Some(Ok(Frame::Error(data))) => {
                    return Err(BusError::Nsq {
                        addr: addr.to_string(),
                        command: "SUB",
                        message: String::from_utf8_lossy(&data).into_owned(),
                    })
                }
                Some(Ok(other)) => {
                    return Err(proto(ProtocolError::UnexpectedResponse(format!("{other:?}"))))
                }
                Some(Err(e)) => return Err(proto(e)),
                None => return Err(proto(ProtocolError::Closed)),
            }
        }

        let in_flight = self.options.max_in_flight.max(1);
        sink.send(Command::Rdy(u32::try_from(in_flight).unwrap_or(u32::MAX)))
            .await
            .map_err(proto)?;
        info!(topic = %self.topic, channel = %self.options.channel, nsqd = %addr, "subscribed");

        let (work_tx, work_rx) = mpsc::channel::<NsqMessage>(in_flight);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        let workers: Vec<_> = (0..self.options.concurrency.max(1))
            .map(|worker_id| {
                let worker = DeliveryWorker {
                    id: worker_id,
                    topic: self.topic.clone(),
                    options: self.options.clone(),
                    work: work_rx.clone(),
                    commands: cmd_tx.clone(),
                    handler: handler.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        drop(cmd_tx);

        let mut work_tx = Some(work_tx);
        let mut reading = true;
        let mut failure = None;

        loop {
            tokio::select! {
                _ = self.token.cancelled(), if work_tx.is_some() => {
                    work_tx = None;
                    if let Err(e) = sink.send(Command::Cls).await {
                        debug!(nsqd = %addr, "CLS failed: {}", e);
                    }
                }
                frame = stream.next(), if reading => match frame {
                    Some(Ok(frame)) if frame.is_heartbeat() => {
                        if let Err(e) = sink.send(Command::Nop).await {
                            warn!(nsqd = %addr, "NOP failed: {}", e);
                        }
                    }
                    Some(Ok(Frame::Message(msg))) => match &work_tx {
                        Some(tx) => {
                            if let Err(mpsc::error::SendError(msg)) = tx.send(msg).await {
                                warn!(nsqd = %addr, id = %msg.id_str(), "work queue closed");
                            }
                        }
                        // closing: hand it straight back
                        None => {
                            let _ = sink
                                .send(Command::Req { id: msg.id, delay: Duration::ZERO })
                                .await;
                        }
                    },
                    Some(Ok(Frame::Response(data))) if data.as_ref() == CLOSE_WAIT => {
                        debug!(nsqd = %addr, "nsqd acknowledged close");
                    }
                    Some(Ok(Frame::Response(data))) => {
                        debug!(nsqd = %addr, "response: {}", String::from_utf8_lossy(&data));
                    }
                    Some(Ok(Frame::Error(data))) => {
                        warn!(nsqd = %addr, "nsqd error: {}", String::from_utf8_lossy(&data));
                    }
                    Some(Err(e)) => {
                        reading = false;
                        work_tx = None;
                        failure = Some(proto(e));
                    }
                    None => {
                        reading = false;
                        work_tx = None;
                        if !self.token.is_cancelled() {
                            failure = Some(proto(ProtocolError::Closed));
                        }
                    }
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        let name = cmd.name();
                        if let Err(e) = sink.send(cmd).await {
                            warn!(nsqd = %addr, command = name, "write failed: {}", e);
                        }
                    }
                    // every worker finished
                    None => break,
                },
            }
        }

        for handle in workers {
            if let Err(e) = handle.await {
                error!(topic = %self.topic, "delivery worker exited abnormally: {}", e);
            }
        }
        let _ = sink.close().await;
        failure.map_or(Ok(()), Err)
    }
}

struct DeliveryWorker {
    id: usize,
    topic: String,
    options: ConsumerOptions,
    work: Arc<Mutex<mpsc::Receiver<NsqMessage>>>,
    commands: mpsc::UnboundedSender<Command>,
    handler: Arc<dyn DeliveryHandler>,
}

impl DeliveryWorker {
    async fn run(self) {
        loop {
            let next = { self.work.lock().await.recv().await };
            let Some(msg) = next else { break };
            let cmd = self.deliver(msg).await;
            if self.commands.send(cmd).is_err() {
                break;
            }
        }
        debug!(topic = %self.topic, worker_id = self.id, "delivery worker exited");
    }

    async fn deliver(&self, msg: NsqMessage) -> Command {
        let delivery = Delivery {
            handle: DeliveryHandle {
                id: msg.id_str(),
                attempts: msg.attempts,
                timestamp: msg.timestamp,
                topic: self.topic.clone(),
                toucher: Some(Arc::new(SessionToucher {
                    id: msg.id,
                    commands: self.commands.downgrade(),
                })),
            },
            body: msg.body.clone(),
        };
        let requeue = Command::Req {
            id: msg.id,
            delay: self.options.requeue_delay_for(msg.attempts),
        };

        match AssertUnwindSafe(self.handler.handle_delivery(delivery))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Command::Fin(msg.id),
            Ok(Err(e)) => {
                warn!(
                    topic = %self.topic,
                    id = %msg.id_str(),
                    attempts = msg.attempts,
                    "delivery failed, requeueing: {}",
                    e
                );
                requeue
            }
            Err(payload) => {
                error!(
                    topic = %self.topic,
                    id = %msg.id_str(),
                    "delivery handler panicked: {}",
                    panic_message(payload.as_ref())
                );
                requeue
            }
        }
    }
}

/// Writes `TOUCH` on the session the message arrived on. Holds the command
/// channel weakly so a retained handle never keeps a session open.
struct SessionToucher {
    id: MessageId,
    commands: mpsc::WeakUnboundedSender<Command>,
}

#[async_trait]
impl Touch for SessionToucher {
    async fn touch(&self) -> anyhow::Result<()> {
        let commands = self.commands.upgrade().ok_or(BusError::Stopped)?;
        commands
            .send(Command::Touch(self.id))
            .map_err(|_| BusError::Stopped)?;
        Ok(())
    }
}

impl std::fmt::Debug for NsqConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NsqConsumer")
            .field("topic", &self.shared.topic)
            .field("channel", &self.shared.options.channel)
            .field("nodes", &self.nodes())
            .finish()
    }
}
