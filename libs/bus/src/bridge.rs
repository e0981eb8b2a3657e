//! # Broker Bridge
//!
//! Connects the router model to a message broker in both directions.
//!
//! ## Inbound
//!
//! One consumer per distinct topic registered through
//! [`BridgeBuilder::add_router`]. Each delivery is decoded, wrapped in a pooled
//! [`Task`](dispatch::Task) carrying the broker's delivery handle, and run
//! against the router table on the consumer's own delivery task. Nothing goes
//! through the socket worker pool.
//!
//! | outcome                        | reported to broker |
//! |--------------------------------|--------------------|
//! | handled                        | ack                |
//! | body does not decode           | ack, logged        |
//! | no router for the message id   | failure            |
//! | router error or panic          | failure            |
//!
//! ## Outbound
//!
//! [`Bridge::publish`] queues a pooled [`Payload`] on a bounded buffer and
//! gives up with [`BusError::PublishTimeout`] if no slot frees up within
//! `enqueue_timeout`. The buffer and its writers (one per producer) are created
//! on the first buffered publish. A writer whose publish fails puts the payload
//! back on the buffer; if that also times out it keeps the payload and retries
//! it itself after `retry_backoff`.
//!
//! ## Shutdown
//!
//! [`Bridge::stop`] stops consumers, then cancels the writers, waits for them
//! to drain the buffer, closes it, sweeps anything that raced the stop, and
//! only then stops the producers. The buffer is opened by `stop` if no publish
//! has opened it yet, so it is always closed once the bridge has stopped.

use crate::broker::{Broker, Consumer, ConsumerOptions, Delivery, DeliveryHandler, Producer};
use crate::error::{BusError, BusResult};
use crate::payload::{Payload, PayloadPool, PayloadPoolExt};
use async_trait::async_trait;
use bytes::Bytes;
use codec::{BinaryDataPack, DataPack, Message};
use dispatch::{MsgId, Router, RouterTable, TaskOrigin, TaskPool};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default wait for a free buffer slot
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub consumer: ConsumerOptions,
    /// Slots in the buffered-publish queue
    pub buffer_capacity: usize,
    pub enqueue_timeout: Duration,
    /// Pause between in-place retries of a failed payload
    pub retry_backoff: Duration,
    /// Retries per payload once shutdown begins; `None` retries until it lands
    pub drain_max_attempts: Option<u32>,
    pub payload_pool_capacity: usize,
    pub task_pool_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            consumer: ConsumerOptions::default(),
            buffer_capacity: 1024,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
            retry_backoff: Duration::from_millis(100),
            drain_max_attempts: None,
            payload_pool_capacity: 1024,
            task_pool_capacity: 256,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> BusResult<()> {
        if self.buffer_capacity == 0 {
            return Err(BusError::configuration(
                "buffer capacity must be at least 1",
                Some("buffer_capacity"),
            ));
        }
        if self.consumer.channel.is_empty() {
            return Err(BusError::configuration(
                "consumer channel must not be empty",
                Some("channel"),
            ));
        }
        if self.consumer.concurrency == 0 {
            return Err(BusError::configuration(
                "consumer concurrency must be at least 1",
                Some("concurrency"),
            ));
        }
        if self.consumer.max_in_flight == 0 {
            return Err(BusError::configuration(
                "max in flight must be at least 1",
                Some("max_in_flight"),
            ));
        }
        if self.drain_max_attempts == Some(0) {
            return Err(BusError::configuration(
                "drain_max_attempts must be at least 1 when set",
                Some("drain_max_attempts"),
            ));
        }
        Ok(())
    }
}

/// Collects routers and topics before the bridge is built
pub struct BridgeBuilder {
    config: BridgeConfig,
    broker: Arc<dyn Broker>,
    datapack: Arc<dyn DataPack>,
    routers: RouterTable,
    topics: Vec<String>,
}

impl BridgeBuilder {
    pub fn new(config: BridgeConfig, broker: Arc<dyn Broker>) -> Self {
        Self {
            config,
            broker,
            datapack: Arc::new(BinaryDataPack::new()),
            routers: RouterTable::new(),
            topics: Vec::new(),
        }
    }

    pub fn with_datapack(mut self, datapack: Arc<dyn DataPack>) -> Self {
        self.datapack = datapack;
        self
    }

    /// Route `msg_id` deliveries on `topic` to `router`
    ///
    /// Message ids are unique across all topics. The first router on a topic
    /// creates that topic's consumer.
    pub fn add_router(
        &mut self,
        topic: &str,
        msg_id: MsgId,
        router: Arc<dyn Router>,
    ) -> BusResult<()> {
        if topic.is_empty() {
            return Err(BusError::EmptyTopic);
        }
        self.routers.add(msg_id, router)?;
        if self.topics.iter().any(|t| t == topic) {
            debug!(topic, msg_id, "consumer already planned for topic");
        } else {
            self.topics.push(topic.to_string());
            info!(topic, msg_id, "consumer planned for topic");
        }
        Ok(())
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Create the producers and one consumer per topic
    pub fn build(self) -> BusResult<Arc<Bridge>> {
        self.config.validate()?;

        let producers = self.broker.producers()?;
        let consumers = self
            .topics
            .iter()
            .map(|topic| self.broker.consumer(topic, &self.config.consumer))
            .collect::<BusResult<Vec<_>>>()?;

        info!(
            producers = producers.len(),
            consumers = consumers.len(),
            routers = self.routers.len(),
            channel = %self.config.consumer.channel,
            "bridge built"
        );

        Ok(Arc::new(Bridge {
            inbound: Arc::new(Inbound {
                routers: self.routers,
                datapack: self.datapack.clone(),
                tasks: TaskPool::new(self.config.task_pool_capacity),
                accepting: AtomicBool::new(true),
            }),
            payloads: Arc::new(PayloadPool::new(self.config.payload_pool_capacity)),
            datapack: self.datapack,
            config: self.config,
            consumers,
            producers,
            outbound: OnceCell::new(),
            writer_token: CancellationToken::new(),
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }
}

pub struct Bridge {
    config: BridgeConfig,
    datapack: Arc<dyn DataPack>,
    inbound: Arc<Inbound>,
    consumers: Vec<Arc<dyn Consumer>>,
    producers: Vec<Arc<dyn Producer>>,
    payloads: Arc<PayloadPool>,
    /// Created exactly once, on the first buffered publish
    outbound: OnceCell<Arc<Outbound>>,
    writer_token: CancellationToken,
    token: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Bridge {
    pub fn builder(config: BridgeConfig, broker: Arc<dyn Broker>) -> BridgeBuilder {
        BridgeBuilder::new(config, broker)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn routers(&self) -> &RouterTable {
        &self.inbound.routers
    }

    pub fn consumer_topics(&self) -> Vec<&str> {
        self.consumers.iter().map(|c| c.topic()).collect()
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn payload_pool(&self) -> &Arc<PayloadPool> {
        &self.payloads
    }

    /// Whether the buffered-publish writers have been started
    pub fn is_writing(&self) -> bool {
        self.outbound.get().is_some()
    }

    /// Payloads waiting in the buffer
    pub fn buffered(&self) -> usize {
        self.outbound
            .get()
            .map_or(0, |o| self.config.buffer_capacity - o.sender.capacity())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Start every consumer
    pub async fn start(&self) -> BusResult<()> {
        if self.is_stopped() {
            return Err(BusError::Stopped);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("bridge already started");
            return Ok(());
        }
        let handler: Arc<dyn DeliveryHandler> = self.inbound.clone();
        for consumer in &self.consumers {
            consumer.start(handler.clone()).await?;
        }
        info!(consumers = self.consumers.len(), "bridge started");
        Ok(())
    }

    /// [`Bridge::start`], then wait until [`Bridge::stop`]
    pub async fn serve(&self) -> BusResult<()> {
        self.start().await?;
        self.token.cancelled().await;
        Ok(())
    }

    /// Buffered publish; fails if no buffer slot frees up within `enqueue_timeout`
    pub async fn publish(&self, topic: &str, data: impl Into<Bytes>) -> BusResult<()> {
        let data = data.into();
        self.check_publish(topic, &data)?;
        let outbound = self.outbound()?;

        let payload = self.payloads.payload(topic, data);
        match outbound
            .sender
            .send_timeout(payload, self.config.enqueue_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(payload)) => {
                self.payloads.release(payload);
                Err(BusError::PublishTimeout {
                    topic: topic.to_string(),
                    timeout: self.config.enqueue_timeout,
                })
            }
            Err(SendTimeoutError::Closed(payload)) => {
                self.payloads.release(payload);
                Err(BusError::Stopped)
            }
        }
    }

    /// Publish synchronously on the first producer, bypassing the buffer
    pub async fn publish_direct(&self, topic: &str, data: impl Into<Bytes>) -> BusResult<()> {
        let data = data.into();
        self.check_publish(topic, &data)?;
        let producer = self.producers.first().ok_or(BusError::NoProducers)?;
        producer.publish(topic, data).await
    }

    /// Pack `msg` and publish it buffered
    pub async fn publish_msg(&self, topic: &str, msg: &Message) -> BusResult<()> {
        let data = self.datapack.pack(msg)?;
        self.publish(topic, data).await
    }

    /// Pack `msg` and publish it on the first producer
    pub async fn publish_msg_direct(&self, topic: &str, msg: &Message) -> BusResult<()> {
        let data = self.datapack.pack(msg)?;
        self.publish_direct(topic, data).await
    }

    /// Stop consumers, drain the buffer, then stop producers
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inbound.accepting.store(false, Ordering::Release);
        for consumer in &self.consumers {
            consumer.stop().await;
        }
        debug!("bridge consumers stopped");

        self.writer_token.cancel();
        // a publish that passed the stop check may still be about to open the
        // buffer; open it here so that publish lands on the buffer swept below
        let outbound = (!self.producers.is_empty())
            .then(|| self.outbound.get_or_init(|| self.spawn_writers()));
        if let Some(outbound) = outbound {
            let writers = std::mem::take(&mut *outbound.writers.lock());
            for handle in writers {
                if let Err(e) = handle.await {
                    error!("bridge writer exited abnormally: {}", e);
                }
            }

            // publishes that passed the stop check while writers were draining
            outbound.receiver.lock().await.close();
            if let Some(producer) = self.producers.first() {
                let sweeper =
                    self.writer(self.producers.len(), producer.clone(), outbound.clone());
                sweeper.drain().await;
            }
        }

        for producer in &self.producers {
            producer.stop().await;
        }
        self.token.cancel();
        info!("bridge stopped");
    }

    fn check_publish(&self, topic: &str, data: &Bytes) -> BusResult<()> {
        if self.is_stopped() {
            return Err(BusError::Stopped);
        }
        if topic.is_empty() {
            return Err(BusError::EmptyTopic);
        }
        if data.is_empty() {
            return Err(BusError::EmptyPayload {
                topic: topic.to_string(),
            });
        }
        Ok(())
    }

    fn outbound(&self) -> BusResult<&Arc<Outbound>> {
        if self.producers.is_empty() {
            return Err(BusError::NoProducers);
        }
        Ok(self.outbound.get_or_init(|| self.spawn_writers()))
    }

    fn spawn_writers(&self) -> Arc<Outbound> {
        let (sender, receiver) = mpsc::channel(self.config.buffer_capacity);
        let outbound = Arc::new(Outbound {
            sender,
            receiver: Mutex::new(receiver),
            writers: parking_lot::Mutex::new(Vec::new()),
        });

        let handles = self
            .producers
            .iter()
            .enumerate()
            .map(|(id, producer)| {
                let writer = self.writer(id, producer.clone(), outbound.clone());
                tokio::spawn(writer.run())
            })
            .collect();
        *outbound.writers.lock() = handles;

        info!(
            writers = self.producers.len(),
            capacity = self.config.buffer_capacity,
            "bridge writers started"
        );
        outbound
    }

    fn writer(&self, id: usize, producer: Arc<dyn Producer>, outbound: Arc<Outbound>) -> Writer {
        Writer {
            id,
            producer,
            outbound,
            payloads: self.payloads.clone(),
            token: self.writer_token.clone(),
            enqueue_timeout: self.config.enqueue_timeout,
            retry_backoff: self.config.retry_backoff,
            drain_max_attempts: self.config.drain_max_attempts,
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("consumers", &self.consumer_topics())
            .field("producers", &self.producers.len())
            .field("writing", &self.is_writing())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Decodes deliveries and runs them against the router table
struct Inbound {
    routers: RouterTable,
    datapack: Arc<dyn DataPack>,
    tasks: TaskPool,
    accepting: AtomicBool,
}

#[async_trait]
impl DeliveryHandler for Inbound {
    async fn handle_delivery(&self, delivery: Delivery) -> BusResult<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(BusError::Stopped);
        }
        let Delivery { handle, body } = delivery;

        // a poison message would come back forever; ack it
        let message = match self.datapack.unpack(&body) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    topic = %handle.topic,
                    id = %handle.id,
                    bytes = body.len(),
                    "dropping undecodable delivery: {}",
                    e
                );
                return Ok(());
            }
        };

        let topic = handle.topic.clone();
        let mut task = self.tasks.task(TaskOrigin::Broker(handle), message);
        let msg_id = task.msg_id();
        let result = match self.routers.bind(&mut task) {
            Ok(()) => task.call_guarded().await,
            Err(e) => Err(e),
        };
        self.tasks.release(task);

        result.map_err(|e| {
            warn!(%topic, msg_id, "delivery not handled: {}", e);
            BusError::from(e)
        })
    }
}

struct Outbound {
    sender: mpsc::Sender<Payload>,
    receiver: Mutex<mpsc::Receiver<Payload>>,
    writers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Moves buffered payloads to one producer
struct Writer {
    id: usize,
    producer: Arc<dyn Producer>,
    outbound: Arc<Outbound>,
    payloads: Arc<PayloadPool>,
    token: CancellationToken,
    enqueue_timeout: Duration,
    retry_backoff: Duration,
    drain_max_attempts: Option<u32>,
}

impl Writer {
    async fn run(self) {
        info!(writer_id = self.id, producer = self.producer.addr(), "bridge writer running");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                payload = async { self.outbound.receiver.lock().await.recv().await } => payload,
            };
            match next {
                Some(payload) => self.deliver(payload).await,
                None => break,
            }
        }
        self.drain().await;
        info!(writer_id = self.id, "bridge writer exited");
    }

    async fn deliver(&self, payload: Payload) {
        let err = match self.producer.publish(&payload.topic, payload.data.clone()).await {
            Ok(()) => {
                self.payloads.release(payload);
                return;
            }
            Err(e) => e,
        };
        warn!(
            writer_id = self.id,
            topic = %payload.topic,
            "publish failed, requeueing: {}",
            err
        );

        if self.token.is_cancelled() {
            self.retry(payload).await;
            return;
        }
        match self
            .outbound
            .sender
            .send_timeout(payload, self.enqueue_timeout)
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(payload)) | Err(SendTimeoutError::Closed(payload)) => {
                warn!(
                    writer_id = self.id,
                    topic = %payload.topic,
                    "requeue failed, retrying in place"
                );
                self.retry(payload).await;
            }
        }
    }

    /// Publish on this writer's producer until it lands; once shutdown has
    /// begun, give up after `drain_max_attempts`
    async fn retry(&self, payload: Payload) {
        let mut attempts: u32 = 1;
        loop {
            if self.token.is_cancelled()
                && self.drain_max_attempts.is_some_and(|max| attempts >= max)
            {
                error!(
                    writer_id = self.id,
                    topic = %payload.topic,
                    bytes = payload.data.len(),
                    attempts,
                    "giving up on payload during shutdown"
                );
                self.payloads.release(payload);
                return;
            }
            tokio::time::sleep(self.retry_backoff).await;
            attempts += 1;
            match self.producer.publish(&payload.topic, payload.data.clone()).await {
                Ok(()) => {
                    debug!(writer_id = self.id, topic = %payload.topic, attempts, "retry published");
                    self.payloads.release(payload);
                    return;
                }
                Err(e) => warn!(
                    writer_id = self.id,
                    topic = %payload.topic,
                    attempts,
                    "retry failed: {}",
                    e
                ),
            }
        }
    }

    /// Publish whatever is left in the buffer without waiting for more
    async fn drain(&self) {
        let mut drained = 0usize;
        loop {
            let next = self.outbound.receiver.lock().await.try_recv();
            let Ok(payload) = next else { break };
            drained += 1;
            match self.producer.publish(&payload.topic, payload.data.clone()).await {
                Ok(()) => self.payloads.release(payload),
                Err(e) => {
                    warn!(writer_id = self.id, topic = %payload.topic, "drain publish failed: {}", e);
                    self.retry(payload).await;
                }
            }
        }
        if drained > 0 {
            info!(writer_id = self.id, drained, "drained buffered payloads");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    fn idle_bridge() -> Arc<Bridge> {
        Bridge::builder(BridgeConfig::default(), Arc::new(MemoryBroker::default()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_stop_closes_buffer_never_opened_by_publish() {
        let bridge = idle_bridge();
        assert!(!bridge.is_writing());

        bridge.stop().await;

        // a publish that passed the stop check before `stop` ran sees the
        // same, already closed buffer
        let outbound = bridge.outbound().unwrap();
        let late = bridge.payloads.payload("orders", Bytes::from_static(b"late"));
        assert!(outbound.sender.try_send(late).is_err());
        assert_eq!(bridge.buffered(), 0);
    }

    #[tokio::test]
    async fn test_publish_racing_stop_is_published_or_refused() {
        let broker = MemoryBroker::default();
        let bridge = Bridge::builder(BridgeConfig::default(), Arc::new(broker.clone()))
            .build()
            .unwrap();

        let publisher = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.publish("orders", "racing").await })
        };
        bridge.stop().await;

        match publisher.await.unwrap() {
            Ok(()) => assert_eq!(broker.published(), 1),
            Err(e) => {
                assert!(matches!(e, BusError::Stopped));
                assert_eq!(broker.published(), 0);
            }
        }
    }
}
