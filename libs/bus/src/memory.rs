//! In-process broker
//!
//! Same delivery model as NSQ, without the network: every channel of a topic
//! gets its own copy of each message, consumers on one channel share its
//! queue, and a failed delivery comes back after the requeue delay until
//! `max_attempts` is reached. Messages published before any channel exists
//! wait in the topic.

use crate::broker::{Broker, Consumer, ConsumerOptions, Delivery, DeliveryHandler, Producer};
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dispatch::{panic_message, DeliveryHandle};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBrokerConfig {
    /// Producers handed to the bridge; each gets its own writer
    pub producers: usize,
    /// Deliveries of one message before it is discarded
    pub max_attempts: u16,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            producers: 1,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    id: u64,
    attempts: u16,
    timestamp: i64,
    body: Bytes,
}

#[derive(Clone)]
struct ChannelQueue {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

impl ChannelQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

#[derive(Default)]
struct Topic {
    channels: HashMap<String, ChannelQueue>,
    backlog: Vec<Envelope>,
}

struct Inner {
    config: MemoryBrokerConfig,
    topics: DashMap<String, Topic>,
    next_id: AtomicU64,
    published: AtomicU64,
    discarded: AtomicU64,
}

impl Inner {
    fn publish(&self, topic: &str, body: Bytes) {
        let envelope = Envelope {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            attempts: 1,
            timestamp: now_nanos(),
            body,
        };
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        if entry.channels.is_empty() {
            entry.backlog.push(envelope);
        } else {
            for queue in entry.channels.values() {
                let _ = queue.sender.send(envelope.clone());
            }
        }
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn subscribe(&self, topic: &str, channel: &str) -> ChannelQueue {
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        let first = entry.channels.is_empty();
        let queue = entry
            .channels
            .entry(channel.to_string())
            .or_insert_with(ChannelQueue::new)
            .clone();
        if first {
            for envelope in std::mem::take(&mut entry.backlog) {
                let _ = queue.sender.send(envelope);
            }
        }
        queue
    }
}

/// Cloneable handle; clones share topics
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                topics: DashMap::new(),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Messages accepted from producers
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Messages dropped after exhausting `max_attempts`
    pub fn discarded(&self) -> u64 {
        self.inner.discarded.load(Ordering::Relaxed)
    }

    /// Publish without going through a producer
    pub fn inject(&self, topic: &str, body: impl Into<Bytes>) {
        self.inner.publish(topic, body.into());
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

impl Broker for MemoryBroker {
    fn producers(&self) -> BusResult<Vec<Arc<dyn Producer>>> {
        Ok((0..self.inner.config.producers)
            .map(|i| {
                Arc::new(MemoryProducer {
                    name: format!("memory-{i}"),
                    inner: self.inner.clone(),
                    stopped: AtomicBool::new(false),
                }) as Arc<dyn Producer>
            })
            .collect())
    }

    fn consumer(&self, topic: &str, options: &ConsumerOptions) -> BusResult<Arc<dyn Consumer>> {
        if topic.is_empty() {
            return Err(BusError::EmptyTopic);
        }
        Ok(Arc::new(MemoryConsumer {
            topic: topic.to_string(),
            options: options.clone(),
            inner: self.inner.clone(),
            token: CancellationToken::new(),
            workers: parking_lot::Mutex::new(Vec::new()),
        }))
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("topics", &self.inner.topics.len())
            .field("published", &self.published())
            .finish()
    }
}

pub struct MemoryProducer {
    name: String,
    inner: Arc<Inner>,
    stopped: AtomicBool,
}

#[async_trait]
impl Producer for MemoryProducer {
    fn addr(&self) -> &str {
        &self.name
    }

    async fn publish(&self, topic: &str, body: Bytes) -> BusResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BusError::Stopped);
        }
        if topic.is_empty() {
            return Err(BusError::EmptyTopic);
        }
        if body.is_empty() {
            return Err(BusError::EmptyPayload {
                topic: topic.to_string(),
            });
        }
        self.inner.publish(topic, body);
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        debug!(producer = %self.name, "memory producer stopped");
    }
}

pub struct MemoryConsumer {
    topic: String,
    options: ConsumerOptions,
    inner: Arc<Inner>,
    token: CancellationToken,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn start(&self, handler: Arc<dyn DeliveryHandler>) -> BusResult<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Err(BusError::configuration(
                format!("consumer for '{}' already started", self.topic),
                None,
            ));
        }
        let queue = self.inner.subscribe(&self.topic, &self.options.channel);
        for worker_id in 0..self.options.concurrency.max(1) {
            let worker = MemoryWorker {
                id: worker_id,
                topic: self.topic.clone(),
                options: self.options.clone(),
                queue: queue.clone(),
                inner: self.inner.clone(),
                handler: handler.clone(),
                token: self.token.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        info!(topic = %self.topic, channel = %self.options.channel, "memory consumer started");
        Ok(())
    }

    async fn stop(&self) {
        self.token.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                error!(topic = %self.topic, "memory worker exited abnormally: {}", e);
            }
        }
        debug!(topic = %self.topic, "memory consumer stopped");
    }
}

struct MemoryWorker {
    id: usize,
    topic: String,
    options: ConsumerOptions,
    queue: ChannelQueue,
    inner: Arc<Inner>,
    handler: Arc<dyn DeliveryHandler>,
    token: CancellationToken,
}

impl MemoryWorker {
    async fn run(self) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                envelope = async { self.queue.receiver.lock().await.recv().await } => envelope,
            };
            let Some(envelope) = next else { break };
            self.deliver(envelope).await;
        }
        debug!(topic = %self.topic, worker_id = self.id, "memory worker exited");
    }

    async fn deliver(&self, envelope: Envelope) {
        let delivery = Delivery {
            handle: DeliveryHandle {
                id: format!("{:016x}", envelope.id),
                attempts: envelope.attempts,
                timestamp: envelope.timestamp,
                topic: self.topic.clone(),
                toucher: None,
            },
            body: envelope.body.clone(),
        };

        let failure = match AssertUnwindSafe(self.handler.handle_delivery(delivery))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("handler panicked: {}", panic_message(payload.as_ref())),
        };

        if envelope.attempts >= self.inner.config.max_attempts {
            self.inner.discarded.fetch_add(1, Ordering::Relaxed);
            error!(
                topic = %self.topic,
                id = envelope.id,
                attempts = envelope.attempts,
                "discarding message after final attempt: {}",
                failure
            );
            return;
        }

        let delay = self.options.requeue_delay_for(envelope.attempts);
        warn!(
            topic = %self.topic,
            id = envelope.id,
            attempts = envelope.attempts,
            ?delay,
            "delivery failed, requeueing: {}",
            failure
        );
        let sender = self.queue.sender.clone();
        let retry = Envelope {
            attempts: envelope.attempts + 1,
            ..envelope
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(retry);
        });
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Collect(mpsc::UnboundedSender<Delivery>);

    #[async_trait]
    impl DeliveryHandler for Collect {
        async fn handle_delivery(&self, delivery: Delivery) -> BusResult<()> {
            let _ = self.0.send(delivery);
            Ok(())
        }
    }

    fn options(channel: &str) -> ConsumerOptions {
        ConsumerOptions {
            channel: channel.into(),
            requeue_delay: Duration::from_millis(1),
            ..ConsumerOptions::default()
        }
    }

    #[tokio::test]
    async fn test_every_channel_gets_a_copy() {
        let broker = MemoryBroker::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = broker.consumer("orders", &options("a")).unwrap();
        let b = broker.consumer("orders", &options("b")).unwrap();
        a.start(Arc::new(Collect(tx_a))).await.unwrap();
        b.start(Arc::new(Collect(tx_b))).await.unwrap();

        let producer = broker.producers().unwrap().remove(0);
        producer.publish("orders", Bytes::from_static(b"x")).await.unwrap();

        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        assert_eq!(got_a.body, got_b.body);
        assert_eq!(got_a.handle.id, got_b.handle.id);
        assert_eq!(got_a.handle.attempts, 1);
        assert_eq!(got_a.handle.topic, "orders");
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_backlog_flushes_to_first_channel() {
        let broker = MemoryBroker::default();
        broker.inject("early", "one");
        broker.inject("early", "two");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = broker.consumer("early", &options("c")).unwrap();
        consumer.start(Arc::new(Collect(tx))).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().body.as_ref(), b"one");
        assert_eq!(rx.recv().await.unwrap().body.as_ref(), b"two");
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_producer_rejects() {
        let broker = MemoryBroker::default();
        let producer = broker.producers().unwrap().remove(0);
        producer.stop().await;
        assert!(matches!(
            producer.publish("t", Bytes::from_static(b"x")).await,
            Err(BusError::Stopped)
        ));
    }
}
