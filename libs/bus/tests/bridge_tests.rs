//! Bridge behaviour against the in-process broker and scripted producers

use async_trait::async_trait;
use bus::{
    Bridge, BridgeConfig, Broker, BusError, BusResult, Consumer, ConsumerOptions, MemoryBroker,
    MemoryBrokerConfig, Producer,
};
use bytes::Bytes;
use codec::{pack, Message, Metadata, SerializeType};
use dispatch::{Router, Task};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

const ORDER_PLACED: u16 = 1;
const ORDER_CANCELLED: u16 = 2;

fn message(cmd: u16, data: &'static str) -> Message {
    Message::new(cmd, 0, SerializeType::Json, Metadata::new(), data)
}

fn fast_consumer() -> ConsumerOptions {
    ConsumerOptions {
        channel: "gateway".into(),
        concurrency: 1,
        max_in_flight: 16,
        requeue_delay: Duration::from_millis(1),
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Broker handing out fixed producers; consumers come from a memory broker
struct Scripted {
    producers: Vec<Arc<dyn Producer>>,
    memory: MemoryBroker,
}

impl Broker for Scripted {
    fn producers(&self) -> BusResult<Vec<Arc<dyn Producer>>> {
        Ok(self.producers.clone())
    }

    fn consumer(&self, topic: &str, options: &ConsumerOptions) -> BusResult<Arc<dyn Consumer>> {
        self.memory.consumer(topic, options)
    }
}

fn scripted(producer: Arc<dyn Producer>) -> Arc<dyn Broker> {
    Arc::new(Scripted {
        producers: vec![producer],
        memory: MemoryBroker::default(),
    })
}

/// Blocks every publish until a permit is added
struct Gated {
    entered: mpsc::UnboundedSender<Bytes>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Producer for Gated {
    fn addr(&self) -> &str {
        "gated"
    }

    async fn publish(&self, _topic: &str, body: Bytes) -> BusResult<()> {
        let _ = self.entered.send(body);
        self.gate.acquire().await.map_err(|_| BusError::Stopped)?.forget();
        Ok(())
    }

    async fn stop(&self) {
        self.gate.close();
    }
}

/// Slow producer failing the first attempt of every third payload
#[derive(Default)]
struct Flaky {
    calls: AtomicUsize,
    published: Mutex<Vec<Bytes>>,
    failed_once: Mutex<HashSet<Bytes>>,
    published_at_stop: Mutex<Option<usize>>,
    stopped: AtomicBool,
}

#[async_trait]
impl Producer for Flaky {
    fn addr(&self) -> &str {
        "flaky"
    }

    async fn publish(&self, _topic: &str, body: Bytes) -> BusResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BusError::Stopped);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call % 3 == 0 && self.failed_once.lock().insert(body.clone()) {
            return Err(BusError::timeout("PUB", "flaky", Duration::from_millis(1)));
        }
        self.published.lock().push(body);
        Ok(())
    }

    async fn stop(&self) {
        *self.published_at_stop.lock() = Some(self.published.lock().len());
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Producer wrapper that forwards to a shared Flaky
struct Shared(Arc<Flaky>);

#[async_trait]
impl Producer for Shared {
    fn addr(&self) -> &str {
        self.0.addr()
    }

    async fn publish(&self, topic: &str, body: Bytes) -> BusResult<()> {
        self.0.publish(topic, body).await
    }

    async fn stop(&self) {
        self.0.stop().await
    }
}

struct Record(mpsc::UnboundedSender<(u16, String, u16, Bytes)>);

#[async_trait]
impl Router for Record {
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        let delivery = task
            .delivery()
            .ok_or_else(|| anyhow::anyhow!("not a broker task"))?;
        let _ = self.0.send((
            task.msg_id(),
            delivery.topic.clone(),
            delivery.attempts,
            task.message().data.clone(),
        ));
        Ok(())
    }
}

/// Fails the first delivery attempt
struct FailFirst(mpsc::UnboundedSender<u16>);

#[async_trait]
impl Router for FailFirst {
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        let attempts = task.delivery().map_or(0, |d| d.attempts);
        let _ = self.0.send(attempts);
        if attempts < 2 {
            anyhow::bail!("not yet");
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_publish_times_out_when_buffer_stays_full() {
    let (entered_tx, mut entered) = mpsc::unbounded_channel();
    let gate = Arc::new(Semaphore::new(0));
    let producer = Arc::new(Gated {
        entered: entered_tx,
        gate: gate.clone(),
    });
    let config = BridgeConfig {
        buffer_capacity: 1,
        ..BridgeConfig::default()
    };
    let bridge = Bridge::builder(config, scripted(producer)).build().unwrap();
    assert!(!bridge.is_writing());

    // first payload is taken by the writer, which then blocks
    bridge.publish("orders", "one").await.unwrap();
    assert!(bridge.is_writing());
    assert_eq!(entered.recv().await.unwrap().as_ref(), b"one");

    // one free slot: succeeds within the timeout
    bridge.publish("orders", "two").await.unwrap();
    assert_eq!(bridge.buffered(), 1);

    // no slot frees up within 5 ms
    let err = bridge.publish("orders", "three").await.unwrap_err();
    assert!(
        matches!(err, BusError::PublishTimeout { ref topic, timeout } if topic == "orders" && timeout == Duration::from_millis(5))
    );

    gate.add_permits(2);
    assert_eq!(entered.recv().await.unwrap().as_ref(), b"two");
    eventually("buffer to empty", || bridge.buffered() == 0).await;
    bridge.publish("orders", "four").await.unwrap();

    gate.add_permits(1);
    bridge.stop().await;
}

#[tokio::test]
async fn test_stop_drains_every_queued_payload_before_producers_stop() {
    let flaky = Arc::new(Flaky::default());
    let config = BridgeConfig {
        buffer_capacity: 64,
        retry_backoff: Duration::from_millis(1),
        ..BridgeConfig::default()
    };
    let bridge = Bridge::builder(config, scripted(Arc::new(Shared(flaky.clone()))))
        .build()
        .unwrap();

    let mut expected = HashSet::new();
    for i in 0..40 {
        let body = Bytes::from(format!("payload-{i}"));
        expected.insert(body.clone());
        bridge.publish("orders", body).await.unwrap();
    }
    assert!(bridge.buffered() > 0, "stop should find queued payloads");

    bridge.stop().await;

    let published: HashSet<Bytes> = flaky.published.lock().iter().cloned().collect();
    assert_eq!(published, expected);
    assert_eq!(*flaky.published_at_stop.lock(), Some(40));
    assert!(!flaky.failed_once.lock().is_empty(), "some publishes should have failed");

    assert!(matches!(
        bridge.publish("orders", "late").await,
        Err(BusError::Stopped)
    ));
}

#[tokio::test]
async fn test_publish_rejects_bad_input_and_missing_producers() {
    let bridge = Bridge::builder(
        BridgeConfig::default(),
        Arc::new(MemoryBroker::new(MemoryBrokerConfig {
            producers: 0,
            ..MemoryBrokerConfig::default()
        })),
    )
    .build()
    .unwrap();

    assert!(matches!(bridge.publish("", "x").await, Err(BusError::EmptyTopic)));
    assert!(matches!(
        bridge.publish("orders", Bytes::new()).await,
        Err(BusError::EmptyPayload { .. })
    ));
    assert!(matches!(
        bridge.publish("orders", "x").await,
        Err(BusError::NoProducers)
    ));
    assert!(matches!(
        bridge.publish_direct("orders", "x").await,
        Err(BusError::NoProducers)
    ));
}

#[tokio::test]
async fn test_duplicate_router_is_setup_error() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut builder = Bridge::builder(BridgeConfig::default(), Arc::new(MemoryBroker::default()));
    builder
        .add_router("orders", ORDER_PLACED, Arc::new(Record(tx.clone())))
        .unwrap();
    builder
        .add_router("orders", ORDER_CANCELLED, Arc::new(Record(tx.clone())))
        .unwrap();
    assert_eq!(builder.topics(), ["orders".to_string()]);

    let err = builder
        .add_router("audit", ORDER_PLACED, Arc::new(Record(tx)))
        .unwrap_err();
    match err {
        BusError::Dispatch(e) => assert!(e.is_setup_error()),
        other => panic!("expected dispatch error, got {other}"),
    }
}

#[tokio::test]
async fn test_round_trip_through_memory_broker() {
    let broker = MemoryBroker::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = BridgeConfig {
        consumer: fast_consumer(),
        ..BridgeConfig::default()
    };
    let mut builder = Bridge::builder(config, Arc::new(broker.clone()));
    builder
        .add_router("orders", ORDER_PLACED, Arc::new(Record(tx.clone())))
        .unwrap();
    builder
        .add_router("audit", ORDER_CANCELLED, Arc::new(Record(tx)))
        .unwrap();
    let bridge = builder.build().unwrap();
    bridge.start().await.unwrap();

    let mut topics = bridge.consumer_topics();
    topics.sort_unstable();
    assert_eq!(topics, vec!["audit", "orders"]);

    bridge
        .publish_msg("orders", &message(ORDER_PLACED, "buffered"))
        .await
        .unwrap();
    bridge
        .publish_msg_direct("audit", &message(ORDER_CANCELLED, "direct"))
        .await
        .unwrap();

    let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
    seen.sort_by_key(|(msg_id, ..)| *msg_id);
    assert_eq!(
        seen,
        vec![
            (ORDER_PLACED, "orders".to_string(), 1, Bytes::from_static(b"buffered")),
            (ORDER_CANCELLED, "audit".to_string(), 1, Bytes::from_static(b"direct")),
        ]
    );
    assert_eq!(broker.published(), 2);
    bridge.stop().await;
}

#[tokio::test]
async fn test_unknown_id_is_reported_as_failure_and_garbage_is_acked() {
    // one attempt: any reported failure is discarded at once
    let broker = MemoryBroker::new(MemoryBrokerConfig {
        producers: 1,
        max_attempts: 1,
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = BridgeConfig {
        consumer: fast_consumer(),
        ..BridgeConfig::default()
    };
    let mut builder = Bridge::builder(config, Arc::new(broker.clone()));
    builder
        .add_router("orders", ORDER_PLACED, Arc::new(Record(tx)))
        .unwrap();
    let bridge = builder.build().unwrap();
    bridge.start().await.unwrap();

    broker.inject("orders", "definitely not a message");
    broker.inject("orders", pack(&message(77, "nobody home")).unwrap());
    broker.inject("orders", pack(&message(ORDER_PLACED, "sentinel")).unwrap());

    // single delivery worker: the first two were handled before this one
    let (msg_id, ..) = rx.recv().await.unwrap();
    assert_eq!(msg_id, ORDER_PLACED);
    assert_eq!(broker.discarded(), 1);
    bridge.stop().await;
}

#[tokio::test]
async fn test_router_error_leads_to_redelivery() {
    let broker = MemoryBroker::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = BridgeConfig {
        consumer: fast_consumer(),
        ..BridgeConfig::default()
    };
    let mut builder = Bridge::builder(config, Arc::new(broker.clone()));
    builder
        .add_router("orders", ORDER_PLACED, Arc::new(FailFirst(tx)))
        .unwrap();
    let bridge = builder.build().unwrap();
    bridge.start().await.unwrap();

    broker.inject("orders", pack(&message(ORDER_PLACED, "retry me")).unwrap());
    assert_eq!(rx.recv().await, Some(1));
    assert_eq!(rx.recv().await, Some(2));
    bridge.stop().await;
    assert_eq!(broker.discarded(), 0);
}

#[tokio::test]
async fn test_start_after_stop_is_rejected() {
    let bridge = Bridge::builder(BridgeConfig::default(), Arc::new(MemoryBroker::default()))
        .build()
        .unwrap();
    bridge.stop().await;
    assert!(matches!(bridge.start().await, Err(BusError::Stopped)));
}
