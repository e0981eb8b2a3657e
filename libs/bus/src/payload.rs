//! Pooled outbound payloads

use bytes::Bytes;
use dispatch::{ObjectPool, Poolable};

/// Topic plus body waiting in the outbound buffer
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Payload {
    pub topic: String,
    pub data: Bytes,
}

impl Payload {
    pub fn fill(&mut self, topic: &str, data: Bytes) {
        self.topic.clear();
        self.topic.push_str(topic);
        self.data = data;
    }
}

impl Poolable for Payload {
    fn reset(&mut self) {
        // keep the topic allocation, drop the body
        self.topic.clear();
        self.data = Bytes::new();
    }
}

pub type PayloadPool = ObjectPool<Payload>;

/// Fill-on-acquire for the payload pool
pub trait PayloadPoolExt {
    fn payload(&self, topic: &str, data: Bytes) -> Payload;
}

impl PayloadPoolExt for ObjectPool<Payload> {
    fn payload(&self, topic: &str, data: Bytes) -> Payload {
        let mut payload = self.acquire();
        payload.fill(topic, data);
        payload
    }
}
