//! Broker seams
//!
//! A [`Broker`] hands out [`Producer`]s for outbound traffic and one
//! [`Consumer`] per subscribed topic. Consumers push each delivery into a
//! [`DeliveryHandler`] and report the outcome back to the broker: `Ok` acks
//! the delivery, `Err` asks for redelivery.

use crate::error::BusResult;
use async_trait::async_trait;
use bytes::Bytes;
use dispatch::DeliveryHandle;
use std::sync::Arc;
use std::time::Duration;

/// One message delivered by a broker
#[derive(Debug, Clone)]
pub struct Delivery {
    pub handle: DeliveryHandle,
    pub body: Bytes,
}

/// Per-topic subscription settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Logical consumer group; each channel sees every message once
    pub channel: String,
    /// Delivery handlers running in parallel
    pub concurrency: usize,
    /// Deliveries outstanding before the broker stops sending
    pub max_in_flight: usize,
    /// Base delay before a failed delivery is retried, scaled by attempt
    pub requeue_delay: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            channel: "conduit".to_string(),
            concurrency: 1,
            max_in_flight: 100,
            requeue_delay: Duration::from_secs(1),
        }
    }
}

impl ConsumerOptions {
    /// Requeue delay for a delivery that failed on `attempts`, capped at one minute
    pub fn requeue_delay_for(&self, attempts: u16) -> Duration {
        self.requeue_delay
            .saturating_mul(u32::from(attempts.max(1)))
            .min(Duration::from_secs(60))
    }
}

#[async_trait]
pub trait Producer: Send + Sync {
    /// Address or name used in logs
    fn addr(&self) -> &str;

    /// Publish one payload and wait for the broker to accept it
    async fn publish(&self, topic: &str, body: Bytes) -> BusResult<()>;

    /// Release the producer's connection; later publishes fail
    async fn stop(&self);
}

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle_delivery(&self, delivery: Delivery) -> BusResult<()>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn topic(&self) -> &str;

    /// Begin delivering into `handler`; returns once the subscription is set up
    async fn start(&self, handler: Arc<dyn DeliveryHandler>) -> BusResult<()>;

    /// Stop taking deliveries and wait for in-flight ones to finish
    async fn stop(&self);
}

pub trait Broker: Send + Sync {
    /// One producer per downstream node
    fn producers(&self) -> BusResult<Vec<Arc<dyn Producer>>>;

    fn consumer(&self, topic: &str, options: &ConsumerOptions) -> BusResult<Arc<dyn Consumer>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_delay_scales_and_caps() {
        let options = ConsumerOptions {
            requeue_delay: Duration::from_millis(500),
            ..ConsumerOptions::default()
        };
        assert_eq!(options.requeue_delay_for(0), Duration::from_millis(500));
        assert_eq!(options.requeue_delay_for(3), Duration::from_millis(1500));
        assert_eq!(options.requeue_delay_for(u16::MAX), Duration::from_secs(60));
    }
}
