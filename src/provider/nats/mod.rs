//! NATS JetStream broker
//!
//! Implements `BrokerProvider` on JetStream. Each queue is a work-queue
//! stream capturing `exchange.routing_key` subjects, so publish acks play
//! the role of confirms and a missing stream is a returned message.

mod client;
mod config;
mod subscriber;

pub use client::NatsClient;
pub use config::{NatsConfig, StorageType};
pub use subscriber::NatsSubscription;

use crate::error::Result;
use crate::provider::{BrokerProvider, DeliveryStream, OutboundMessage, PendingConfirm};
use crate::topology::Topology;
use async_trait::async_trait;

/// NATS JetStream broker
///
/// Wraps `NatsClient` and implements the `BrokerProvider` trait.
pub struct NatsBroker {
    client: NatsClient,
}

impl NatsBroker {
    /// Connect to NATS
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl BrokerProvider for NatsBroker {
    async fn declare(&self, topology: &Topology) -> Result<()> {
        self.client.declare(topology).await
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm> {
        self.client.publish(message).await
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>> {
        let sub = self.client.consume(queue).await?;
        Ok(Box::new(sub))
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        self.client.queue_depth(queue).await
    }

    fn name(&self) -> &str {
        "nats"
    }
}
