//! Transport and channel seams the supervisor subscribes through.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::broker::Delivery;
use crate::error::Result;

/// Exchange, queue and routing key a consumer subscribes with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Topology {
    /// Topology with an explicit queue name.
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Topology for a named consumer, deriving the queue name as
    /// `exchange:consumer:routing_key`.
    pub fn for_consumer(exchange: &str, consumer_name: &str, routing_key: &str) -> Self {
        let queue = format!("{}:{}:{}", exchange, consumer_name, routing_key);
        Self::new(exchange, queue, routing_key)
    }
}

/// Events emitted by a consuming channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// One inbound message.
    Delivery(Delivery),
    /// The channel shut down, with the transport's reason.
    Shutdown(String),
}

/// A connectable transport (in-process broker or an external one).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a fresh channel.
    async fn connect(&self) -> Result<Arc<dyn Channel>>;
}

/// One live channel against a transport.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare exchange, queue and binding. Must be idempotent.
    async fn declare_topology(&self, topology: &Topology) -> Result<()>;

    /// Limit unacknowledged deliveries in flight (zero = unlimited).
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Begin consuming a queue, yielding deliveries and shutdown events.
    async fn consume(&self, queue_name: &str) -> Result<mpsc::Receiver<ChannelEvent>>;

    /// Acknowledge one delivery, or all up to the tag when `multiple`.
    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;

    /// Negatively acknowledge one delivery, or all up to the tag.
    async fn basic_nack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;

    /// Close the channel.
    async fn close(&self) -> Result<()>;
}
