//! In-process transport backed by the local `MemoryBroker`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

use crate::broker::{Delivery, DeliveryTarget, MemoryBroker};
use crate::error::{Error, Result};

use super::transport::{Channel, ChannelEvent, Topology, Transport};

/// Size of the per-channel event buffer. Prefetch bounds in-flight
/// deliveries well below this.
const EVENT_BUFFER: usize = 16;

/// Transport whose channels talk directly to an in-process broker.
pub struct InProcessTransport {
    broker: Arc<MemoryBroker>,
}

impl InProcessTransport {
    pub fn new(broker: Arc<MemoryBroker>) -> Arc<Self> {
        Arc::new(Self { broker })
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn connect(&self) -> Result<Arc<dyn Channel>> {
        Ok(Arc::new(InProcessChannel {
            broker: self.broker.clone(),
            topology: Mutex::new(None),
            prefetch: AtomicU16::new(0),
            events_tx: Mutex::new(None),
        }))
    }
}

struct InProcessChannel {
    broker: Arc<MemoryBroker>,
    topology: Mutex<Option<Topology>>,
    prefetch: AtomicU16,
    events_tx: Mutex<Option<mpsc::Sender<ChannelEvent>>>,
}

impl InProcessChannel {
    fn current_topology(&self) -> Result<Topology> {
        self.topology
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Transport("topology not declared".to_string()))
    }
}

#[async_trait]
impl Channel for InProcessChannel {
    async fn declare_topology(&self, topology: &Topology) -> Result<()> {
        self.broker
            .queue_bind(&topology.queue, &topology.exchange, &topology.routing_key);
        *self.topology.lock().unwrap() = Some(topology.clone());
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue_name: &str) -> Result<mpsc::Receiver<ChannelEvent>> {
        let topology = self.current_topology()?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let target = Arc::new(ForwardingTarget {
            tx: tx.clone(),
            broker: Arc::downgrade(&self.broker),
            exchange: topology.exchange.clone(),
        });
        self.broker.basic_consume(
            queue_name,
            &topology.exchange,
            self.prefetch.load(Ordering::SeqCst),
            target,
        );

        *self.events_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        let topology = self.current_topology()?;
        self.broker
            .basic_ack(delivery_tag, &topology.exchange, &topology.routing_key, multiple);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        let topology = self.current_topology()?;
        self.broker
            .basic_nack(delivery_tag, &topology.exchange, &topology.routing_key, multiple);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Ok(topology) = self.current_topology() {
            self.broker.basic_cancel(&topology.queue);
        }
        // Tell the receive loop the channel is gone.
        if let Some(tx) = self.events_tx.lock().unwrap().take() {
            let _ = tx.try_send(ChannelEvent::Shutdown("channel closed by consumer".to_string()));
        }
        Ok(())
    }
}

/// Delivery target registered with the broker; decrypts and forwards into
/// the channel's event stream.
struct ForwardingTarget {
    tx: mpsc::Sender<ChannelEvent>,
    broker: Weak<MemoryBroker>,
    exchange: String,
}

impl DeliveryTarget for ForwardingTarget {
    fn deliver(&self, mut delivery: Delivery) -> Result<()> {
        if let Some(broker) = self.broker.upgrade() {
            delivery.body = broker.decrypt_body(&self.exchange, &delivery.body)?;
        }

        self.tx
            .try_send(ChannelEvent::Delivery(delivery))
            .map_err(|_| Error::Delivery("consumer event buffer unavailable".to_string()))
    }
}
