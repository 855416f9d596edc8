//! Live client handles keyed by queue name.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::protocol::MessageProperties;

/// One inbound message as seen by a consumer callback.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Monotonic tag identifying this delivery on its channel.
    pub delivery_tag: u64,
    /// Whether the message was delivered before.
    pub redelivered: bool,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key of the message.
    pub routing_key: String,
    /// Message properties.
    pub properties: MessageProperties,
    /// Payload bytes.
    pub body: Vec<u8>,
}

impl Delivery {
    /// Routing key and properties for a response to this delivery, carrying
    /// the request's correlation id to its reply-to queue.
    ///
    /// Returns `None` when the sender did not ask for a reply.
    pub fn response_route(&self) -> Option<(String, MessageProperties)> {
        let reply_to = self.properties.reply_to.clone()?;

        let mut properties = MessageProperties::new(self.properties.content_type.clone());
        properties.correlation_id = self.properties.correlation_id.clone();

        Some((reply_to, properties))
    }
}

/// Receiving end of a registered client.
///
/// `deliver` is invoked synchronously by the dispatcher worker and must not
/// block.
pub trait DeliveryTarget: Send + Sync {
    /// Hand one delivery to the client. A failure drops the message.
    fn deliver(&self, delivery: Delivery) -> Result<()>;
}

/// Outstanding-delivery accounting for one client channel.
///
/// A prefetch of zero means unlimited credit with no tag tracking.
#[derive(Debug)]
pub struct Credit {
    prefetch: u16,
    next_tag: AtomicU64,
    unacked: Mutex<BTreeSet<u64>>,
}

impl Credit {
    pub fn new(prefetch: u16) -> Self {
        Self {
            prefetch,
            next_tag: AtomicU64::new(0),
            unacked: Mutex::new(BTreeSet::new()),
        }
    }

    /// Whether another delivery may be issued.
    pub fn available(&self) -> bool {
        if self.prefetch == 0 {
            return true;
        }
        let unacked = self.unacked.lock().unwrap();
        unacked.len() < self.prefetch as usize
    }

    /// Issue the next delivery tag, recording it as unacknowledged.
    pub fn issue(&self) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        if self.prefetch != 0 {
            self.unacked.lock().unwrap().insert(tag);
        }
        tag
    }

    /// Settle one tag, or every tag up to and including it when `multiple`.
    pub fn settle(&self, delivery_tag: u64, multiple: bool) {
        if self.prefetch == 0 {
            return;
        }
        let mut unacked = self.unacked.lock().unwrap();
        if multiple {
            unacked.retain(|tag| *tag > delivery_tag);
        } else {
            unacked.remove(&delivery_tag);
        }
    }

    /// Number of unacknowledged deliveries.
    pub fn outstanding(&self) -> usize {
        self.unacked.lock().unwrap().len()
    }
}

/// A registered client: its delivery target plus channel accounting.
#[derive(Clone)]
pub struct ClientHandle {
    /// Queue this client consumes from.
    pub queue_name: String,
    /// Exchange the client subscribed through.
    pub exchange: String,
    /// Delivery callback.
    pub target: Arc<dyn DeliveryTarget>,
    /// Admission-control credit for this channel.
    pub credit: Arc<Credit>,
}

impl ClientHandle {
    pub fn new(
        queue_name: impl Into<String>,
        exchange: impl Into<String>,
        target: Arc<dyn DeliveryTarget>,
        prefetch: u16,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            exchange: exchange.into(),
            target,
            credit: Arc::new(Credit::new(prefetch)),
        }
    }
}

/// Queue-name to live-client mapping.
///
/// Safe for concurrent register/lookup/remove while the dispatcher reads.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<Mutex<HashMap<String, ClientHandle>>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client for a queue. Last registration wins; a reconnecting
    /// client replaces its previous handle wholesale.
    pub fn register(&self, handle: ClientHandle) {
        let mut clients = self.clients.lock().unwrap();
        if clients.insert(handle.queue_name.clone(), handle.clone()).is_some() {
            tracing::debug!("Replaced client registration for queue {}", handle.queue_name);
        }
    }

    /// Live client for a queue, if any.
    pub fn lookup(&self, queue_name: &str) -> Option<ClientHandle> {
        self.clients.lock().unwrap().get(queue_name).cloned()
    }

    /// Remove a client on explicit disconnect.
    pub fn remove(&self, queue_name: &str) -> Option<ClientHandle> {
        self.clients.lock().unwrap().remove(queue_name)
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// True when no clients are registered.
    pub fn is_empty(&self) -> bool {
        self.clients.lock().unwrap().is_empty()
    }
}
