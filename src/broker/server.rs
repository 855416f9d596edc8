//! Broker facade exposing the publish/bind/consume/ack surface.

use std::sync::Arc;

use crate::config::Settings;
use crate::crypto::{MessageEncryptor, PassthroughEncryptor};
use crate::error::Result;
use crate::protocol::{MessageEnvelope, MessageProperties};

use super::bindings::BindingTable;
use super::clients::{ClientHandle, ClientRegistry, DeliveryTarget};
use super::dispatcher::{Dispatcher, DispatcherState};
use super::exchange::ExchangeTable;

/// In-memory broker: mailboxes, bindings, clients and the dispatcher,
/// behind the wire-level operation surface.
///
/// All state is volatile and scoped to the process.
pub struct MemoryBroker {
    exchange: ExchangeTable,
    bindings: BindingTable,
    clients: ClientRegistry,
    dispatcher: Dispatcher,
    encryptor: Arc<dyn MessageEncryptor>,
    settings: Settings,
}

impl MemoryBroker {
    /// Create a broker with no body encryption.
    pub fn new(settings: Settings) -> Arc<Self> {
        Self::with_encryptor(settings, Arc::new(PassthroughEncryptor))
    }

    /// Create a broker applying the given encryptor at the publish and
    /// delivery boundaries.
    pub fn with_encryptor(settings: Settings, encryptor: Arc<dyn MessageEncryptor>) -> Arc<Self> {
        let exchange = ExchangeTable::new();
        let bindings = BindingTable::new();
        let clients = ClientRegistry::new();
        let dispatcher = Dispatcher::new(
            exchange.clone(),
            bindings.clone(),
            clients.clone(),
            settings.poll_interval(),
            settings.drain_timeout(),
        );

        Arc::new(Self {
            exchange,
            bindings,
            clients,
            dispatcher,
            encryptor,
            settings,
        })
    }

    /// Start the dispatch loop.
    pub async fn start(&self) {
        self.dispatcher.start().await;
        tracing::info!("Broker started on exchange {}", self.settings.exchange);
    }

    /// Drain and stop the dispatch loop.
    pub async fn stop(&self) {
        self.dispatcher.stop().await;
        tracing::info!("Broker stopped");
    }

    /// Dispatcher lifecycle state.
    pub fn dispatcher_state(&self) -> DispatcherState {
        self.dispatcher.state()
    }

    /// Publish a message. Fire-and-forget: enqueues into the routing key's
    /// mailbox and returns. `mandatory` and `immediate` are accepted for
    /// wire compatibility and ignored.
    pub fn basic_publish(
        &self,
        exchange_name: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<()> {
        if mandatory || immediate {
            tracing::debug!(
                "Ignoring mandatory={}/immediate={} flags on publish to {}",
                mandatory,
                immediate,
                routing_key
            );
        }

        let sealed = self.encryptor.encrypt(exchange_name, &body)?;
        let envelope = MessageEnvelope::new(routing_key, properties, sealed);

        tracing::debug!("Publishing envelope {} to {}", envelope.id, routing_key);
        self.exchange.publish(envelope);
        Ok(())
    }

    /// Bind a queue to a routing key. Idempotent, last write wins.
    pub fn queue_bind(&self, queue_name: &str, exchange_name: &str, routing_key: &str) {
        tracing::debug!(
            "Binding queue {} to {} on exchange {}",
            queue_name,
            routing_key,
            exchange_name
        );
        self.bindings.bind(queue_name, routing_key);
    }

    /// Begin delivering envelopes for a queue to the given target, limited
    /// to `prefetch` unacknowledged deliveries in flight (zero = unlimited).
    /// Replaces any previous consumer of the queue.
    pub fn basic_consume(
        &self,
        queue_name: &str,
        exchange_name: &str,
        prefetch: u16,
        target: Arc<dyn DeliveryTarget>,
    ) {
        tracing::debug!("Consumer attached to queue {}", queue_name);
        self.clients
            .register(ClientHandle::new(queue_name, exchange_name, target, prefetch));
    }

    /// Detach the consumer of a queue. Messages keep queueing.
    pub fn basic_cancel(&self, queue_name: &str) {
        if self.clients.remove(queue_name).is_some() {
            tracing::debug!("Consumer detached from queue {}", queue_name);
        }
    }

    /// Acknowledge one delivery, or every delivery up to the tag when
    /// `multiple`, returning credit to the consumer's channel.
    pub fn basic_ack(&self, delivery_tag: u64, _exchange: &str, routing_key: &str, multiple: bool) {
        self.settle(delivery_tag, routing_key, multiple);
    }

    /// Negatively acknowledge. The broker is at-most-once and non-durable,
    /// so the message is dropped; only the credit accounting differs from a
    /// plain ack in intent.
    pub fn basic_nack(&self, delivery_tag: u64, _exchange: &str, routing_key: &str, multiple: bool) {
        tracing::debug!("Nack for tag {} on {}", delivery_tag, routing_key);
        self.settle(delivery_tag, routing_key, multiple);
    }

    fn settle(&self, delivery_tag: u64, routing_key: &str, multiple: bool) {
        let Some(queue_name) = self.bindings.get(routing_key) else {
            tracing::debug!("Ack for unbound routing key {}", routing_key);
            return;
        };
        let Some(client) = self.clients.lookup(&queue_name) else {
            tracing::debug!("Ack for queue {} with no live client", queue_name);
            return;
        };
        client.credit.settle(delivery_tag, multiple);
    }

    /// Decrypt a delivery body on its way out to a consumer.
    pub fn decrypt_body(&self, exchange_name: &str, body: &[u8]) -> Result<Vec<u8>> {
        self.encryptor.decrypt(exchange_name, body)
    }

    /// True iff every mailbox is empty.
    pub fn is_empty(&self) -> bool {
        self.exchange.is_empty()
    }

    /// Total envelopes pending across all mailboxes.
    pub fn total_pending(&self) -> usize {
        self.exchange.total_pending()
    }

    /// Broker settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
