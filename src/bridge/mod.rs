//! Correlated request/reply bridge over the async broker.
//!
//! A caller publishes a request carrying a fresh correlation id and blocks
//! on a single-fire completion slot until the matching response arrives or
//! the deadline elapses. The waiter map's remove-if-present is the arbiter:
//! exactly one of the two paths claims the slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::sleep;

use crate::broker::{Delivery, DeliveryTarget, MemoryBroker};
use crate::error::{Error, Result};
use crate::protocol::MessageProperties;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Vec<u8>>>>>;

/// Turns an async publish plus async response into a bounded blocking call.
pub struct RequestBridge {
    broker: Arc<MemoryBroker>,
    exchange: String,
    reply_queue: String,
    pending: PendingMap,
}

impl RequestBridge {
    /// Create a bridge consuming responses from `reply_queue`.
    ///
    /// The reply queue is bound and consumed immediately, with unlimited
    /// credit: resolving a waiter never blocks on admission control.
    pub fn new(broker: Arc<MemoryBroker>, reply_queue: impl Into<String>) -> Arc<Self> {
        let reply_queue = reply_queue.into();
        let exchange = broker.settings().exchange.clone();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        broker.queue_bind(&reply_queue, &exchange, &reply_queue);
        broker.basic_consume(
            &reply_queue,
            &exchange,
            0,
            Arc::new(ReplyTarget {
                pending: pending.clone(),
                broker: Arc::downgrade(&broker),
                exchange: exchange.clone(),
            }),
        );

        Arc::new(Self {
            broker,
            exchange,
            reply_queue,
            pending,
        })
    }

    /// Publish a request and wait for the correlated response, up to
    /// `timeout`.
    ///
    /// Only the calling task is suspended; the dispatcher worker is never
    /// involved in the wait. On timeout the pending entry is removed before
    /// the error is returned, so a late response is silently discarded.
    pub async fn blocking_publish(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (tx, mut rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(correlation_id.clone(), tx);

        let properties = MessageProperties::default()
            .with_correlation_id(&correlation_id)
            .with_reply_to(&self.reply_queue);

        if let Err(e) =
            self.broker
                .basic_publish(&self.exchange, routing_key, false, false, properties, body)
        {
            self.pending.lock().unwrap().remove(&correlation_id);
            return Err(e);
        }

        tracing::debug!(
            "Waiting up to {:?} for response to {}",
            timeout,
            correlation_id
        );

        tokio::select! {
            response = &mut rx => {
                response.map_err(|_| Error::Other("response slot dropped".to_string()))
            }
            _ = sleep(timeout) => {
                // Remove-if-present decides the race against a resolver.
                if self.pending.lock().unwrap().remove(&correlation_id).is_some() {
                    Err(Error::Timeout(timeout.as_millis() as u64))
                } else {
                    // The resolver claimed the slot right at the deadline;
                    // its send is already done or imminent.
                    rx.await
                        .map_err(|_| Error::Timeout(timeout.as_millis() as u64))
                }
            }
        }
    }

    /// Number of callers currently waiting.
    pub fn waiters(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Consumer of the reply queue: each response resolves exactly one waiter.
struct ReplyTarget {
    pending: PendingMap,
    broker: Weak<MemoryBroker>,
    exchange: String,
}

impl DeliveryTarget for ReplyTarget {
    fn deliver(&self, delivery: Delivery) -> Result<()> {
        let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
            tracing::debug!("Discarding response without correlation id");
            return Ok(());
        };

        let body = match self.broker.upgrade() {
            Some(broker) => broker.decrypt_body(&self.exchange, &delivery.body)?,
            None => return Ok(()),
        };

        let slot = self.pending.lock().unwrap().remove(correlation_id);
        match slot {
            Some(tx) => {
                // The waiter may have just timed out; nothing to do then.
                let _ = tx.send(body);
            }
            None => {
                tracing::debug!("Discarding late response for {}", correlation_id);
            }
        }
        Ok(())
    }
}
