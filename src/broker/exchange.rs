//! Per-routing-key mailboxes holding undelivered envelopes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::protocol::MessageEnvelope;

/// FIFO mailboxes keyed by routing key.
///
/// Mailboxes are created lazily on first publish and live for the process
/// lifetime. Cloning shares the underlying table.
#[derive(Debug, Clone, Default)]
pub struct ExchangeTable {
    mailboxes: Arc<Mutex<HashMap<String, VecDeque<MessageEnvelope>>>>,
}

impl ExchangeTable {
    /// Create an empty exchange table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an envelope to the tail of its routing key's mailbox,
    /// creating the mailbox if absent. Fire-and-forget.
    pub fn publish(&self, envelope: MessageEnvelope) {
        let mut mailboxes = self.mailboxes.lock().unwrap();
        let mailbox = mailboxes.entry(envelope.routing_key.clone()).or_default();
        mailbox.push_back(envelope);
    }

    /// Dequeue the head envelope for a routing key, if any.
    pub fn try_dequeue(&self, routing_key: &str) -> Option<MessageEnvelope> {
        let mut mailboxes = self.mailboxes.lock().unwrap();
        mailboxes.get_mut(routing_key)?.pop_front()
    }

    /// Routing keys that currently have at least one pending envelope.
    pub fn routing_keys_with_pending(&self) -> Vec<String> {
        let mailboxes = self.mailboxes.lock().unwrap();
        mailboxes
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// True iff every mailbox is empty. Used as the drain signal on shutdown.
    pub fn is_empty(&self) -> bool {
        let mailboxes = self.mailboxes.lock().unwrap();
        mailboxes.values().all(|queue| queue.is_empty())
    }

    /// Number of envelopes pending for one routing key.
    pub fn pending(&self, routing_key: &str) -> usize {
        let mailboxes = self.mailboxes.lock().unwrap();
        mailboxes.get(routing_key).map_or(0, |queue| queue.len())
    }

    /// Total envelopes pending across all mailboxes.
    pub fn total_pending(&self) -> usize {
        let mailboxes = self.mailboxes.lock().unwrap();
        mailboxes.values().map(|queue| queue.len()).sum()
    }

    /// Number of mailboxes, including drained ones.
    pub fn mailbox_count(&self) -> usize {
        self.mailboxes.lock().unwrap().len()
    }
}
