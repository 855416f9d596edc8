//! Routing-key to queue bindings consulted by the dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Bindings from routing key to destination queue.
///
/// At most one destination per routing key; rebinding silently replaces the
/// previous destination. There is no unbind.
#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    bindings: Arc<Mutex<HashMap<String, String>>>,
}

impl BindingTable {
    /// Create an empty binding table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a routing key to a queue. Idempotent, last write wins.
    pub fn bind(&self, queue_name: &str, routing_key: &str) {
        let mut bindings = self.bindings.lock().unwrap();
        if let Some(previous) = bindings.insert(routing_key.to_string(), queue_name.to_string()) {
            if previous != queue_name {
                tracing::debug!(
                    "Rebound routing key {} from queue {} to {}",
                    routing_key,
                    previous,
                    queue_name
                );
            }
        }
    }

    /// Queue bound to a routing key, if any.
    pub fn get(&self, routing_key: &str) -> Option<String> {
        self.bindings.lock().unwrap().get(routing_key).cloned()
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.lock().unwrap().len()
    }

    /// True when no bindings exist.
    pub fn is_empty(&self) -> bool {
        self.bindings.lock().unwrap().is_empty()
    }
}
