//! Message envelopes with correlation IDs for request/response traffic.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default content type for fleet payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Properties attached to a published message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageProperties {
    /// Payload content type.
    pub content_type: String,
    /// Correlation ID for request/response chains.
    pub correlation_id: Option<String>,
    /// Queue a response should be published to.
    pub reply_to: Option<String>,
}

impl MessageProperties {
    /// Properties for a plain fire-and-forget message.
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            correlation_id: None,
            reply_to: None,
        }
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the reply-to queue.
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self::new(CONTENT_TYPE_JSON)
    }
}

/// An envelope queued in a mailbox and handed to delivery callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique envelope ID (ULID).
    pub id: String,
    /// Routing key naming the message kind.
    pub routing_key: String,
    /// Message properties.
    pub properties: MessageProperties,
    /// Payload bytes.
    pub body: Vec<u8>,
    /// Enqueue timestamp (unix ms).
    pub enqueued_at: i64,
}

impl MessageEnvelope {
    /// Create a new envelope for a routing key.
    pub fn new(routing_key: impl Into<String>, properties: MessageProperties, body: Vec<u8>) -> Self {
        Self {
            id: generate_id(),
            routing_key: routing_key.into(),
            properties,
            body,
            enqueued_at: current_timestamp(),
        }
    }
}

fn generate_id() -> String {
    ulid::Ulid::new().to_string()
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_creation() {
        let envelope =
            MessageEnvelope::new("scan.local-account", MessageProperties::default(), vec![1, 2]);

        assert_eq!(envelope.routing_key, "scan.local-account");
        assert!(!envelope.id.is_empty());
        assert!(envelope.enqueued_at > 0);
    }

    #[test]
    fn test_builder_properties() {
        let properties = MessageProperties::default()
            .with_correlation_id("corr-1")
            .with_reply_to("replies");

        assert_eq!(properties.content_type, CONTENT_TYPE_JSON);
        assert_eq!(properties.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(properties.reply_to.as_deref(), Some("replies"));
    }
}
