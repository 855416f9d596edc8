//! Handler plumbing: the consumer seam and paged response publishing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::broker::{Delivery, MemoryBroker};
use crate::error::Result;
use crate::protocol::{pages, PageState};

use super::supervisor::DeliveryHandler;
use super::transport::Channel;

/// Processes one message kind. A consumer either produces no output or
/// emits a sequence of paged response messages through the shared publish
/// path.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Routing key of the message kind this consumer handles.
    fn routing_key(&self) -> &str;

    /// Process one delivery.
    async fn consume(&self, delivery: Delivery) -> Result<()>;
}

/// Delivery handler that acknowledges after the consumer finishes: ack on
/// success, nack on failure.
pub struct AckingHandler<C> {
    consumer: Arc<C>,
}

impl<C: Consumer> AckingHandler<C> {
    pub fn new(consumer: Arc<C>) -> Arc<Self> {
        Arc::new(Self { consumer })
    }
}

#[async_trait]
impl<C: Consumer + 'static> DeliveryHandler for AckingHandler<C> {
    async fn on_delivery(&self, channel: &Arc<dyn Channel>, delivery: Delivery) -> Result<()> {
        let delivery_tag = delivery.delivery_tag;
        match self.consumer.consume(delivery).await {
            Ok(()) => channel.basic_ack(delivery_tag, false).await,
            Err(e) => {
                channel.basic_nack(delivery_tag, false).await?;
                Err(e)
            }
        }
    }
}

/// One page of a batched response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePage<T> {
    /// Identifier shared by every page of one batch.
    pub batch_id: String,
    /// 1-based page index.
    pub batch_number: usize,
    /// Total number of pages in the batch.
    pub batch_count: usize,
    /// Total items across all pages.
    pub total: usize,
    /// Items on this page.
    pub items: Vec<T>,
}

/// Publish a result set as a sequence of paged responses to the request's
/// reply-to queue, one page per publish.
///
/// A page that fails to publish is logged and skipped; the rest of the
/// batch still goes out. Returns the number of pages published.
pub fn publish_paged_response<T: Serialize + Clone>(
    broker: &MemoryBroker,
    request: &Delivery,
    items: &[T],
    page_size: usize,
) -> Result<usize> {
    let Some((reply_to, properties)) = request.response_route() else {
        tracing::debug!(
            "Request on {} has no reply-to; dropping {} result items",
            request.routing_key,
            items.len()
        );
        return Ok(0);
    };

    let batch_id = uuid::Uuid::new_v4().to_string();
    let batch_count = PageState::new(items.len(), page_size).batch_count();
    let mut published = 0;

    for (index, range) in pages(items.len(), page_size).enumerate() {
        let batch_number = index + 1;
        let page = ResponsePage {
            batch_id: batch_id.clone(),
            batch_number,
            batch_count,
            total: items.len(),
            items: items[range].to_vec(),
        };
        let body = serde_json::to_vec(&page)?;

        match broker.basic_publish(
            &request.exchange,
            &reply_to,
            false,
            false,
            properties.clone(),
            body,
        ) {
            Ok(()) => {
                tracing::info!(
                    "Sent results batch {} of {} for {}",
                    batch_number,
                    batch_count,
                    request.routing_key
                );
                published += 1;
            }
            Err(e) => {
                tracing::warn!(
                    "Sending results batch {} of {} failed: {}",
                    batch_number,
                    batch_count,
                    e
                );
            }
        }
    }

    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DeliveryTarget;
    use crate::config::Settings;
    use crate::error::Error;
    use crate::protocol::MessageProperties;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::sleep;

    fn test_settings() -> Settings {
        Settings {
            poll_interval_ms: 10,
            drain_timeout_secs: 2,
            ..Settings::default()
        }
    }

    fn request_delivery(reply_to: Option<&str>) -> Delivery {
        let mut properties = MessageProperties::default().with_correlation_id("corr-1");
        properties.reply_to = reply_to.map(str::to_string);
        Delivery {
            delivery_tag: 1,
            redelivered: false,
            exchange: "fleet".to_string(),
            routing_key: "scan.local-account".to_string(),
            properties,
            body: Vec::new(),
        }
    }

    struct PageRecorder {
        pages: Mutex<Vec<ResponsePage<String>>>,
    }

    impl PageRecorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(Vec::new()),
            })
        }
    }

    impl DeliveryTarget for PageRecorder {
        fn deliver(&self, delivery: Delivery) -> crate::error::Result<()> {
            let page: ResponsePage<String> = serde_json::from_slice(&delivery.body)?;
            self.pages.lock().unwrap().push(page);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_paged_response_publishes_every_page() {
        let broker = MemoryBroker::new(test_settings());
        broker.start().await;

        broker.queue_bind("replies", "fleet", "replies");
        let recorder = PageRecorder::new();
        broker.basic_consume("replies", "fleet", 0, recorder.clone());

        let items: Vec<String> = (0..7).map(|i| format!("account-{}", i)).collect();
        let published =
            publish_paged_response(&broker, &request_delivery(Some("replies")), &items, 3).unwrap();
        assert_eq!(published, 3);

        for _ in 0..100 {
            if recorder.pages.lock().unwrap().len() == 3 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        let pages = recorder.pages.lock().unwrap();
        assert_eq!(pages.len(), 3);
        assert!(pages.iter().all(|p| p.batch_id == pages[0].batch_id));
        assert!(pages.iter().all(|p| p.batch_count == 3 && p.total == 7));
        assert_eq!(pages[0].batch_number, 1);
        assert_eq!(pages[2].items, vec!["account-6".to_string()]);
        drop(pages);

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_no_reply_to_publishes_nothing() {
        let broker = MemoryBroker::new(test_settings());
        let items = vec!["a".to_string()];
        let published =
            publish_paged_response(&broker, &request_delivery(None), &items, 10).unwrap();
        assert_eq!(published, 0);
        assert!(broker.is_empty());
    }

    struct RejectingConsumer;

    #[async_trait]
    impl Consumer for RejectingConsumer {
        fn routing_key(&self) -> &str {
            "k"
        }

        async fn consume(&self, _delivery: Delivery) -> Result<()> {
            Err(Error::Delivery("cannot process".to_string()))
        }
    }

    struct AcceptingConsumer;

    #[async_trait]
    impl Consumer for AcceptingConsumer {
        fn routing_key(&self) -> &str {
            "k"
        }

        async fn consume(&self, _delivery: Delivery) -> Result<()> {
            Ok(())
        }
    }

    struct TagChannel {
        acks: Mutex<Vec<u64>>,
        nacks: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Channel for TagChannel {
        async fn declare_topology(
            &self,
            _topology: &super::super::transport::Topology,
        ) -> Result<()> {
            Ok(())
        }

        async fn set_prefetch(&self, _count: u16) -> Result<()> {
            Ok(())
        }

        async fn consume(
            &self,
            _queue_name: &str,
        ) -> Result<tokio::sync::mpsc::Receiver<super::super::transport::ChannelEvent>> {
            unimplemented!("not used in tests")
        }

        async fn basic_ack(&self, delivery_tag: u64, _multiple: bool) -> Result<()> {
            self.acks.lock().unwrap().push(delivery_tag);
            Ok(())
        }

        async fn basic_nack(&self, delivery_tag: u64, _multiple: bool) -> Result<()> {
            self.nacks.lock().unwrap().push(delivery_tag);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_acking_handler_acks_on_success_nacks_on_failure() {
        let tag_channel = Arc::new(TagChannel {
            acks: Mutex::new(Vec::new()),
            nacks: Mutex::new(Vec::new()),
        });
        let channel: Arc<dyn Channel> = tag_channel.clone();

        let ok_handler = AckingHandler::new(Arc::new(AcceptingConsumer));
        ok_handler
            .on_delivery(&channel, request_delivery(None))
            .await
            .unwrap();
        assert_eq!(*tag_channel.acks.lock().unwrap(), vec![1]);
        assert!(tag_channel.nacks.lock().unwrap().is_empty());

        let err_handler = AckingHandler::new(Arc::new(RejectingConsumer));
        let result = err_handler.on_delivery(&channel, request_delivery(None)).await;
        assert!(result.is_err());
        assert_eq!(*tag_channel.nacks.lock().unwrap(), vec![1]);
    }
}
