//! Publishing derived messages
//!
//! A [`Publisher`] is the only capability a directory processor gets: it
//! can enqueue further directories, products and collection inventories,
//! each routed to its fixed queue. [`BrokerPublisher`] implements it on top
//! of any broker session.

use crate::broker::{Delivery, MessageSink, QueueName};
use crate::consumer::ConsumerStats;
use crate::error::{EncodeError, PublishError, PublishResult};
use crate::message::{
    encode, CollectionInventoryMessage, CrawlMessage, DirectoryWorkItem, ProductMessage,
    QuarantinedMessage,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::trace;

/// Enqueue messages for other participants
///
/// Each call returns once the broker has stored the message, so a
/// processor that returns successfully has durably published everything
/// it derived.
pub trait Publisher {
    /// Enqueue a directory for traversal
    fn publish_directory(&mut self, item: &DirectoryWorkItem) -> PublishResult<()>;

    /// Enqueue a discovered product
    fn publish_product(&mut self, product: &ProductMessage) -> PublishResult<()>;

    /// Enqueue a discovered collection inventory
    fn publish_collection_inventory(
        &mut self,
        inventory: &CollectionInventoryMessage,
    ) -> PublishResult<()>;
}

/// [`Publisher`] over a broker session
pub struct BrokerPublisher<S: MessageSink> {
    sink: S,
    stats: Option<Arc<ConsumerStats>>,
}

impl<S: MessageSink> BrokerPublisher<S> {
    pub fn new(sink: S) -> Self {
        Self { sink, stats: None }
    }

    /// Count published messages in `stats`
    pub fn with_stats(sink: S, stats: Arc<ConsumerStats>) -> Self {
        Self {
            sink,
            stats: Some(stats),
        }
    }

    /// Encode `message` and send it to the queue of its kind
    pub fn publish<M: CrawlMessage>(&mut self, message: &M) -> PublishResult<()> {
        let payload = encode(message)?;
        let queue = M::KIND.queue();
        self.send(queue, &payload)?;

        if let Some(stats) = &self.stats {
            stats.record_published(M::KIND);
        }
        trace!(kind = %M::KIND, queue = %queue, "Published");
        Ok(())
    }

    /// Move a delivery to the quarantine queue, keeping its payload intact
    pub fn quarantine(&mut self, delivery: &Delivery, reason: &str) -> PublishResult<()> {
        let envelope = QuarantinedMessage {
            source_queue: delivery.queue.to_string(),
            delivery_count: delivery.delivery_count,
            reason: reason.to_string(),
            payload: delivery.payload.clone(),
            quarantined_at: Utc::now(),
        };

        let payload = serde_json::to_string(&envelope).map_err(|e| EncodeError {
            kind: "quarantined".to_string(),
            reason: e.to_string(),
        })?;
        self.send(QueueName::Quarantine, &payload)
    }

    fn send(&mut self, queue: QueueName, payload: &str) -> PublishResult<()> {
        self.sink.send(queue, payload).map_err(|source| {
            if let Some(stats) = &self.stats {
                stats.record_transport_error();
            }
            PublishError::Transport {
                queue: queue.to_string(),
                source,
            }
        })
    }

    pub fn into_inner(self) -> S {
        self.sink
    }
}

impl<S: MessageSink> Publisher for BrokerPublisher<S> {
    fn publish_directory(&mut self, item: &DirectoryWorkItem) -> PublishResult<()> {
        self.publish(item)
    }

    fn publish_product(&mut self, product: &ProductMessage) -> PublishResult<()> {
        self.publish(product)
    }

    fn publish_collection_inventory(
        &mut self,
        inventory: &CollectionInventoryMessage,
    ) -> PublishResult<()> {
        self.publish(inventory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TransportError, TransportResult};
    use crate::message::decode;

    /// Records sends; fails every send to `fail_on`
    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<(QueueName, String)>,
        fail_on: Option<QueueName>,
    }

    impl MessageSink for RecordingSink {
        fn send(&mut self, queue: QueueName, payload: &str) -> TransportResult<()> {
            if self.fail_on == Some(queue) {
                return Err(TransportError::OperationFailed("queue full".into()));
            }
            self.sent.push((queue, payload.to_string()));
            Ok(())
        }
    }

    #[test]
    fn test_routes_each_kind_to_its_queue() {
        let stats = Arc::new(ConsumerStats::default());
        let mut publisher = BrokerPublisher::with_stats(RecordingSink::default(), Arc::clone(&stats));

        let item = DirectoryWorkItem::root("job", "node", "/data");
        publisher.publish_directory(&item.child("/data/a")).unwrap();
        publisher
            .publish_product(&ProductMessage::from_item(&item, "/data/p.xml"))
            .unwrap();
        publisher
            .publish_collection_inventory(&CollectionInventoryMessage::from_item(&item, "/data/collection.csv"))
            .unwrap();

        let sink = publisher.into_inner();
        let queues: Vec<QueueName> = sink.sent.iter().map(|(q, _)| *q).collect();
        assert_eq!(
            queues,
            vec![QueueName::Directories, QueueName::Products, QueueName::Collections]
        );

        let child: DirectoryWorkItem = decode(&sink.sent[0].1).unwrap();
        assert_eq!(child.dir, "/data/a");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.published_directories, 1);
        assert_eq!(snapshot.published_products, 1);
        assert_eq!(snapshot.published_collections, 1);
    }

    #[test]
    fn test_transport_failure_names_queue() {
        let stats = Arc::new(ConsumerStats::default());
        let sink = RecordingSink {
            fail_on: Some(QueueName::Products),
            ..Default::default()
        };
        let mut publisher = BrokerPublisher::with_stats(sink, Arc::clone(&stats));

        let item = DirectoryWorkItem::root("job", "node", "/data");
        let err = publisher
            .publish_product(&ProductMessage::from_item(&item, "/data/p.xml"))
            .unwrap_err();

        match err {
            PublishError::Transport { queue, .. } => assert_eq!(queue, "harvest.products"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(stats.snapshot().transport_errors, 1);
        assert_eq!(stats.snapshot().published_products, 0);
    }

    #[test]
    fn test_quarantine_wraps_original_payload() {
        let mut publisher = BrokerPublisher::new(RecordingSink::default());
        let delivery = Delivery {
            tag: "7".into(),
            queue: QueueName::Directories,
            payload: "{\"dir\":\"/x\"}".into(),
            delivery_count: 6,
        };

        publisher.quarantine(&delivery, "too many deliveries").unwrap();

        let sink = publisher.into_inner();
        assert_eq!(sink.sent[0].0, QueueName::Quarantine);
        let envelope: QuarantinedMessage = serde_json::from_str(&sink.sent[0].1).unwrap();
        assert_eq!(envelope.source_queue, "harvest.dirs");
        assert_eq!(envelope.delivery_count, 6);
        assert_eq!(envelope.payload, delivery.payload);
    }
}
