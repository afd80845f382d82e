//! Directory-work consumers
//!
//! Both consumer models share one processing function,
//! [`handle_delivery`], which decodes a delivery, runs the directory
//! processor and reports an [`Outcome`]. Each model translates the outcome
//! into its own broker mechanism:
//!
//! | Outcome | Poll ([`poll::PollConsumer`]) | Push ([`push::PushConsumer`]) |
//! |---------|-------------------------------|-------------------------------|
//! | `Ack`   | ack                           | ack                           |
//! | `Drop`  | ack                           | ack                           |
//! | `Retry` | leave unacknowledged          | reject with requeue           |
//!
//! Poll-mode retries depend on the broker's session recovery (memory
//! broker: close or redelivery timeout; Redis: claim timeout). Push-mode
//! retries are immediate.

pub mod poll;
pub mod push;

pub use poll::{poll_once, PollConsumer};
pub use push::PushConsumer;

use crate::broker::{Delivery, MessageSink, QueueName};
use crate::error::DecodeError;
use crate::message::{decode, DirectoryWorkItem, MessageKind};
use crate::processor::DirectoryProcessor;
use crate::publisher::BrokerPublisher;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Default bounded wait of one poll
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(3000);

/// Lifecycle of a consumer
///
/// `Idle -> Running -> StopRequested -> Closed`; stopping an idle consumer
/// closes it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Idle = 0,
    Running = 1,
    StopRequested = 2,
    Closed = 3,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsumerState::Idle,
            1 => ConsumerState::Running,
            2 => ConsumerState::StopRequested,
            _ => ConsumerState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Idle => "idle",
            ConsumerState::Running => "running",
            ConsumerState::StopRequested => "stopping",
            ConsumerState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// [`ConsumerState`] shared between a consumer handle and its thread
#[derive(Debug)]
pub(crate) struct SharedState(AtomicU8);

impl SharedState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConsumerState::Idle as u8))
    }

    pub(crate) fn get(&self) -> ConsumerState {
        ConsumerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, state: ConsumerState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move `from -> to`; false if the current state is not `from`
    pub(crate) fn transition(&self, from: ConsumerState, to: ConsumerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Settings shared by both consumer models
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Queue to consume, normally the directory queue
    pub queue: QueueName,
    /// Bounded wait of one receive (poll model)
    pub poll_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: QueueName::Directories,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Result of handling one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; remove the message
    Ack,
    /// Processing failed; the message must become eligible for redelivery
    Retry,
    /// Never processable (or quarantined); remove without processing
    Drop,
}

/// Bound on redeliveries before a message is quarantined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// `None` retries forever
    pub max_redeliveries: Option<u32>,
}

impl RetryPolicy {
    /// Retry forever
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Quarantine after `max` redeliveries
    pub fn bounded(max: u32) -> Self {
        Self {
            max_redeliveries: Some(max),
        }
    }

    /// Whether a delivery has used up its redelivery budget
    pub fn is_exhausted(&self, delivery_count: u32) -> bool {
        match self.max_redeliveries {
            Some(max) => delivery_count.saturating_sub(1) > max,
            None => false,
        }
    }
}

/// Counters shared by the consumers of one crawl
#[derive(Debug, Default)]
pub struct ConsumerStats {
    /// Deliveries received
    pub received: AtomicU64,
    /// Deliveries acknowledged after successful processing
    pub acked: AtomicU64,
    /// Deliveries handed back for redelivery
    pub retried: AtomicU64,
    /// Deliveries dropped as undecodable
    pub dropped: AtomicU64,
    /// Deliveries moved to the quarantine queue
    pub quarantined: AtomicU64,
    pub published_directories: AtomicU64,
    pub published_products: AtomicU64,
    pub published_collections: AtomicU64,
    /// Failed receive/ack/reject/send calls
    pub transport_errors: AtomicU64,
}

impl ConsumerStats {
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quarantined(&self) {
        self.quarantined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self, kind: MessageKind) {
        let counter = match kind {
            MessageKind::Directory => &self.published_directories,
            MessageKind::Product => &self.published_products,
            MessageKind::CollectionInventory => &self.published_collections,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
            published_directories: self.published_directories.load(Ordering::Relaxed),
            published_products: self.published_products.load(Ordering::Relaxed),
            published_collections: self.published_collections.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`ConsumerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub retried: u64,
    pub dropped: u64,
    pub quarantined: u64,
    pub published_directories: u64,
    pub published_products: u64,
    pub published_collections: u64,
    pub transport_errors: u64,
}

/// Decode and process one directory delivery
///
/// Never fails: every failure is logged and folded into the outcome.
/// Resolving the delivery with the broker is left to the caller.
pub fn handle_delivery<P, S>(
    consumer: usize,
    delivery: &Delivery,
    processor: &mut P,
    publisher: &mut BrokerPublisher<S>,
    policy: &RetryPolicy,
    stats: &ConsumerStats,
) -> Outcome
where
    P: DirectoryProcessor + ?Sized,
    S: MessageSink,
{
    stats.record_received();

    if policy.is_exhausted(delivery.delivery_count) {
        let reason = format!(
            "exceeded {} redeliveries",
            policy.max_redeliveries.unwrap_or_default()
        );
        return match publisher.quarantine(delivery, &reason) {
            Ok(()) => {
                warn!(
                    consumer,
                    tag = %delivery.tag,
                    deliveries = delivery.delivery_count,
                    "Message quarantined"
                );
                stats.record_quarantined();
                Outcome::Drop
            }
            Err(e) => {
                error!(consumer, tag = %delivery.tag, error = %e, "Quarantine failed, will retry");
                stats.record_retried();
                Outcome::Retry
            }
        };
    }

    let item: DirectoryWorkItem = match decode(&delivery.payload) {
        Ok(item) => item,
        Err(e) => {
            log_decode_failure(consumer, delivery, &e);
            stats.record_dropped();
            return Outcome::Drop;
        }
    };

    if delivery.is_redelivery() {
        debug!(consumer, dir = %item.dir, deliveries = delivery.delivery_count, "Redelivered directory");
    }

    match processor.process(&item, publisher) {
        Ok(()) => {
            trace!(consumer, dir = %item.dir, "Directory processed");
            Outcome::Ack
        }
        Err(e) => {
            warn!(consumer, dir = %item.dir, error = %e, "Directory processing failed");
            stats.record_retried();
            Outcome::Retry
        }
    }
}

fn log_decode_failure(consumer: usize, delivery: &Delivery, err: &DecodeError) {
    const PREVIEW: usize = 200;
    let preview: String = delivery.payload.chars().take(PREVIEW).collect();
    error!(
        consumer,
        tag = %delivery.tag,
        error = %err,
        payload = %preview,
        "Dropping undecodable message"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::QueueName;
    use crate::error::{ProcessingError, TransportError, TransportResult};
    use crate::message::{encode, ProductMessage, QuarantinedMessage};
    use crate::processor::from_fn;

    #[derive(Default)]
    struct VecSink {
        sent: Vec<(QueueName, String)>,
        broken: bool,
    }

    impl MessageSink for VecSink {
        fn send(&mut self, queue: QueueName, payload: &str) -> TransportResult<()> {
            if self.broken {
                return Err(TransportError::Closed);
            }
            self.sent.push((queue, payload.to_string()));
            Ok(())
        }
    }

    fn delivery_of(payload: String, delivery_count: u32) -> Delivery {
        Delivery {
            tag: "1".into(),
            queue: QueueName::Directories,
            payload,
            delivery_count,
        }
    }

    fn item_delivery(delivery_count: u32) -> Delivery {
        let item = DirectoryWorkItem::root("job", "node", "/data");
        delivery_of(encode(&item).unwrap(), delivery_count)
    }

    #[test]
    fn test_retry_policy() {
        let unbounded = RetryPolicy::unbounded();
        assert!(!unbounded.is_exhausted(1_000));

        let bounded = RetryPolicy::bounded(2);
        assert!(!bounded.is_exhausted(1));
        assert!(!bounded.is_exhausted(3));
        assert!(bounded.is_exhausted(4));

        assert!(RetryPolicy::bounded(0).is_exhausted(2));
    }

    #[test]
    fn test_success_acks() {
        let stats = ConsumerStats::default();
        let mut publisher = BrokerPublisher::new(VecSink::default());
        let mut processor = from_fn(|item, p| {
            p.publish_product(&ProductMessage::from_item(item, "/data/a.xml"))?;
            Ok(())
        });

        let outcome = handle_delivery(0, &item_delivery(1), &mut processor, &mut publisher, &RetryPolicy::default(), &stats);

        assert_eq!(outcome, Outcome::Ack);
        assert_eq!(publisher.into_inner().sent.len(), 1);
        assert_eq!(stats.snapshot().received, 1);
    }

    #[test]
    fn test_failure_retries() {
        let stats = ConsumerStats::default();
        let mut publisher = BrokerPublisher::new(VecSink::default());
        let mut processor = from_fn(|_, _| Err(ProcessingError::Failed("disk on fire".into())));

        let outcome = handle_delivery(0, &item_delivery(1), &mut processor, &mut publisher, &RetryPolicy::default(), &stats);

        assert_eq!(outcome, Outcome::Retry);
        assert_eq!(stats.snapshot().retried, 1);
    }

    #[test]
    fn test_undecodable_drops_without_processing() {
        let stats = ConsumerStats::default();
        let mut publisher = BrokerPublisher::new(VecSink::default());
        let mut calls = 0;
        let mut processor = from_fn(|_, _| {
            calls += 1;
            Ok(())
        });

        let outcome = handle_delivery(
            0,
            &delivery_of("{not json".into(), 1),
            &mut processor,
            &mut publisher,
            &RetryPolicy::default(),
            &stats,
        );

        assert_eq!(outcome, Outcome::Drop);
        assert_eq!(calls, 0);
        assert_eq!(stats.snapshot().dropped, 1);
    }

    #[test]
    fn test_exhausted_delivery_is_quarantined() {
        let stats = ConsumerStats::default();
        let mut publisher = BrokerPublisher::new(VecSink::default());
        let mut calls = 0;
        let mut processor = from_fn(|_, _| {
            calls += 1;
            Ok(())
        });
        let delivery = item_delivery(4);

        let outcome = handle_delivery(0, &delivery, &mut processor, &mut publisher, &RetryPolicy::bounded(2), &stats);

        assert_eq!(outcome, Outcome::Drop);
        assert_eq!(calls, 0);
        assert_eq!(stats.snapshot().quarantined, 1);

        let sent = publisher.into_inner().sent;
        assert_eq!(sent[0].0, QueueName::Quarantine);
        let envelope: QuarantinedMessage = serde_json::from_str(&sent[0].1).unwrap();
        assert_eq!(envelope.payload, delivery.payload);
        assert_eq!(envelope.delivery_count, 4);
    }

    #[test]
    fn test_failed_quarantine_retries() {
        let stats = ConsumerStats::default();
        let mut publisher = BrokerPublisher::new(VecSink {
            broken: true,
            ..Default::default()
        });
        let mut processor = from_fn(|_, _| Ok(()));

        let outcome = handle_delivery(0, &item_delivery(9), &mut processor, &mut publisher, &RetryPolicy::bounded(1), &stats);

        assert_eq!(outcome, Outcome::Retry);
        assert_eq!(stats.snapshot().quarantined, 0);
    }
}
