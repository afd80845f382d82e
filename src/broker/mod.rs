//! Broker transport abstraction
//!
//! The crawler talks to its broker through a handful of small traits so the
//! consumers never depend on which broker is in use:
//!
//! ```text
//!   MessageSink ──── send(queue, payload)            (persistent enqueue)
//!   Acknowledger ─── ack(delivery) / reject(delivery, requeue)
//!   PollSession ──── receive(queue, timeout) + close()  (pull model)
//!   Broker ───────── open_session() + subscribe(..)     (push model)
//! ```
//!
//! Two implementations are provided:
//! - [`memory::MemoryBroker`]: in-process queues, used for single-process
//!   crawls and tests
//! - [`redis_streams::RedisBroker`]: Redis Streams with consumer groups
//!
//! Push delivery is built on top of a session: [`Broker::subscribe`] moves a
//! session onto a broker-owned delivery thread that calls the registered
//! [`DeliveryHandler`] once per message.

pub mod memory;
pub mod redis_streams;

pub use memory::{MemoryBroker, MemoryBrokerConfig, MemorySession};
pub use redis_streams::{RedisBroker, RedisBrokerConfig, RedisSession};

use crate::error::{TransportError, TransportResult};
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Durable directory-work queue (drained and fed by the traversal)
pub const DIRECTORY_QUEUE: &str = "harvest.dirs";

/// Durable product queue
pub const PRODUCT_QUEUE: &str = "harvest.products";

/// Durable collection-inventory queue
pub const COLLECTION_QUEUE: &str = "harvest.collections";

/// Queue receiving messages that exhausted their redelivery budget
pub const QUARANTINE_QUEUE: &str = "harvest.quarantine";

/// Pause after a failed receive before trying again
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// The fixed set of queues shared by all participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueName {
    /// Directory work items
    Directories,
    /// Discovered products
    Products,
    /// Collection inventories
    Collections,
    /// Poison messages
    Quarantine,
}

impl QueueName {
    /// All queues, in a stable order
    pub const ALL: [QueueName; 4] = [
        QueueName::Directories,
        QueueName::Products,
        QueueName::Collections,
        QueueName::Quarantine,
    ];

    /// Broker-level queue name
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Directories => DIRECTORY_QUEUE,
            QueueName::Products => PRODUCT_QUEUE,
            QueueName::Collections => COLLECTION_QUEUE,
            QueueName::Quarantine => QUARANTINE_QUEUE,
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            QueueName::Directories => 0,
            QueueName::Products => 1,
            QueueName::Collections => 2,
            QueueName::Quarantine => 3,
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for QueueName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One message handed to a consumer
///
/// Owned by the broker until it is acknowledged or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned identity of this delivery
    pub tag: String,
    /// Queue the message came from
    pub queue: QueueName,
    /// Encoded message text
    pub payload: String,
    /// Delivery attempt, starting at 1
    pub delivery_count: u32,
}

impl Delivery {
    /// Whether the message was delivered before
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Message counts for one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queue: QueueName,
    /// Waiting to be delivered
    pub ready: u64,
    /// Delivered but not yet acknowledged
    pub unacked: u64,
}

impl QueueStatus {
    /// No stored messages at all
    pub fn is_drained(&self) -> bool {
        self.ready == 0 && self.unacked == 0
    }
}

/// Persistent enqueue of encoded messages
///
/// A sink is bound to one broker session and is not safe for concurrent use.
pub trait MessageSink {
    /// Enqueue `payload`; returns once the broker has stored it
    fn send(&mut self, queue: QueueName, payload: &str) -> TransportResult<()>;
}

impl<S: MessageSink + ?Sized> MessageSink for &mut S {
    fn send(&mut self, queue: QueueName, payload: &str) -> TransportResult<()> {
        (**self).send(queue, payload)
    }
}

/// Resolution of a delivery
pub trait Acknowledger {
    /// Permanently remove the message from its queue
    fn ack(&mut self, delivery: &Delivery) -> TransportResult<()>;

    /// Give the message back; with `requeue` it becomes deliverable again,
    /// otherwise it is discarded
    fn reject(&mut self, delivery: &Delivery, requeue: bool) -> TransportResult<()>;
}

/// Pull-model session: bounded-wait receive with manual acknowledgment
pub trait PollSession: MessageSink + Acknowledger + Send {
    /// Wait at most `timeout` for the next message; `Ok(None)` on timeout
    fn receive(&mut self, queue: QueueName, timeout: Duration) -> TransportResult<Option<Delivery>>;

    /// Release the session; unacknowledged deliveries become eligible for
    /// redelivery
    fn close(&mut self) -> TransportResult<()>;
}

/// Push-model callback
///
/// Runs on the broker's delivery thread. It must resolve every delivery
/// (ack or reject) before returning and must not block indefinitely.
pub trait DeliveryHandler: Send + 'static {
    fn handle_delivery(&mut self, delivery: Delivery, acker: &mut dyn Acknowledger);
}

/// A message broker
pub trait Broker: Send + Sync + 'static {
    /// Session type handed to poll consumers and delivery threads
    type Session: PollSession + 'static;

    /// Open a new session with its own connection/channel
    fn open_session(&self) -> TransportResult<Self::Session>;

    /// Current message counts for a queue
    fn queue_status(&self, queue: QueueName) -> TransportResult<QueueStatus>;

    /// Bounded wait used by push delivery threads between cancellation checks
    fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(250)
    }

    /// Register `handler` for every message on `queue` (manual ack mode)
    ///
    /// Deliveries run on a dedicated thread owned by the returned
    /// [`Subscription`]. Several subscriptions on the same queue compete for
    /// messages; each message goes to exactly one of them.
    fn subscribe(
        &self,
        queue: QueueName,
        consumer_tag: &str,
        handler: Box<dyn DeliveryHandler>,
    ) -> TransportResult<Subscription> {
        let session = self.open_session()?;
        Subscription::spawn(consumer_tag, queue, session, handler, self.dispatch_interval())
    }
}

/// Active push registration
///
/// Cancelling stops further deliveries; a callback already running
/// completes first. Dropping the subscription cancels and waits.
pub struct Subscription {
    consumer_tag: String,
    queue: QueueName,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Move `session` onto a new delivery thread
    pub fn spawn<S: PollSession + 'static>(
        consumer_tag: &str,
        queue: QueueName,
        session: S,
        handler: Box<dyn DeliveryHandler>,
        interval: Duration,
    ) -> TransportResult<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_clone = Arc::clone(&cancel);
        let tag = consumer_tag.to_string();

        let handle = thread::Builder::new()
            .name(format!("deliver-{}", consumer_tag))
            .spawn(move || dispatch_loop(&tag, queue, session, handler, interval, &cancel_clone))
            .map_err(|e| TransportError::OperationFailed(format!("spawn delivery thread: {}", e)))?;

        info!(consumer = consumer_tag, queue = %queue, "Subscribed");

        Ok(Self {
            consumer_tag: consumer_tag.to_string(),
            queue,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// Whether the delivery thread is still running
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop further deliveries
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Wait for the delivery thread to exit
    ///
    /// Only returns after [`cancel`](Self::cancel) or a fatal thread error.
    pub fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(consumer = %self.consumer_tag, "Delivery thread panicked");
            }
        }
    }

    /// Cancel and wait
    pub fn unsubscribe(mut self) {
        self.cancel();
        self.wait();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer_tag", &self.consumer_tag)
            .field("queue", &self.queue)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Delivery thread body shared by every broker
fn dispatch_loop<S: PollSession>(
    consumer_tag: &str,
    queue: QueueName,
    mut session: S,
    mut handler: Box<dyn DeliveryHandler>,
    interval: Duration,
    cancel: &AtomicBool,
) {
    debug!(consumer = consumer_tag, "Delivery loop starting");

    while !cancel.load(Ordering::Relaxed) {
        match session.receive(queue, interval) {
            Ok(Some(delivery)) => handler.handle_delivery(delivery, &mut session),
            Ok(None) => {}
            Err(e) => {
                warn!(consumer = consumer_tag, error = %e, "Receive failed");
                thread::sleep(interval.min(RECEIVE_ERROR_BACKOFF));
            }
        }
    }

    if let Err(e) = session.close() {
        debug!(consumer = consumer_tag, error = %e, "Failed to close session");
    }

    debug!(consumer = consumer_tag, "Delivery loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names_are_fixed() {
        assert_eq!(QueueName::Directories.as_str(), "harvest.dirs");
        assert_eq!(QueueName::Products.as_str(), "harvest.products");
        assert_eq!(QueueName::Collections.as_str(), "harvest.collections");
        assert_eq!(QueueName::Quarantine.as_str(), "harvest.quarantine");

        for (i, q) in QueueName::ALL.iter().enumerate() {
            assert_eq!(q.index(), i);
        }
    }

    #[test]
    fn test_queue_status_serializes_name() {
        let status = QueueStatus {
            queue: QueueName::Products,
            ready: 3,
            unacked: 1,
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["queue"], "harvest.products");
        assert!(!status.is_drained());
    }
}
