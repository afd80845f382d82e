//! In-process broker
//!
//! Each queue is an unbounded crossbeam MPMC channel, so several consumers
//! receiving from the same queue compete for messages and every message is
//! handed to exactly one of them. Delivered messages are tracked per session
//! until they are acknowledged:
//!
//! - `ack` forgets the message
//! - `reject(requeue = true)` and session recovery put it back on the queue
//! - an optional redelivery timeout requeues messages left unacknowledged
//!   for too long, the way a broker recovers a stalled session
//!
//! Messages are held in memory only; nothing survives the process.

use crate::broker::{Acknowledger, Broker, Delivery, MessageSink, PollSession, QueueName, QueueStatus};
use crate::error::{TransportError, TransportResult};
use crossbeam_channel::{unbounded, Receiver, Select, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Configuration for the in-process broker
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Requeue deliveries left unacknowledged for this long
    pub redelivery_timeout: Option<Duration>,
    /// Bounded wait used by push delivery threads
    pub dispatch_interval: Duration,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            redelivery_timeout: None,
            dispatch_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: String,
    /// Number of times this message was delivered so far
    deliveries: u32,
}

struct Channel {
    sender: Sender<StoredMessage>,
    receiver: Receiver<StoredMessage>,
}

struct Unacked {
    queue: QueueName,
    message: StoredMessage,
    session: u64,
    delivered_at: Instant,
}

struct Inner {
    config: MemoryBrokerConfig,
    channels: [Channel; 4],
    unacked: Mutex<HashMap<u64, Unacked>>,
    next_tag: AtomicU64,
    next_session: AtomicU64,
}

/// In-process broker shared by cloning
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create a broker with default configuration
    pub fn new() -> Self {
        Self::with_config(MemoryBrokerConfig::default())
    }

    /// Create a broker with the given configuration
    pub fn with_config(config: MemoryBrokerConfig) -> Self {
        let channel = || {
            let (sender, receiver) = unbounded();
            Channel { sender, receiver }
        };

        Self {
            inner: Arc::new(Inner {
                config,
                channels: [channel(), channel(), channel(), channel()],
                unacked: Mutex::new(HashMap::new()),
                next_tag: AtomicU64::new(1),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Broker configuration
    pub fn config(&self) -> &MemoryBrokerConfig {
        &self.inner.config
    }

    fn channel(&self, queue: QueueName) -> &Channel {
        &self.inner.channels[queue.index()]
    }

    /// Enqueue a payload directly (seeding, tests)
    pub fn enqueue(&self, queue: QueueName, payload: &str) {
        self.push(queue, StoredMessage {
            payload: payload.to_string(),
            deliveries: 0,
        });
    }

    fn push(&self, queue: QueueName, message: StoredMessage) {
        // The broker owns both channel ends, so send cannot fail
        let _ = self.channel(queue).sender.send(message);
    }

    /// Messages waiting for delivery
    pub fn ready_count(&self, queue: QueueName) -> usize {
        self.channel(queue).receiver.len()
    }

    /// Messages delivered but not yet resolved
    pub fn unacked_count(&self, queue: QueueName) -> usize {
        self.inner
            .unacked
            .lock()
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Remove and return every ready payload of a queue
    ///
    /// Used to inspect sink-only queues (products, inventories, quarantine)
    /// that no consumer in this crate drains.
    pub fn drain(&self, queue: QueueName) -> Vec<String> {
        self.channel(queue)
            .receiver
            .try_iter()
            .map(|m| m.payload)
            .collect()
    }

    fn receive(&self, session: u64, queue: QueueName, timeout: Duration) -> Option<Delivery> {
        self.requeue_expired(queue);

        let receiver = &self.channel(queue).receiver;
        let deadline = Instant::now() + timeout;

        loop {
            // Move from channel to unacked table under the lock, so
            // queue_status always sees the message in one of them
            {
                let mut unacked = self.inner.unacked.lock();
                if let Ok(mut message) = receiver.try_recv() {
                    let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed);
                    message.deliveries += 1;

                    let delivery = Delivery {
                        tag: tag.to_string(),
                        queue,
                        payload: message.payload.clone(),
                        delivery_count: message.deliveries,
                    };
                    unacked.insert(
                        tag,
                        Unacked {
                            queue,
                            message,
                            session,
                            delivered_at: Instant::now(),
                        },
                    );

                    trace!(session, tag, queue = %queue, "Delivered");
                    return Some(delivery);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let mut select = Select::new();
            select.recv(receiver);
            if select.ready_timeout(remaining).is_err() {
                return None;
            }
        }
    }

    /// Requeue deliveries of `queue` older than the redelivery timeout
    fn requeue_expired(&self, queue: QueueName) {
        let Some(timeout) = self.inner.config.redelivery_timeout else {
            return;
        };

        let mut unacked = self.inner.unacked.lock();
        let expired: Vec<u64> = unacked
            .iter()
            .filter(|(_, u)| u.queue == queue && u.delivered_at.elapsed() >= timeout)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in &expired {
            if let Some(u) = unacked.remove(tag) {
                self.push(queue, u.message);
            }
        }
        drop(unacked);

        if !expired.is_empty() {
            debug!(queue = %queue, count = expired.len(), "Requeued expired deliveries");
        }
    }

    /// Take a delivery out of the unacked table, checking ownership, and
    /// optionally put it back on its queue
    fn resolve(&self, session: u64, delivery: &Delivery, requeue: bool) -> TransportResult<()> {
        let unknown = || TransportError::UnknownDelivery {
            queue: delivery.queue.to_string(),
            tag: delivery.tag.clone(),
        };

        let tag: u64 = delivery.tag.parse().map_err(|_| unknown())?;
        let mut unacked = self.inner.unacked.lock();

        match unacked.get(&tag) {
            Some(u) if u.session == session && u.queue == delivery.queue => {}
            _ => return Err(unknown()),
        }
        let resolved = unacked.remove(&tag).ok_or_else(unknown)?;
        if requeue {
            self.push(resolved.queue, resolved.message);
        }
        Ok(())
    }

    /// Return every unacknowledged delivery of a session to its queue
    fn recover_session(&self, session: u64) -> usize {
        let mut unacked = self.inner.unacked.lock();
        let tags: Vec<u64> = unacked
            .iter()
            .filter(|(_, u)| u.session == session)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in &tags {
            if let Some(u) = unacked.remove(tag) {
                self.push(u.queue, u.message);
            }
        }
        tags.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Broker for MemoryBroker {
    type Session = MemorySession;

    fn open_session(&self) -> TransportResult<MemorySession> {
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        Ok(MemorySession {
            broker: self.clone(),
            id,
            closed: false,
        })
    }

    fn queue_status(&self, queue: QueueName) -> TransportResult<QueueStatus> {
        // Both counts under one lock: receive, requeue and recovery move
        // messages while holding it
        let unacked = self.inner.unacked.lock();
        let in_flight = unacked.values().filter(|u| u.queue == queue).count();
        let ready = self.ready_count(queue);
        drop(unacked);

        Ok(QueueStatus {
            queue,
            ready: ready as u64,
            unacked: in_flight as u64,
        })
    }

    fn dispatch_interval(&self) -> Duration {
        self.inner.config.dispatch_interval
    }
}

/// Session on a [`MemoryBroker`]
///
/// Closing or dropping the session returns its unacknowledged deliveries
/// to their queues.
pub struct MemorySession {
    broker: MemoryBroker,
    id: u64,
    closed: bool,
}

impl MemorySession {
    /// Session identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Redeliver every unacknowledged message of this session
    pub fn recover(&mut self) -> usize {
        let count = self.broker.recover_session(self.id);
        if count > 0 {
            debug!(session = self.id, count, "Recovered unacknowledged deliveries");
        }
        count
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl MessageSink for MemorySession {
    fn send(&mut self, queue: QueueName, payload: &str) -> TransportResult<()> {
        self.ensure_open()?;
        self.broker.enqueue(queue, payload);
        Ok(())
    }
}

impl Acknowledger for MemorySession {
    fn ack(&mut self, delivery: &Delivery) -> TransportResult<()> {
        self.ensure_open()?;
        self.broker.resolve(self.id, delivery, false)
    }

    fn reject(&mut self, delivery: &Delivery, requeue: bool) -> TransportResult<()> {
        self.ensure_open()?;
        self.broker.resolve(self.id, delivery, requeue)
    }
}

impl PollSession for MemorySession {
    fn receive(&mut self, queue: QueueName, timeout: Duration) -> TransportResult<Option<Delivery>> {
        self.ensure_open()?;
        Ok(self.broker.receive(self.id, queue, timeout))
    }

    fn close(&mut self) -> TransportResult<()> {
        if !self.closed {
            self.recover();
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
