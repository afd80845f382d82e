//! Push-model consumer
//!
//! Registers a callback with the broker; the broker's delivery thread
//! invokes it once per message. A failed item is rejected with requeue
//! exactly once, making it immediately eligible for redelivery to this or
//! any other consumer.

use crate::broker::{Acknowledger, Broker, Delivery, DeliveryHandler, MessageSink, Subscription};
use crate::consumer::{handle_delivery, ConsumerConfig, ConsumerState, ConsumerStats, Outcome};
use crate::error::WorkerError;
use crate::processor::DirectoryProcessor;
use crate::publisher::BrokerPublisher;
use std::sync::Arc;
use tracing::{info, warn};

/// Callback state owned by the delivery thread
struct PushHandler<S: MessageSink, P> {
    consumer: usize,
    config: ConsumerConfig,
    publisher: BrokerPublisher<S>,
    processor: P,
    stats: Arc<ConsumerStats>,
}

impl<S, P> DeliveryHandler for PushHandler<S, P>
where
    S: MessageSink + Send + 'static,
    P: DirectoryProcessor + 'static,
{
    fn handle_delivery(&mut self, delivery: Delivery, acker: &mut dyn Acknowledger) {
        let consumer = self.consumer;
        let outcome = handle_delivery(
            consumer,
            &delivery,
            &mut self.processor,
            &mut self.publisher,
            &self.config.retry_policy,
            &self.stats,
        );

        let result = match outcome {
            Outcome::Ack => acker.ack(&delivery).map(|()| self.stats.record_acked()),
            Outcome::Drop => acker.ack(&delivery),
            Outcome::Retry => acker.reject(&delivery, true),
        };

        if let Err(e) = result {
            self.stats.record_transport_error();
            warn!(consumer, tag = %delivery.tag, ?outcome, error = %e, "Failed to resolve delivery");
        }
    }
}

/// Push consumer: one broker subscription plus one publishing session
pub struct PushConsumer {
    id: usize,
    config: ConsumerConfig,
    state: ConsumerState,
    stats: Arc<ConsumerStats>,
    subscription: Option<Subscription>,
}

impl PushConsumer {
    pub fn new(id: usize, config: ConsumerConfig, stats: Arc<ConsumerStats>) -> Self {
        Self {
            id,
            config,
            state: ConsumerState::Idle,
            stats,
            subscription: None,
        }
    }

    /// Get consumer ID
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ConsumerState {
        match (&self.subscription, self.state) {
            // Delivery thread died on its own
            (Some(sub), ConsumerState::Running) if !sub.is_active() => ConsumerState::Closed,
            (_, state) => state,
        }
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    /// Consumer tag used for the subscription
    pub fn tag(&self) -> String {
        format!("push-consumer-{}", self.id)
    }

    /// Subscribe to the configured queue on `broker`
    pub fn start<B, P>(&mut self, broker: &B, processor: P) -> Result<(), WorkerError>
    where
        B: Broker,
        P: DirectoryProcessor + 'static,
    {
        let id = self.id;
        if self.state != ConsumerState::Idle {
            return Err(WorkerError::InvalidState {
                id,
                action: "start",
                state: self.state.to_string(),
            });
        }

        let init_failed = |e: crate::error::TransportError| WorkerError::InitFailed {
            id,
            reason: e.to_string(),
        };

        let session = broker.open_session().map_err(init_failed)?;
        let handler = PushHandler {
            consumer: id,
            config: self.config.clone(),
            publisher: BrokerPublisher::with_stats(session, Arc::clone(&self.stats)),
            processor,
            stats: Arc::clone(&self.stats),
        };

        let subscription = broker
            .subscribe(self.config.queue, &self.tag(), Box::new(handler))
            .map_err(init_failed)?;

        info!(consumer = id, queue = %self.config.queue, "Push consumer started");
        self.subscription = Some(subscription);
        self.state = ConsumerState::Running;
        Ok(())
    }

    /// Cancel the subscription; a callback in progress completes first
    pub fn stop(&mut self) {
        match self.state {
            ConsumerState::Running => {
                if let Some(sub) = &self.subscription {
                    sub.cancel();
                }
                self.state = ConsumerState::StopRequested;
            }
            ConsumerState::Idle => self.state = ConsumerState::Closed,
            _ => {}
        }
    }

    /// Wait for the delivery thread to exit
    pub fn join(&mut self) -> Result<(), WorkerError> {
        if let Some(mut sub) = self.subscription.take() {
            sub.cancel();
            sub.wait();
            self.state = ConsumerState::Closed;
            info!(consumer = self.id, "Push consumer stopped");
        }
        Ok(())
    }
}

impl Drop for PushConsumer {
    fn drop(&mut self) {
        self.stop();
        let _ = self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, QueueName};
    use crate::error::{ProcessingError, TransportResult};
    use crate::message::{encode, DirectoryWorkItem};
    use crate::processor::from_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[derive(Default)]
    struct RecordingAcker {
        acks: Vec<String>,
        rejects: Vec<(String, bool)>,
    }

    impl Acknowledger for RecordingAcker {
        fn ack(&mut self, delivery: &Delivery) -> TransportResult<()> {
            self.acks.push(delivery.tag.clone());
            Ok(())
        }

        fn reject(&mut self, delivery: &Delivery, requeue: bool) -> TransportResult<()> {
            self.rejects.push((delivery.tag.clone(), requeue));
            Ok(())
        }
    }

    struct DiscardSink;

    impl MessageSink for DiscardSink {
        fn send(&mut self, _queue: QueueName, _payload: &str) -> TransportResult<()> {
            Ok(())
        }
    }

    fn delivery(tag: &str, payload: String) -> Delivery {
        Delivery {
            tag: tag.to_string(),
            queue: QueueName::Directories,
            payload,
            delivery_count: 1,
        }
    }

    #[test]
    fn test_outcomes_map_to_ack_and_reject() {
        let stats = Arc::new(ConsumerStats::default());
        let mut handler = PushHandler {
            consumer: 0,
            config: ConsumerConfig::default(),
            publisher: BrokerPublisher::with_stats(DiscardSink, Arc::clone(&stats)),
            processor: from_fn(|item, _| {
                if item.dir == "/fail" {
                    Err(ProcessingError::Failed("listing failed".into()))
                } else {
                    Ok(())
                }
            }),
            stats: Arc::clone(&stats),
        };
        let encoded = |dir: &str| encode(&DirectoryWorkItem::root("job", "node", dir)).unwrap();

        // Retry: exactly one requeueing reject, no ack
        let mut acker = RecordingAcker::default();
        handler.handle_delivery(delivery("retry", encoded("/fail")), &mut acker);
        assert!(acker.acks.is_empty());
        assert_eq!(acker.rejects, vec![("retry".to_string(), true)]);

        // Ack
        let mut acker = RecordingAcker::default();
        handler.handle_delivery(delivery("ok", encoded("/data")), &mut acker);
        assert_eq!(acker.acks, vec!["ok".to_string()]);
        assert!(acker.rejects.is_empty());

        // Drop
        let mut acker = RecordingAcker::default();
        handler.handle_delivery(delivery("bad", "{garbage".to_string()), &mut acker);
        assert_eq!(acker.acks, vec!["bad".to_string()]);
        assert!(acker.rejects.is_empty());

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.acked, 1);
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.dropped, 1);
    }

    #[test]
    fn test_failure_requeues_then_succeeds() {
        let broker = MemoryBroker::new();
        let item = DirectoryWorkItem::root("job", "node", "/data");
        broker.enqueue(QueueName::Directories, &encode(&item).unwrap());

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let processor = from_fn(move |_, _| {
            if calls_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ProcessingError::Failed("first attempt".into()))
            } else {
                Ok(())
            }
        });

        let stats = Arc::new(ConsumerStats::default());
        let mut consumer = PushConsumer::new(0, ConsumerConfig::default(), Arc::clone(&stats));
        consumer.start(&broker, processor).unwrap();
        assert_eq!(consumer.state(), ConsumerState::Running);

        assert!(wait_until(Duration::from_secs(5), || stats.snapshot().acked == 1));
        consumer.stop();
        consumer.join().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.retried, 1);
        assert!(broker.queue_status(QueueName::Directories).unwrap().is_drained());
        assert_eq!(consumer.state(), ConsumerState::Closed);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let broker = MemoryBroker::new();
        let stats = Arc::new(ConsumerStats::default());
        let mut consumer = PushConsumer::new(1, ConsumerConfig::default(), stats);

        consumer.start(&broker, from_fn(|_, _| Ok(()))).unwrap();
        assert!(consumer.start(&broker, from_fn(|_, _| Ok(()))).is_err());
    }
}
