//! Crawl coordinator - runs the consumers of one crawler process
//!
//! The coordinator is responsible for:
//! - Optionally seeding the crawl with its root directory
//! - Starting N consumers of one model, each with its own session and processor
//! - Waiting for a shutdown signal or, optionally, an idle directory queue
//! - Stopping and joining consumers and aggregating their statistics
//!
//! Several crawler processes may share one broker; each runs its own
//! coordinator and the broker spreads directory work across all of them.

use crate::broker::{Broker, PollSession, QueueName};
use crate::config::ConsumerMode;
use crate::consumer::{ConsumerConfig, ConsumerStats, PollConsumer, PushConsumer, StatsSnapshot};
use crate::error::{Result, WorkerError};
use crate::message::DirectoryWorkItem;
use crate::processor::DirectoryProcessor;
use crate::publisher::{BrokerPublisher, Publisher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Consecutive idle checks required before an idle crawl finishes
const STABLE_CHECKS_REQUIRED: u32 = 3;

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub mode: ConsumerMode,
    pub consumer_count: usize,
    pub consumer: ConsumerConfig,
    /// Finish once the consumed queue stays empty
    pub exit_when_idle: bool,
    /// Interval of shutdown/idle checks and progress callbacks
    pub check_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mode: ConsumerMode::Poll,
            consumer_count: 1,
            consumer: ConsumerConfig::default(),
            exit_when_idle: false,
            check_interval: Duration::from_millis(100),
        }
    }
}

/// Result of a finished crawl
#[derive(Debug, Clone)]
pub struct CrawlResult {
    /// Deliveries received (redeliveries included)
    pub received: u64,
    /// Deliveries acknowledged after successful processing
    pub acked: u64,
    /// Deliveries handed back for redelivery
    pub retried: u64,
    /// Undecodable deliveries dropped
    pub dropped: u64,
    /// Deliveries moved to the quarantine queue
    pub quarantined: u64,
    pub published_directories: u64,
    pub published_products: u64,
    pub published_collections: u64,
    /// Failed broker calls
    pub transport_errors: u64,
    /// Time taken for the crawl
    pub duration: Duration,
    /// Whether the crawl ran until the queue was idle (vs was interrupted)
    pub completed: bool,
}

impl CrawlResult {
    fn from_snapshot(stats: StatsSnapshot, duration: Duration, completed: bool) -> Self {
        Self {
            received: stats.received,
            acked: stats.acked,
            retried: stats.retried,
            dropped: stats.dropped,
            quarantined: stats.quarantined,
            published_directories: stats.published_directories,
            published_products: stats.published_products,
            published_collections: stats.published_collections,
            transport_errors: stats.transport_errors,
            duration,
            completed,
        }
    }

    /// Calculate directories per second rate
    pub fn dirs_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.acked as f64 / secs
        } else {
            0.0
        }
    }
}

/// Progress information for display
#[derive(Debug, Clone)]
pub struct CrawlProgress {
    pub stats: StatsSnapshot,
    /// Directory items waiting in the broker
    pub queued: u64,
    /// Directory items delivered but not yet acknowledged
    pub in_flight: u64,
    pub consumers: usize,
    pub elapsed: Duration,
}

impl CrawlProgress {
    /// Calculate dirs per second rate
    pub fn dirs_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.stats.acked as f64 / secs
        } else {
            0.0
        }
    }

    /// Calculate products per second rate
    pub fn products_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.stats.published_products as f64 / secs
        } else {
            0.0
        }
    }
}

type ProgressCallback = Box<dyn Fn(&CrawlProgress) + Send>;

/// Running consumer of either model
enum ConsumerHandle {
    Poll(PollConsumer),
    Push(PushConsumer),
}

impl ConsumerHandle {
    fn start<B, P>(
        mode: ConsumerMode,
        id: usize,
        config: &ConsumerConfig,
        stats: &Arc<ConsumerStats>,
        broker: &B,
        processor: P,
    ) -> std::result::Result<Self, WorkerError>
    where
        B: Broker,
        P: DirectoryProcessor + 'static,
    {
        match mode {
            ConsumerMode::Poll => {
                let mut consumer = PollConsumer::new(id, config.clone(), Arc::clone(stats));
                consumer.start(broker, processor)?;
                Ok(ConsumerHandle::Poll(consumer))
            }
            ConsumerMode::Push => {
                let mut consumer = PushConsumer::new(id, config.clone(), Arc::clone(stats));
                consumer.start(broker, processor)?;
                Ok(ConsumerHandle::Push(consumer))
            }
        }
    }

    fn stop(&mut self) {
        match self {
            ConsumerHandle::Poll(c) => c.stop(),
            ConsumerHandle::Push(c) => c.stop(),
        }
    }

    fn join(&mut self) -> std::result::Result<(), WorkerError> {
        match self {
            ConsumerHandle::Poll(c) => c.join(),
            ConsumerHandle::Push(c) => c.join(),
        }
    }
}

/// Coordinates the consumers of one crawler process
pub struct CrawlCoordinator<B: Broker> {
    broker: B,
    config: CoordinatorConfig,
    stats: Arc<ConsumerStats>,
    shutdown: Arc<AtomicBool>,
    progress: Option<ProgressCallback>,
}

impl<B: Broker> CrawlCoordinator<B> {
    /// Create a new crawl coordinator
    pub fn new(broker: B, config: CoordinatorConfig) -> Self {
        Self {
            broker,
            config,
            stats: Arc::new(ConsumerStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// Call `callback` on every check while the crawl runs
    pub fn with_progress(mut self, callback: impl Fn(&CrawlProgress) + Send + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Get a clone of the shutdown flag (for signal handlers)
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Publish the root work item of a crawl
    pub fn seed(&self, item: &DirectoryWorkItem) -> Result<()> {
        seed(&self.broker, item)
    }

    /// Run consumers until shutdown (or idle), creating one processor per consumer
    pub fn run<F, P>(self, mut make_processor: F) -> Result<CrawlResult>
    where
        F: FnMut(usize) -> P,
        P: DirectoryProcessor + 'static,
    {
        let start_time = Instant::now();

        info!(
            mode = %self.config.mode,
            consumers = self.config.consumer_count,
            queue = %self.config.consumer.queue,
            "Starting crawl"
        );

        let mut consumers = Vec::with_capacity(self.config.consumer_count);
        for id in 0..self.config.consumer_count {
            match ConsumerHandle::start(
                self.config.mode,
                id,
                &self.config.consumer,
                &self.stats,
                &self.broker,
                make_processor(id),
            ) {
                Ok(consumer) => consumers.push(consumer),
                Err(e) => {
                    warn!(consumer = id, error = %e, "Consumer failed to start");
                    stop_and_join(&mut consumers);
                    return Err(e.into());
                }
            }
        }
        info!(count = consumers.len(), "Consumers started");

        // Wait for completion
        let completed = self.wait_for_completion(start_time, consumers.len());

        // Signal shutdown
        self.shutdown.store(true, Ordering::SeqCst);
        stop_and_join(&mut consumers);

        let duration = start_time.elapsed();
        let result = CrawlResult::from_snapshot(self.stats.snapshot(), duration, completed);

        info!(
            acked = result.acked,
            retried = result.retried,
            products = result.published_products,
            duration_secs = duration.as_secs(),
            completed,
            "Crawl finished"
        );

        Ok(result)
    }

    /// Wait for an interrupt, or for an idle queue when `exit_when_idle`
    fn wait_for_completion(&self, start_time: Instant, consumers: usize) -> bool {
        let queue = self.config.consumer.queue;
        let mut stable_count = 0;

        loop {
            // Check for shutdown signal
            if self.shutdown.load(Ordering::Relaxed) {
                info!("Shutdown signal received");
                return false;
            }

            let status = match self.broker.queue_status(queue) {
                Ok(status) => Some(status),
                Err(e) => {
                    debug!(queue = %queue, error = %e, "Queue status unavailable");
                    None
                }
            };

            if let Some(callback) = &self.progress {
                callback(&CrawlProgress {
                    stats: self.stats.snapshot(),
                    queued: status.map_or(0, |s| s.ready),
                    in_flight: status.map_or(0, |s| s.unacked),
                    consumers,
                    elapsed: start_time.elapsed(),
                });
            }

            if self.config.exit_when_idle {
                if status.is_some_and(|s| s.is_drained()) {
                    stable_count += 1;
                    if stable_count >= STABLE_CHECKS_REQUIRED {
                        info!(queue = %queue, "Queue idle");
                        return true;
                    }
                } else {
                    stable_count = 0;
                }
            }

            thread::sleep(self.config.check_interval);
        }
    }
}

/// Stop every consumer, then wait for all of them
fn stop_and_join(consumers: &mut Vec<ConsumerHandle>) {
    for consumer in consumers.iter_mut() {
        consumer.stop();
    }
    for mut consumer in consumers.drain(..) {
        if let Err(e) = consumer.join() {
            warn!(error = %e, "Consumer failed to join cleanly");
        }
    }
}

/// Publish the root work item of a crawl on `broker`
pub fn seed<B: Broker>(broker: &B, item: &DirectoryWorkItem) -> Result<()> {
    let mut session = broker.open_session()?;
    BrokerPublisher::new(&mut session).publish_directory(item)?;
    session.close()?;

    info!(dir = %item.dir, job = %item.job_id, queue = %QueueName::Directories, "Seeded crawl");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::processor::from_fn;

    #[test]
    fn test_progress_rates() {
        let progress = CrawlProgress {
            stats: StatsSnapshot {
                acked: 1000,
                published_products: 5000,
                ..Default::default()
            },
            queued: 10,
            in_flight: 2,
            consumers: 4,
            elapsed: Duration::from_secs(10),
        };

        assert!((progress.dirs_per_second() - 100.0).abs() < 0.1);
        assert!((progress.products_per_second() - 500.0).abs() < 0.1);
    }

    #[test]
    fn test_idle_crawl_completes() {
        let broker = MemoryBroker::new();
        let coordinator = CrawlCoordinator::new(
            broker.clone(),
            CoordinatorConfig {
                consumer_count: 2,
                exit_when_idle: true,
                check_interval: Duration::from_millis(10),
                consumer: ConsumerConfig {
                    poll_timeout: Duration::from_millis(20),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        coordinator
            .seed(&DirectoryWorkItem::root("job", "node", "/data"))
            .unwrap();

        let result = coordinator.run(|_| from_fn(|_, _| Ok(()))).unwrap();

        assert!(result.completed);
        assert_eq!(result.acked, 1);
        assert!(broker.queue_status(QueueName::Directories).unwrap().is_drained());
    }

    #[test]
    fn test_shutdown_flag_interrupts() {
        let coordinator = CrawlCoordinator::new(
            MemoryBroker::new(),
            CoordinatorConfig {
                mode: ConsumerMode::Push,
                check_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let flag = coordinator.shutdown_flag();
        flag.store(true, Ordering::SeqCst);

        let result = coordinator.run(|_| from_fn(|_, _| Ok(()))).unwrap();
        assert!(!result.completed);
        assert_eq!(result.received, 0);
    }
}
