//! Pull-model consumer
//!
//! A dedicated thread repeatedly waits a bounded time for the next
//! directory work item, processes it and acknowledges it on success. A
//! failed item is left unacknowledged: the broker redelivers it once the
//! session recovers it (memory broker) or its claim timeout passes (Redis).
//!
//! Stop requests are observed between receives, so a stopping consumer
//! exits within one poll timeout plus the time to finish the current item.

use crate::broker::{Broker, PollSession};
use crate::consumer::{handle_delivery, ConsumerConfig, ConsumerState, ConsumerStats, Outcome, SharedState};
use crate::error::{TransportResult, WorkerError};
use crate::processor::DirectoryProcessor;
use crate::publisher::BrokerPublisher;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Longest pause after a failed broker call
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Poll consumer bound to one thread and one broker session
pub struct PollConsumer {
    id: usize,
    config: ConsumerConfig,
    state: Arc<SharedState>,
    stats: Arc<ConsumerStats>,
    handle: Option<JoinHandle<()>>,
}

impl PollConsumer {
    pub fn new(id: usize, config: ConsumerConfig, stats: Arc<ConsumerStats>) -> Self {
        Self {
            id,
            config,
            state: Arc::new(SharedState::new()),
            stats,
            handle: None,
        }
    }

    /// Get consumer ID
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ConsumerState {
        match (&self.handle, self.state.get()) {
            // Thread died without passing through stop
            (Some(handle), ConsumerState::Running) if handle.is_finished() => ConsumerState::Closed,
            (_, state) => state,
        }
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    /// Open a session on `broker` and start polling on a new thread
    pub fn start<B, P>(&mut self, broker: &B, processor: P) -> Result<(), WorkerError>
    where
        B: Broker,
        P: DirectoryProcessor + 'static,
    {
        let id = self.id;
        let current = self.state.get();
        if current != ConsumerState::Idle {
            return Err(WorkerError::InvalidState {
                id,
                action: "start",
                state: current.to_string(),
            });
        }

        let session = broker.open_session().map_err(|e| WorkerError::InitFailed {
            id,
            reason: e.to_string(),
        })?;

        // Running before the thread exists so an early stop() is not lost
        self.state.set(ConsumerState::Running);

        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        let stats = Arc::clone(&self.stats);

        let handle = thread::Builder::new()
            .name(format!("poll-consumer-{}", id))
            .spawn(move || poll_loop(id, config, session, processor, state, stats))
            .map_err(|e| {
                self.state.set(ConsumerState::Closed);
                WorkerError::InitFailed {
                    id,
                    reason: e.to_string(),
                }
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Ask the consumer to stop after the current receive
    pub fn stop(&self) {
        if !self.state.transition(ConsumerState::Running, ConsumerState::StopRequested) {
            self.state.transition(ConsumerState::Idle, ConsumerState::Closed);
        }
    }

    /// Wait for the consumer thread to finish
    pub fn join(&mut self) -> Result<(), WorkerError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle.join().map_err(|_| {
            self.state.set(ConsumerState::Closed);
            WorkerError::Panicked {
                id: self.id,
                message: "Poll consumer thread panicked".into(),
            }
        })
    }
}

impl Drop for PollConsumer {
    fn drop(&mut self) {
        self.stop();
        let _ = self.join();
    }
}

/// Receive and handle at most one delivery
///
/// Returns `Ok(None)` when nothing arrived within the poll timeout. A
/// transport error leaves any received delivery unacknowledged.
pub fn poll_once<S, P>(
    consumer: usize,
    config: &ConsumerConfig,
    session: &mut S,
    processor: &mut P,
    stats: &Arc<ConsumerStats>,
) -> TransportResult<Option<Outcome>>
where
    S: PollSession,
    P: DirectoryProcessor + ?Sized,
{
    let Some(delivery) = session.receive(config.queue, config.poll_timeout)? else {
        return Ok(None);
    };

    let outcome = {
        let mut publisher = BrokerPublisher::with_stats(&mut *session, Arc::clone(stats));
        handle_delivery(consumer, &delivery, processor, &mut publisher, &config.retry_policy, stats)
    };

    match outcome {
        Outcome::Ack => {
            session.ack(&delivery)?;
            stats.record_acked();
        }
        Outcome::Drop => session.ack(&delivery)?,
        Outcome::Retry => {
            trace!(consumer, tag = %delivery.tag, "Leaving delivery unacknowledged");
        }
    }

    Ok(Some(outcome))
}

/// Main consumer loop
fn poll_loop<S, P>(
    id: usize,
    config: ConsumerConfig,
    mut session: S,
    mut processor: P,
    state: Arc<SharedState>,
    stats: Arc<ConsumerStats>,
) where
    S: PollSession,
    P: DirectoryProcessor,
{
    info!(consumer = id, queue = %config.queue, "Poll consumer starting");

    while state.get() == ConsumerState::Running {
        if let Err(e) = poll_once(id, &config, &mut session, &mut processor, &stats) {
            stats.record_transport_error();
            warn!(consumer = id, error = %e, "Broker call failed");
            thread::sleep(config.poll_timeout.min(ERROR_BACKOFF));
        }
    }

    if let Err(e) = session.close() {
        debug!(consumer = id, error = %e, "Failed to close session");
    }
    state.set(ConsumerState::Closed);

    info!(consumer = id, "Poll consumer stopped");
}
