//! Redis Streams broker
//!
//! Each queue is a stream named `<prefix>:<queue>` read through one shared
//! consumer group:
//! - send: `XADD` with the payload and the number of earlier deliveries
//! - receive: `XREADGROUP ... BLOCK` for new entries
//! - ack: `XACK` + `XDEL`, so stream length tracks stored messages
//! - reject with requeue: atomic `XADD` of a copy + `XACK` + `XDEL`
//!
//! Entries left pending longer than the claim timeout (consumer crashed,
//! or a poll consumer left a failed message unacknowledged) are taken over
//! with `XPENDING` + `XCLAIM` by whichever session polls next.

use crate::broker::{Acknowledger, Broker, Delivery, MessageSink, PollSession, QueueName, QueueStatus};
use crate::error::{TransportError, TransportResult};
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::{Client, Commands, Connection, RedisResult};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Stream field holding the encoded message
const PAYLOAD_FIELD: &str = "payload";

/// Stream field holding deliveries made before this entry was written
const ATTEMPTS_FIELD: &str = "attempts";

/// Configuration for the Redis Streams broker
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Redis connection URL
    pub url: String,
    /// Key prefix for namespacing
    pub key_prefix: String,
    /// Consumer group shared by all crawler processes
    pub group: String,
    /// Pending entries idle this long are claimed by another consumer
    pub claim_timeout: Duration,
    /// Bounded wait used by push delivery threads
    pub dispatch_interval: Duration,
    /// Maximum entries claimed at once
    pub claim_batch: usize,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "pds-crawler".to_string(),
            group: "crawler".to_string(),
            claim_timeout: Duration::from_secs(120),
            dispatch_interval: Duration::from_secs(1),
            claim_batch: 10,
        }
    }
}

impl RedisBrokerConfig {
    /// Create config with custom Redis URL
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Stream key for a queue
    pub fn stream_key(&self, queue: QueueName) -> String {
        format!("{}:{}", self.key_prefix, queue.as_str())
    }

    /// How often a session looks for abandoned entries
    fn claim_check_interval(&self) -> Duration {
        (self.claim_timeout / 4).max(Duration::from_millis(100))
    }
}

/// Redis-backed broker
pub struct RedisBroker {
    client: Client,
    config: RedisBrokerConfig,
}

impl RedisBroker {
    /// Connect and make sure every stream has its consumer group
    pub fn connect(config: RedisBrokerConfig) -> TransportResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| TransportError::ConnectionFailed {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;

        let broker = Self { client, config };
        let mut conn = broker.connection()?;
        for queue in QueueName::ALL {
            ensure_group(&mut conn, &broker.config, queue)?;
        }

        info!(url = %broker.config.url, group = %broker.config.group, "Connected to Redis");
        Ok(broker)
    }

    /// Broker configuration
    pub fn config(&self) -> &RedisBrokerConfig {
        &self.config
    }

    fn connection(&self) -> TransportResult<Connection> {
        self.client
            .get_connection()
            .map_err(|e| TransportError::ConnectionFailed {
                url: self.config.url.clone(),
                reason: e.to_string(),
            })
    }
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker").field("config", &self.config).finish()
    }
}

impl Broker for RedisBroker {
    type Session = RedisSession;

    fn open_session(&self) -> TransportResult<RedisSession> {
        let conn = self.connection()?;
        let consumer = format!("consumer-{}", uuid::Uuid::new_v4());
        debug!(consumer = %consumer, "Opened Redis session");

        Ok(RedisSession {
            conn: Some(conn),
            config: self.config.clone(),
            consumer,
            claimed: VecDeque::new(),
            last_claim_check: None,
        })
    }

    fn queue_status(&self, queue: QueueName) -> TransportResult<QueueStatus> {
        let mut conn = self.connection()?;
        let key = self.config.stream_key(queue);

        let length: u64 = conn.xlen(&key)?;
        let pending: RedisResult<StreamPendingReply> = conn.xpending(&key, &self.config.group);
        let unacked = match pending {
            Ok(reply) => reply.count() as u64,
            Err(e) if is_no_group(&e) => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(QueueStatus {
            queue,
            ready: length.saturating_sub(unacked),
            unacked,
        })
    }

    fn dispatch_interval(&self) -> Duration {
        self.config.dispatch_interval
    }
}

/// One Redis connection acting as one consumer of the group
pub struct RedisSession {
    conn: Option<Connection>,
    config: RedisBrokerConfig,
    consumer: String,
    /// Entries taken over from dead consumers, not yet handed out
    claimed: VecDeque<Delivery>,
    last_claim_check: Option<Instant>,
}

impl RedisSession {
    /// Consumer name inside the group
    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    fn conn(&mut self) -> TransportResult<&mut Connection> {
        self.conn.as_mut().ok_or(TransportError::Closed)
    }

    /// Take over entries of `queue` left pending longer than the claim timeout
    pub fn claim_abandoned(&mut self, queue: QueueName) -> TransportResult<usize> {
        let key = self.config.stream_key(queue);
        let group = self.config.group.clone();
        let consumer = self.consumer.clone();
        let min_idle = self.config.claim_timeout.as_millis() as usize;
        let batch = self.config.claim_batch;

        let conn = self.conn()?;
        let pending: StreamPendingCountReply = conn.xpending_count(&key, &group, "-", "+", batch)?;

        let stale: Vec<_> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= min_idle)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let ids: Vec<&str> = stale.iter().map(|p| p.id.as_str()).collect();
        let reply: StreamClaimReply = conn.xclaim(&key, &group, &consumer, min_idle, &ids)?;

        let mut count = 0;
        for entry in reply.ids {
            let times_delivered = stale
                .iter()
                .find(|p| p.id == entry.id)
                .map(|p| p.times_delivered as u32)
                .unwrap_or(1);
            match to_delivery(queue, &entry, times_delivered + 1) {
                Some(delivery) => {
                    self.claimed.push_back(delivery);
                    count += 1;
                }
                None => warn!(queue = %queue, id = %entry.id, "Claimed entry has no payload"),
            }
        }

        if count > 0 {
            info!(consumer = %self.consumer, queue = %queue, count, "Claimed abandoned entries");
        }
        Ok(count)
    }

    fn claim_due(&self) -> bool {
        self.last_claim_check
            .map_or(true, |t| t.elapsed() >= self.config.claim_check_interval())
    }
}

impl MessageSink for RedisSession {
    fn send(&mut self, queue: QueueName, payload: &str) -> TransportResult<()> {
        let key = self.config.stream_key(queue);
        let conn = self.conn()?;
        let _: String = conn.xadd(&key, "*", &[(PAYLOAD_FIELD, payload), (ATTEMPTS_FIELD, "0")])?;
        trace!(queue = %queue, "Sent");
        Ok(())
    }
}

impl Acknowledger for RedisSession {
    fn ack(&mut self, delivery: &Delivery) -> TransportResult<()> {
        let key = self.config.stream_key(delivery.queue);
        let group = self.config.group.clone();
        let conn = self.conn()?;

        let acked: u64 = conn.xack(&key, &group, &[&delivery.tag])?;
        if acked == 0 {
            return Err(TransportError::UnknownDelivery {
                queue: delivery.queue.to_string(),
                tag: delivery.tag.clone(),
            });
        }
        let _: u64 = conn.xdel(&key, &[&delivery.tag])?;
        Ok(())
    }

    fn reject(&mut self, delivery: &Delivery, requeue: bool) -> TransportResult<()> {
        if !requeue {
            return self.ack(delivery);
        }

        let key = self.config.stream_key(delivery.queue);
        let group = self.config.group.clone();
        let attempts = delivery.delivery_count.to_string();
        let conn = self.conn()?;

        // Copy first: a crash between the steps duplicates, never loses
        let (_, acked, _): (String, u64, u64) = redis::pipe()
            .atomic()
            .xadd(&key, "*", &[(PAYLOAD_FIELD, delivery.payload.as_str()), (ATTEMPTS_FIELD, attempts.as_str())])
            .xack(&key, &group, &[&delivery.tag])
            .xdel(&key, &[&delivery.tag])
            .query(conn)?;

        if acked == 0 {
            warn!(queue = %delivery.queue, tag = %delivery.tag, "Requeued a delivery this session no longer owned");
        }
        Ok(())
    }
}

impl PollSession for RedisSession {
    fn receive(&mut self, queue: QueueName, timeout: Duration) -> TransportResult<Option<Delivery>> {
        if let Some(pos) = self.claimed.iter().position(|d| d.queue == queue) {
            return Ok(self.claimed.remove(pos));
        }

        if self.claim_due() {
            self.last_claim_check = Some(Instant::now());
            if self.claim_abandoned(queue)? > 0 {
                if let Some(pos) = self.claimed.iter().position(|d| d.queue == queue) {
                    return Ok(self.claimed.remove(pos));
                }
            }
        }

        let key = self.config.stream_key(queue);
        let opts = StreamReadOptions::default()
            .group(&self.config.group, &self.consumer)
            .count(1)
            .block(timeout.as_millis().max(1) as usize);

        let config = self.config.clone();
        let conn = self.conn()?;
        let result: RedisResult<Option<StreamReadReply>> = conn.xread_options(&[&key], &[">"], &opts);

        let reply = match result {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(None),
            Err(e) if is_no_group(&e) => {
                // Stream was deleted under us
                warn!(queue = %queue, "Consumer group missing, recreating");
                ensure_group(conn, &config, queue)?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let entry = reply.keys.into_iter().flat_map(|k| k.ids).next();
        let Some(entry) = entry else {
            return Ok(None);
        };

        match to_delivery(queue, &entry, 1) {
            Some(delivery) => Ok(Some(delivery)),
            None => {
                // Not written by a crawler; drop it so it is not claimed forever
                warn!(queue = %queue, id = %entry.id, "Discarding stream entry without payload");
                let _: u64 = conn.xack(&key, &config.group, &[&entry.id])?;
                let _: u64 = conn.xdel(&key, &[&entry.id])?;
                Ok(None)
            }
        }
    }

    fn close(&mut self) -> TransportResult<()> {
        // Pending entries stay in the group and are claimed after the timeout
        if self.conn.take().is_some() {
            debug!(consumer = %self.consumer, unclaimed = self.claimed.len(), "Closed Redis session");
        }
        self.claimed.clear();
        Ok(())
    }
}

/// Build a delivery from a stream entry; `deliveries` counts reads of this entry
fn to_delivery(queue: QueueName, entry: &StreamId, deliveries: u32) -> Option<Delivery> {
    let payload: String = entry.get(PAYLOAD_FIELD)?;
    let attempts = entry
        .get::<String>(ATTEMPTS_FIELD)
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);

    Some(Delivery {
        tag: entry.id.clone(),
        queue,
        payload,
        delivery_count: attempts + deliveries,
    })
}

/// Create the consumer group (and stream), tolerating an existing group
fn ensure_group(conn: &mut Connection, config: &RedisBrokerConfig, queue: QueueName) -> TransportResult<()> {
    let result: RedisResult<()> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(config.stream_key(queue))
        .arg(&config.group)
        .arg("0")
        .arg("MKSTREAM")
        .query(conn);

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
        Err(e) => Err(TransportError::OperationFailed(e.to_string())),
    }
}

fn is_no_group(err: &redis::RedisError) -> bool {
    err.code() == Some("NOGROUP") || err.to_string().contains("NOGROUP")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisBrokerConfig::default();
        assert_eq!(config.key_prefix, "pds-crawler");
        assert_eq!(config.claim_timeout, Duration::from_secs(120));
        assert_eq!(config.claim_check_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_stream_keys_are_namespaced() {
        let config = RedisBrokerConfig::with_url("redis://cache:6380");
        assert_eq!(config.url, "redis://cache:6380");
        assert_eq!(config.stream_key(QueueName::Directories), "pds-crawler:harvest.dirs");
        assert_eq!(config.stream_key(QueueName::Quarantine), "pds-crawler:harvest.quarantine");
    }

    #[test]
    fn test_claim_check_interval_has_floor() {
        let config = RedisBrokerConfig {
            claim_timeout: Duration::from_millis(40),
            ..Default::default()
        };
        assert_eq!(config.claim_check_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_to_delivery_counts_earlier_attempts() {
        let mut entry = StreamId::default();
        entry.id = "1-0".into();
        entry.map.insert(PAYLOAD_FIELD.into(), redis::Value::BulkString(b"{}".to_vec()));
        entry.map.insert(ATTEMPTS_FIELD.into(), redis::Value::BulkString(b"2".to_vec()));

        let delivery = to_delivery(QueueName::Directories, &entry, 1).unwrap();
        assert_eq!(delivery.tag, "1-0");
        assert_eq!(delivery.payload, "{}");
        assert_eq!(delivery.delivery_count, 3);

        entry.map.remove(PAYLOAD_FIELD);
        assert!(to_delivery(QueueName::Directories, &entry, 1).is_none());
    }
}
