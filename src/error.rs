//! Error types for pds-crawler
//!
//! This module defines the error hierarchy for:
//! - Broker transport failures (connection, receive, ack, send)
//! - Message encoding and decoding
//! - Publishing derived messages
//! - Directory processing
//! - Configuration and consumer thread errors
//!
//! Decode errors are terminal for the message that caused them. Transport
//! errors are logged by consumers and retried on the next receive; during
//! publishing they are surfaced to the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the crawler
#[derive(Error, Debug)]
pub enum CrawlerError {
    /// Broker transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Publish errors
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Consumer thread errors
    #[error("Consumer error: {0}")]
    Worker(#[from] WorkerError),
}

/// Broker connection and channel errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Failed to connect to the broker
    #[error("Failed to connect to broker at '{url}': {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// A broker command failed
    #[error("Broker operation failed: {0}")]
    OperationFailed(String),

    /// Delivery tag is not known to this session (already resolved or foreign)
    #[error("Unknown delivery '{tag}' on queue '{queue}'")]
    UnknownDelivery { queue: String, tag: String },

    /// Session or channel was closed
    #[error("Broker session is closed")]
    Closed,

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(String),
}

impl From<redis::RedisError> for TransportError {
    fn from(err: redis::RedisError) -> Self {
        TransportError::Redis(err.to_string())
    }
}

/// Payload could not be turned back into a message
///
/// Never retried: a malformed payload cannot become well-formed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not JSON, not an object, or fields missing/mistyped
    #[error("Malformed {kind} message: {reason}")]
    Malformed { kind: String, reason: String },

    /// Payload declares a different message kind
    #[error("Expected {expected} message, payload declares '{found}'")]
    KindMismatch { expected: String, found: String },

    /// Payload was written by a newer producer
    #[error("Unsupported {kind} schema version {found} (supported up to {supported})")]
    UnsupportedVersion {
        kind: String,
        found: u64,
        supported: u32,
    },
}

/// Message could not be serialized
#[derive(Error, Debug, Clone)]
#[error("Failed to encode {kind} message: {reason}")]
pub struct EncodeError {
    pub kind: String,
    pub reason: String,
}

/// Publishing a message failed
#[derive(Error, Debug, Clone)]
pub enum PublishError {
    /// Encoding failed before anything was sent
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Broker rejected or lost the send
    #[error("Failed to publish to '{queue}': {source}")]
    Transport {
        queue: String,
        #[source]
        source: TransportError,
    },
}

/// Directory processor failures
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// Filesystem access failed
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A derived message could not be published
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Any other processor-defined failure
    #[error("{0}")]
    Failed(String),
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid consumer count
    #[error("Invalid consumer count {count}: must be between 1 and {max}")]
    InvalidConsumerCount { count: usize, max: usize },

    /// Invalid poll timeout
    #[error("Invalid poll timeout {millis}ms: must be between {min} and {max}")]
    InvalidPollTimeout { millis: u64, min: u64, max: u64 },

    /// Invalid exclude pattern
    #[error("Invalid exclude pattern '{pattern}': {reason}")]
    InvalidExcludePattern { pattern: String, reason: String },

    /// Seed directory is unusable
    #[error("Invalid seed directory '{path}': {reason}")]
    InvalidSeedDir { path: PathBuf, reason: String },

    /// Invalid Redis URL
    #[error("Invalid Redis URL: {0}")]
    InvalidRedisUrl(String),

    /// Option only makes sense with another broker
    #[error("{0}")]
    Unsupported(String),
}

/// Consumer thread errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Consumer thread panicked
    #[error("Consumer {id} panicked: {message}")]
    Panicked { id: usize, message: String },

    /// Consumer could not be started
    #[error("Failed to initialize consumer {id}: {reason}")]
    InitFailed { id: usize, reason: String },

    /// Operation not allowed in the current lifecycle state
    #[error("Consumer {id} cannot {action} while {state}")]
    InvalidState {
        id: usize,
        action: &'static str,
        state: String,
    },
}

/// Result type alias for CrawlerError
pub type Result<T> = std::result::Result<T, CrawlerError>;

/// Result type for broker operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type for publish operations
pub type PublishResult<T> = std::result::Result<T, PublishError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err = TransportError::Closed;
        let crawler_err: CrawlerError = err.into();
        assert!(matches!(crawler_err, CrawlerError::Transport(_)));
    }

    #[test]
    fn test_publish_error_keeps_queue() {
        let err = PublishError::Transport {
            queue: "harvest.dirs".into(),
            source: TransportError::OperationFailed("boom".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("harvest.dirs"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_processing_error_from_publish() {
        let err: ProcessingError = PublishError::Encode(EncodeError {
            kind: "product".into(),
            reason: "bad".into(),
        })
        .into();
        assert!(matches!(err, ProcessingError::Publish(_)));
    }
}
