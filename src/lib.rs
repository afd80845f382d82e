//! pds-crawler - Broker-Driven Distributed Directory Crawler
//!
//! Traverses large directory trees by turning every directory into a work
//! item on a durable message queue. Any number of consumers, in any number
//! of processes, take items from the queue, list the directory, and publish
//! what they find:
//!
//! - subdirectories go back onto the same queue (the queue feeds itself)
//! - product files go to the product queue
//! - collection inventory tables go to the collection queue
//!
//! A work item is acknowledged only after everything derived from it has
//! been published, giving at-least-once processing: a consumer that crashes
//! mid-directory leaves the item to be redelivered to someone else.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────┐
//!   seed ────────▶│           harvest.dirs               │◀────────┐
//!                 └───────┬─────────────┬────────────────┘         │
//!                         │ receive /   │ push                     │ child
//!                         │ poll        │ delivery                 │ directories
//!                         ▼             ▼                          │
//!                 ┌─────────────┐ ┌─────────────┐                  │
//!                 │PollConsumer │ │PushConsumer │  ... N per process
//!                 └──────┬──────┘ └──────┬──────┘                  │
//!                        └───────┬───────┘                         │
//!                                ▼                                 │
//!                   handle_delivery ─▶ DirectoryProcessor ─────────┤
//!                                │                                 │
//!                      Ack / Retry / Drop              ┌───────────┴────────┐
//!                                                      │ harvest.products    │
//!                                                      │ harvest.collections │
//!                                                      │ harvest.quarantine  │
//!                                                      └─────────────────────┘
//! ```
//!
//! Two brokers are provided: Redis Streams for distributed crawls and an
//! in-process broker for single-process crawls and tests. With Redis, the
//! durability of queued work follows the server's persistence settings
//! (enable AOF to survive a Redis restart).
//!
//! # Example
//!
//! ```bash
//! # Seed a crawl, then run consumers on any number of hosts
//! pds-crawler seed /data/archive --node-name PDS_GEO
//! pds-crawler crawl -c 16 --extensions xml
//!
//! # Single-process crawl without Redis
//! pds-crawler crawl --broker memory --seed /data/archive --exit-when-idle
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod processor;
pub mod progress;
pub mod publisher;

pub use broker::{Broker, MemoryBroker, QueueName, RedisBroker};
pub use config::{CliArgs, CrawlConfig};
pub use consumer::{handle_delivery, Outcome, RetryPolicy};
pub use coordinator::{CrawlCoordinator, CrawlResult};
pub use error::{CrawlerError, Result};
pub use message::{CollectionInventoryMessage, DirectoryWorkItem, ProductMessage};
pub use processor::{DirectoryProcessor, FsDirectoryProcessor};
pub use publisher::{BrokerPublisher, Publisher};
