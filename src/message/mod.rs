//! Message module
//!
//! The three message kinds exchanged through the broker and the codec that
//! turns them into text payloads.

pub mod codec;
mod types;

pub use codec::{decode, encode, SCHEMA_VERSION};
pub use types::{
    CollectionInventoryMessage, CrawlMessage, DirectoryWorkItem, MessageKind, ProductMessage,
    QuarantinedMessage,
};
