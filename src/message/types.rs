//! Message kinds moved through the broker
//!
//! Every message is an immutable value object. Each instance is fully
//! self-contained: no external state is needed to interpret it.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::broker::QueueName;

/// Discriminator for the three message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Directory to inspect
    Directory,
    /// Discovered data product
    Product,
    /// Collection inventory entry
    CollectionInventory,
}

impl MessageKind {
    /// Wire name written into the `messageKind` envelope field
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Directory => "directory",
            MessageKind::Product => "product",
            MessageKind::CollectionInventory => "collectionInventory",
        }
    }

    /// Durable queue this kind is routed to
    pub fn queue(&self) -> QueueName {
        match self {
            MessageKind::Directory => QueueName::Directories,
            MessageKind::Product => QueueName::Products,
            MessageKind::CollectionInventory => QueueName::Collections,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message that can travel through the crawler's queues
pub trait CrawlMessage: Serialize + DeserializeOwned + Clone + std::fmt::Debug {
    /// Kind of this message, which also fixes its queue
    const KIND: MessageKind;
}

/// A directory to inspect
///
/// Both input and output of the traversal: processing one item can
/// produce further items for its subdirectories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryWorkItem {
    /// Crawl job this item belongs to
    pub job_id: String,
    /// Registry node the products will be loaded into
    pub node_name: String,
    /// Directory to inspect
    pub dir: String,
    /// Directory the crawl was seeded with
    pub root_dir: String,
    /// Depth below `root_dir` (0 = root)
    pub depth: u32,
    /// Directory whose processing produced this item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_dir: Option<String>,
    /// Replace products that are already registered
    #[serde(default)]
    pub overwrite: bool,
}

impl DirectoryWorkItem {
    /// Create the seed item for a crawl
    pub fn root(job_id: impl Into<String>, node_name: impl Into<String>, dir: impl Into<String>) -> Self {
        let dir = dir.into();
        Self {
            job_id: job_id.into(),
            node_name: node_name.into(),
            root_dir: dir.clone(),
            dir,
            depth: 0,
            parent_dir: None,
            overwrite: false,
        }
    }

    /// Set the overwrite flag
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Create the item for a subdirectory of this one
    pub fn child(&self, dir: impl Into<String>) -> Self {
        Self {
            job_id: self.job_id.clone(),
            node_name: self.node_name.clone(),
            dir: dir.into(),
            root_dir: self.root_dir.clone(),
            depth: self.depth.saturating_add(1),
            parent_dir: Some(self.dir.clone()),
            overwrite: self.overwrite,
        }
    }

    /// Whether this is the crawl's seed item
    pub fn is_root(&self) -> bool {
        self.parent_dir.is_none() && self.depth == 0
    }
}

impl CrawlMessage for DirectoryWorkItem {
    const KIND: MessageKind = MessageKind::Directory;
}

/// One discovered data product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductMessage {
    pub job_id: String,
    pub node_name: String,
    /// Product label file
    pub file: String,
    /// Directory the label was found in
    pub dir: String,
    #[serde(default)]
    pub overwrite: bool,
}

impl ProductMessage {
    /// Create a product message discovered while processing `item`
    pub fn from_item(item: &DirectoryWorkItem, file: impl Into<String>) -> Self {
        Self {
            job_id: item.job_id.clone(),
            node_name: item.node_name.clone(),
            file: file.into(),
            dir: item.dir.clone(),
            overwrite: item.overwrite,
        }
    }
}

impl CrawlMessage for ProductMessage {
    const KIND: MessageKind = MessageKind::Product;
}

/// Inventory file of a product collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionInventoryMessage {
    pub job_id: String,
    pub node_name: String,
    /// Inventory table file
    pub inventory_file: String,
    /// Directory the inventory was found in
    pub dir: String,
    #[serde(default)]
    pub overwrite: bool,
}

impl CollectionInventoryMessage {
    /// Create an inventory message discovered while processing `item`
    pub fn from_item(item: &DirectoryWorkItem, inventory_file: impl Into<String>) -> Self {
        Self {
            job_id: item.job_id.clone(),
            node_name: item.node_name.clone(),
            inventory_file: inventory_file.into(),
            dir: item.dir.clone(),
            overwrite: item.overwrite,
        }
    }
}

impl CrawlMessage for CollectionInventoryMessage {
    const KIND: MessageKind = MessageKind::CollectionInventory;
}

/// Envelope for a message that exceeded its redelivery budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantinedMessage {
    /// Queue the message was consumed from
    pub source_queue: String,
    /// Delivery attempt that triggered quarantine
    pub delivery_count: u32,
    pub reason: String,
    /// Original payload, untouched so it can be replayed
    pub payload: String,
    pub quarantined_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_inherits_context() {
        let root = DirectoryWorkItem::root("job-1", "node-a", "/data").with_overwrite(true);
        assert!(root.is_root());

        let child = root.child("/data/bundle");
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_dir.as_deref(), Some("/data"));
        assert_eq!(child.root_dir, "/data");
        assert_eq!(child.job_id, "job-1");
        assert!(child.overwrite);
        assert!(!child.is_root());

        let grandchild = child.child("/data/bundle/coll");
        assert_eq!(grandchild.depth, 2);
        assert_eq!(grandchild.parent_dir.as_deref(), Some("/data/bundle"));
    }

    #[test]
    fn test_child_depth_saturates() {
        let mut item = DirectoryWorkItem::root("job", "node", "/data");
        item.depth = u32::MAX;
        assert_eq!(item.child("/data/x").depth, u32::MAX);
    }

    #[test]
    fn test_kind_routing() {
        assert_eq!(DirectoryWorkItem::KIND.queue(), QueueName::Directories);
        assert_eq!(ProductMessage::KIND.queue(), QueueName::Products);
        assert_eq!(CollectionInventoryMessage::KIND.queue(), QueueName::Collections);
    }

    #[test]
    fn test_product_from_item() {
        let item = DirectoryWorkItem::root("job", "node", "/data");
        let product = ProductMessage::from_item(&item, "/data/a.xml");
        assert_eq!(product.dir, "/data");
        assert_eq!(product.file, "/data/a.xml");
        assert_eq!(product.job_id, "job");
    }
}
