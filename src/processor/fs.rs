//! Local filesystem directory processor
//!
//! Lists one directory and publishes:
//! - a child work item for every subdirectory
//! - a collection inventory message for every inventory table
//!   (`collection*.csv` / `collection*.tab` by default)
//! - a product message for every other matching file
//!
//! Entries are visited in name order so a retried directory republishes
//! the same messages in the same order. Symbolic links are not followed.

use crate::error::ProcessingError;
use crate::message::{CollectionInventoryMessage, DirectoryWorkItem, ProductMessage};
use crate::processor::DirectoryProcessor;
use crate::publisher::Publisher;
use regex::Regex;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, trace, warn};

/// Configuration for [`FsDirectoryProcessor`]
#[derive(Debug, Clone)]
pub struct FsProcessorConfig {
    /// Lowercase extensions (no dot) of product files; empty accepts every file
    pub product_extensions: Vec<String>,
    /// File name prefix of collection inventories
    pub inventory_prefix: String,
    /// Lowercase extensions of collection inventories
    pub inventory_extensions: Vec<String>,
    /// Deepest directory depth to traverse (unlimited if not set)
    pub max_depth: Option<u32>,
    /// Paths matching any pattern are neither traversed nor published
    pub exclude_patterns: Vec<Regex>,
}

impl Default for FsProcessorConfig {
    fn default() -> Self {
        Self {
            product_extensions: Vec::new(),
            inventory_prefix: "collection".to_string(),
            inventory_extensions: vec!["csv".to_string(), "tab".to_string()],
            max_depth: None,
            exclude_patterns: Vec::new(),
        }
    }
}

impl FsProcessorConfig {
    /// Check if a path should be excluded
    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude_patterns.iter().any(|re| re.is_match(path))
    }

    fn within_depth(&self, depth: u32) -> bool {
        self.max_depth.map_or(true, |max| depth <= max)
    }

    fn is_inventory(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        lower.starts_with(&self.inventory_prefix.to_ascii_lowercase())
            && extension_of(&lower).is_some_and(|ext| self.inventory_extensions.iter().any(|e| e.as_str() == ext))
    }

    fn is_product(&self, name: &str) -> bool {
        if self.product_extensions.is_empty() {
            return true;
        }
        let lower = name.to_ascii_lowercase();
        extension_of(&lower).is_some_and(|ext| self.product_extensions.iter().any(|e| e.as_str() == ext))
    }
}

fn extension_of(name: &str) -> Option<&str> {
    Path::new(name).extension().and_then(|e| e.to_str())
}

/// What a directory listing produced
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DirSummary {
    subdirs: usize,
    products: usize,
    inventories: usize,
    skipped: usize,
}

/// Processor walking the local filesystem
#[derive(Debug, Clone, Default)]
pub struct FsDirectoryProcessor {
    config: FsProcessorConfig,
}

impl FsDirectoryProcessor {
    pub fn new(config: FsProcessorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FsProcessorConfig {
        &self.config
    }

    /// Read and sort the entries of a directory
    ///
    /// `Ok(None)` when the directory vanished or is unreadable; retrying
    /// could never succeed, so the caller treats it as done.
    fn list(&self, dir: &str) -> Result<Option<Vec<fs::DirEntry>>, ProcessingError> {
        let io_err = |source: std::io::Error| ProcessingError::Io {
            path: dir.into(),
            source,
        };

        let reader = match fs::read_dir(dir) {
            Ok(reader) => reader,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
                warn!(dir = %dir, error = %e, "Skipping unreadable directory");
                return Ok(None);
            }
            Err(e) => return Err(io_err(e)),
        };

        let mut entries = reader.collect::<Result<Vec<_>, _>>().map_err(io_err)?;
        entries.sort_by_key(|e| e.file_name());
        Ok(Some(entries))
    }
}

impl DirectoryProcessor for FsDirectoryProcessor {
    fn process(
        &mut self,
        item: &DirectoryWorkItem,
        publisher: &mut dyn Publisher,
    ) -> Result<(), ProcessingError> {
        if !self.config.within_depth(item.depth) {
            debug!(dir = %item.dir, depth = item.depth, "Beyond max depth");
            return Ok(());
        }
        if self.config.is_excluded(&item.dir) {
            debug!(dir = %item.dir, "Matched exclusion pattern");
            return Ok(());
        }

        let Some(entries) = self.list(&item.dir)? else {
            return Ok(());
        };

        let Some(child_depth) = item.depth.checked_add(1) else {
            return Err(ProcessingError::Failed(format!(
                "depth {} of '{}' is out of range",
                item.depth, item.dir
            )));
        };

        let mut summary = DirSummary::default();
        let child_in_depth = self.config.within_depth(child_depth);

        for entry in entries {
            let path = entry.path();
            // A lossy name would be published as a path that does not exist
            let Some(path_str) = path.to_str() else {
                warn!(dir = %item.dir, path = %path.display(), "Skipping entry with non-UTF-8 name");
                summary.skipped += 1;
                continue;
            };
            let file_type = entry.file_type().map_err(|source| ProcessingError::Io {
                path: path.clone(),
                source,
            })?;

            if self.config.is_excluded(path_str) {
                summary.skipped += 1;
                continue;
            }

            if file_type.is_dir() {
                if child_in_depth {
                    publisher.publish_directory(&item.child(path_str))?;
                    summary.subdirs += 1;
                } else {
                    summary.skipped += 1;
                }
            } else if file_type.is_file() {
                let name = entry.file_name();
                let name = name.to_string_lossy();

                if self.config.is_inventory(&name) {
                    let inventory = CollectionInventoryMessage::from_item(item, path_str);
                    publisher.publish_collection_inventory(&inventory)?;
                    summary.inventories += 1;
                } else if self.config.is_product(&name) {
                    publisher.publish_product(&ProductMessage::from_item(item, path_str))?;
                    summary.products += 1;
                } else {
                    summary.skipped += 1;
                }
            } else {
                trace!(path = %path_str, "Skipping special file or symlink");
                summary.skipped += 1;
            }
        }

        debug!(
            dir = %item.dir,
            subdirs = summary.subdirs,
            products = summary.products,
            inventories = summary.inventories,
            skipped = summary.skipped,
            "Directory listed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishResult;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Collected {
        dirs: Vec<DirectoryWorkItem>,
        products: Vec<ProductMessage>,
        inventories: Vec<CollectionInventoryMessage>,
    }

    impl Publisher for Collected {
        fn publish_directory(&mut self, item: &DirectoryWorkItem) -> PublishResult<()> {
            self.dirs.push(item.clone());
            Ok(())
        }

        fn publish_product(&mut self, product: &ProductMessage) -> PublishResult<()> {
            self.products.push(product.clone());
            Ok(())
        }

        fn publish_collection_inventory(
            &mut self,
            inventory: &CollectionInventoryMessage,
        ) -> PublishResult<()> {
            self.inventories.push(inventory.clone());
            Ok(())
        }
    }

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir(root.join("bundle_b")).unwrap();
        fs::create_dir(root.join("bundle_a")).unwrap();
        fs::create_dir(root.join(".snapshot")).unwrap();
        fs::write(root.join("label_2.xml"), "<x/>").unwrap();
        fs::write(root.join("label_1.xml"), "<x/>").unwrap();
        fs::write(root.join("notes.txt"), "hi").unwrap();
        fs::write(root.join("Collection_data.csv"), "P,urn").unwrap();
        tmp
    }

    fn root_item(tmp: &TempDir) -> DirectoryWorkItem {
        DirectoryWorkItem::root("job", "node", tmp.path().to_string_lossy())
    }

    #[test]
    fn test_fans_out_in_name_order() {
        let tmp = tree();
        let mut processor = FsDirectoryProcessor::new(FsProcessorConfig {
            product_extensions: vec!["xml".into()],
            exclude_patterns: vec![Regex::new(r"\.snapshot").unwrap()],
            ..Default::default()
        });
        let mut out = Collected::default();

        processor.process(&root_item(&tmp), &mut out).unwrap();

        let dirs: Vec<_> = out.dirs.iter().map(|d| d.dir.clone()).collect();
        assert_eq!(
            dirs,
            vec![
                tmp.path().join("bundle_a").to_string_lossy().to_string(),
                tmp.path().join("bundle_b").to_string_lossy().to_string(),
            ]
        );
        assert!(out.dirs.iter().all(|d| d.depth == 1));

        let products: Vec<_> = out.products.iter().map(|p| p.file.clone()).collect();
        assert_eq!(
            products,
            vec![
                tmp.path().join("label_1.xml").to_string_lossy().to_string(),
                tmp.path().join("label_2.xml").to_string_lossy().to_string(),
            ]
        );

        assert_eq!(out.inventories.len(), 1);
        assert!(out.inventories[0].inventory_file.ends_with("Collection_data.csv"));
    }

    #[test]
    fn test_empty_extension_list_accepts_all_files() {
        let tmp = tree();
        let mut processor = FsDirectoryProcessor::default();
        let mut out = Collected::default();

        processor.process(&root_item(&tmp), &mut out).unwrap();

        // label_1.xml, label_2.xml, notes.txt
        assert_eq!(out.products.len(), 3);
        assert_eq!(out.dirs.len(), 3);
    }

    #[test]
    fn test_max_depth_stops_fan_out() {
        let tmp = tree();
        let mut processor = FsDirectoryProcessor::new(FsProcessorConfig {
            max_depth: Some(0),
            ..Default::default()
        });
        let mut out = Collected::default();

        processor.process(&root_item(&tmp), &mut out).unwrap();
        assert!(out.dirs.is_empty());
        assert_eq!(out.products.len(), 3);

        let deep = root_item(&tmp).child(tmp.path().join("bundle_a").to_string_lossy());
        let mut out = Collected::default();
        processor.process(&deep, &mut out).unwrap();
        assert!(out.products.is_empty() && out.dirs.is_empty());
    }

    #[test]
    fn test_missing_directory_is_not_an_error() {
        let tmp = TempDir::new().unwrap();
        let gone = tmp.path().join("gone");
        let item = DirectoryWorkItem::root("job", "node", gone.to_string_lossy());
        let mut out = Collected::default();

        FsDirectoryProcessor::default().process(&item, &mut out).unwrap();
        assert!(out.dirs.is_empty());
    }

    #[test]
    fn test_file_as_directory_fails() {
        let tmp = tree();
        let file = tmp.path().join("notes.txt");
        let item = DirectoryWorkItem::root("job", "node", file.to_string_lossy());
        let mut out = Collected::default();

        let err = FsDirectoryProcessor::default().process(&item, &mut out).unwrap_err();
        assert!(matches!(err, ProcessingError::Io { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_entries_are_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let tmp = TempDir::new().unwrap();
        let bad = tmp.path().join(OsStr::from_bytes(b"bad\xff"));
        fs::create_dir(&bad).unwrap();
        fs::write(bad.join("p.xml"), "<p/>").unwrap();
        fs::write(tmp.path().join(OsStr::from_bytes(b"label\xfe.xml")), "<x/>").unwrap();
        fs::create_dir(tmp.path().join("good")).unwrap();

        let mut out = Collected::default();
        FsDirectoryProcessor::default().process(&root_item(&tmp), &mut out).unwrap();

        let dirs: Vec<_> = out.dirs.iter().map(|d| d.dir.clone()).collect();
        assert_eq!(dirs, vec![tmp.path().join("good").to_string_lossy().to_string()]);
        assert!(out.products.is_empty());
        assert!(out.dirs.iter().all(|d| !d.dir.contains('\u{FFFD}')));
    }

    #[test]
    fn test_depth_at_limit_fails_without_publishing() {
        let tmp = tree();
        let mut item = root_item(&tmp);
        item.depth = u32::MAX;
        let mut out = Collected::default();

        let err = FsDirectoryProcessor::default().process(&item, &mut out).unwrap_err();
        assert!(matches!(err, ProcessingError::Failed(_)));
        assert!(out.dirs.is_empty() && out.products.is_empty());
    }

    #[test]
    fn test_inventory_matching() {
        let config = FsProcessorConfig::default();
        assert!(config.is_inventory("collection_data.csv"));
        assert!(config.is_inventory("COLLECTION_X.TAB"));
        assert!(!config.is_inventory("collection_data.xml"));
        assert!(!config.is_inventory("bundle.csv"));
    }
}
