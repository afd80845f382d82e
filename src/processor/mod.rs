//! Directory processors
//!
//! A [`DirectoryProcessor`] turns one [`DirectoryWorkItem`] into zero or
//! more published messages. Consumers call it synchronously and decide
//! acknowledgment from its result:
//!
//! - `Ok(())`: everything derived from the directory has been published;
//!   the work item is acknowledged
//! - `Err(_)`: the work item is retried, so a processor should publish
//!   idempotently (a retried directory republishes its children)

mod fs;

pub use fs::{FsDirectoryProcessor, FsProcessorConfig};

use crate::error::ProcessingError;
use crate::message::DirectoryWorkItem;
use crate::publisher::Publisher;

/// Processing of a single directory work item
///
/// Each consumer owns its own processor instance.
pub trait DirectoryProcessor: Send {
    fn process(
        &mut self,
        item: &DirectoryWorkItem,
        publisher: &mut dyn Publisher,
    ) -> Result<(), ProcessingError>;
}

impl<P: DirectoryProcessor + ?Sized> DirectoryProcessor for Box<P> {
    fn process(
        &mut self,
        item: &DirectoryWorkItem,
        publisher: &mut dyn Publisher,
    ) -> Result<(), ProcessingError> {
        (**self).process(item, publisher)
    }
}

/// Processor backed by a closure, see [`from_fn`]
pub struct FnProcessor<F> {
    f: F,
}

/// Wrap a closure as a [`DirectoryProcessor`]
pub fn from_fn<F>(f: F) -> FnProcessor<F>
where
    F: FnMut(&DirectoryWorkItem, &mut dyn Publisher) -> Result<(), ProcessingError> + Send,
{
    FnProcessor { f }
}

impl<F> DirectoryProcessor for FnProcessor<F>
where
    F: FnMut(&DirectoryWorkItem, &mut dyn Publisher) -> Result<(), ProcessingError> + Send,
{
    fn process(
        &mut self,
        item: &DirectoryWorkItem,
        publisher: &mut dyn Publisher,
    ) -> Result<(), ProcessingError> {
        (self.f)(item, publisher)
    }
}
