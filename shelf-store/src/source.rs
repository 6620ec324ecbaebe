//! The physical storage seam.
//!
//! [`RecordSource`] abstracts the document-per-path backend so the store's
//! caching, deduplication, and resilience layers can be exercised against
//! fault-injecting sources in tests. The production implementation is
//! [`crate::persister::DiskSource`].

use std::path::Path;

use async_trait::async_trait;
use shelf_core::{FileIdentity, Record, ShelfResult};

/// Outcome of a write, distinguishing physical writes from hash-matched
/// no-ops.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Identity of the destination after the operation.
    pub identity: FileIdentity,
    /// Whether bytes actually hit the disk. `false` means the serialized
    /// content matched the last written hash and the write was skipped.
    pub wrote: bool,
    /// Serialized payload size in bytes.
    pub bytes: usize,
}

/// One-document-per-path storage backend.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Load the document at `path`.
    ///
    /// Returns `Ok(None)` if no document exists. The returned identity
    /// captures the primary file's modification time at read.
    async fn load(&self, key: &str, path: &Path) -> ShelfResult<Option<(Record, FileIdentity)>>;

    /// Observe the current on-disk identity of `path` without reading the
    /// document. Errors are folded into an absent identity: a file we
    /// cannot stat cannot validate a cache entry either way.
    async fn identity(&self, path: &Path) -> FileIdentity;

    /// Persist `record` at `path` atomically, skipping the physical write
    /// when content is unchanged.
    async fn store(&self, key: &str, path: &Path, record: &Record) -> ShelfResult<WriteOutcome>;

    /// Remove the document (and any compressed sibling) at `path`.
    ///
    /// Returns whether a primary document existed.
    async fn remove(&self, key: &str, path: &Path) -> ShelfResult<bool>;
}
