//! Record and cache identity types.
//!
//! A [`Record`] is an opaque caller-shaped JSON document. The store never
//! enforces a schema; callers own their document shape and the store only
//! validates serializability and size.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// A caller-defined structured document identified by a logical key.
pub type Record = serde_json::Value;

/// Freshness policy class for cached records.
///
/// Chosen per key family at registration time: frequently mutated records
/// use [`TtlClass::Normal`]; rarely-changing reference data uses
/// [`TtlClass::Lazy`] and is trusted for longer between reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlClass {
    /// Short TTL for frequently mutated records.
    #[default]
    Normal,
    /// Long TTL for rarely-changing reference data.
    Lazy,
}

/// Identity of an on-disk document: resolved path plus the modification
/// time observed when the document was last loaded or written.
///
/// At most one live cache entry exists per identity. An out-of-band change
/// to the file bumps its modification time, which no longer matches the
/// cached identity, forcing a reload on the next read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    /// Resolved storage path for the logical key.
    pub path: PathBuf,
    /// Modification time at load/write, `None` if the file did not exist.
    pub modified: Option<SystemTime>,
}

impl FileIdentity {
    /// Identity for a document that does not yet exist on disk.
    pub fn absent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            modified: None,
        }
    }

    /// Identity captured from an observed modification time.
    pub fn observed(path: impl Into<PathBuf>, modified: SystemTime) -> Self {
        Self {
            path: path.into(),
            modified: Some(modified),
        }
    }

    /// Whether `other` refers to the same path and the same on-disk
    /// modification time.
    pub fn matches(&self, other: &FileIdentity) -> bool {
        self == other
    }
}
