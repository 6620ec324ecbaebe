//! Durable document persistence.
//!
//! [`DiskSource`] writes one canonical JSON document per path. Writes stage
//! through a `.tmp` sibling and commit via atomic rename, so readers observe
//! either the prior content or the full new content, never a partial file.
//! A per-path content-hash table turns re-saves of identical content into
//! no-ops. Payloads above the verify threshold are re-read and hash-checked
//! before the rename commits; payloads above the compress threshold also get
//! a gzip `.gz` sibling which the loader prefers when it is newer than the
//! primary.
//!
//! Compression and decompression run on the blocking pool behind a bounded
//! semaphore so large payloads never stall the scheduler.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Semaphore;

use shelf_core::{FileIdentity, Record, ShelfError, ShelfResult, StoreConfig};

use crate::source::{RecordSource, WriteOutcome};

/// SHA-256 digest of a serialized document.
pub type ContentHash = [u8; 32];

/// Serialize a record to canonical bytes: compact JSON with object keys
/// sorted recursively. Canonical form makes the content hash a function of
/// the document's value, not of the caller's insertion order.
pub fn canonical_bytes(key: &str, record: &Record) -> ShelfResult<Vec<u8>> {
    serde_json::to_vec(&canonicalize(record)).map_err(|e| ShelfError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn canonicalize(value: &Record) -> Record {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &Record)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// Hash of canonical bytes, used for change suppression and verification.
pub fn content_hash(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Append a suffix to a path's final component: `a/b.json` + `.tmp` →
/// `a/b.json.tmp`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Disk-backed [`RecordSource`].
pub struct DiskSource {
    compress_threshold: usize,
    verify_threshold: usize,
    max_payload_bytes: usize,
    /// Last successfully committed content hash per path.
    hashes: Mutex<HashMap<PathBuf, ContentHash>>,
    /// Bounds concurrent blocking-pool work for large payloads.
    blocking_permits: Arc<Semaphore>,
    /// Fault-injection hook run on the staged file before verification.
    #[cfg(test)]
    stage_tamper: Mutex<Option<Box<dyn Fn(&Path) + Send + Sync>>>,
}

impl std::fmt::Debug for DiskSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskSource")
            .field("compress_threshold", &self.compress_threshold)
            .field("verify_threshold", &self.verify_threshold)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .finish_non_exhaustive()
    }
}

impl DiskSource {
    /// Create a disk source from the store configuration.
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            compress_threshold: config.compress_threshold,
            verify_threshold: config.verify_threshold,
            max_payload_bytes: config.max_payload_bytes,
            hashes: Mutex::new(HashMap::new()),
            blocking_permits: Arc::new(Semaphore::new(config.blocking_permits)),
            #[cfg(test)]
            stage_tamper: Mutex::new(None),
        }
    }

    fn last_hash(&self, path: &Path) -> Option<ContentHash> {
        self.hashes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .copied()
    }

    fn record_hash(&self, path: &Path, hash: ContentHash) {
        self.hashes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), hash);
    }

    fn forget_hash(&self, path: &Path) {
        self.hashes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    async fn acquire_permit(&self) -> ShelfResult<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.blocking_permits)
            .acquire_owned()
            .await
            .map_err(|_| ShelfError::ShutDown)
    }

    async fn gzip(&self, path: &Path, bytes: Vec<u8>) -> ShelfResult<Vec<u8>> {
        let _permit = self.acquire_permit().await?;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&bytes)?;
            encoder.finish()
        })
        .await
        .map_err(|e| ShelfError::TransientIo {
            path: path.clone(),
            reason: format!("blocking compression task failed: {e}"),
        })?
        .map_err(|e| ShelfError::transient_io(path, &e))
    }

    async fn gunzip(&self, path: &Path, bytes: Vec<u8>) -> ShelfResult<Vec<u8>> {
        let _permit = self.acquire_permit().await?;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut decoder = flate2::read::GzDecoder::new(bytes.as_slice());
            let mut out = Vec::new();
            std::io::Read::read_to_end(&mut decoder, &mut out)?;
            Ok(out)
        })
        .await
        .map_err(|e| ShelfError::TransientIo {
            path: path.clone(),
            reason: format!("blocking decompression task failed: {e}"),
        })?
        .map_err(|e| ShelfError::transient_io(path, &e))
    }

    /// Write the compressed sibling, staged and renamed like the primary.
    /// Sibling failures are logged and swallowed: the primary commit has
    /// already succeeded and the sibling is only an optimization.
    async fn write_compressed_sibling(&self, path: &Path, bytes: &[u8]) {
        let gz_path = sibling(path, ".gz");
        let result = async {
            let compressed = self.gzip(&gz_path, bytes.to_vec()).await?;
            let tmp = sibling(&gz_path, ".tmp");
            fs::write(&tmp, &compressed)
                .await
                .map_err(|e| ShelfError::transient_io(&tmp, &e))?;
            fs::rename(&tmp, &gz_path)
                .await
                .map_err(|e| ShelfError::transient_io(&gz_path, &e))?;
            Ok::<_, ShelfError>(compressed.len())
        }
        .await;

        match result {
            Ok(compressed_len) => {
                tracing::debug!(
                    path = %gz_path.display(),
                    raw_bytes = bytes.len(),
                    compressed_bytes = compressed_len,
                    "wrote compressed sibling"
                );
            }
            Err(e) => {
                tracing::warn!(path = %gz_path.display(), error = %e, "compressed sibling write failed");
            }
        }
    }

    /// Pick the newer of the primary document and its compressed sibling.
    async fn read_preferred(
        &self,
        path: &Path,
        primary_modified: std::time::SystemTime,
    ) -> ShelfResult<Vec<u8>> {
        let gz_path = sibling(path, ".gz");
        let gz_newer = match fs::metadata(&gz_path).await {
            Ok(meta) => meta
                .modified()
                .map(|gz_mtime| gz_mtime > primary_modified)
                .unwrap_or(false),
            Err(_) => false,
        };

        if gz_newer {
            let compressed = fs::read(&gz_path)
                .await
                .map_err(|e| ShelfError::transient_io(&gz_path, &e))?;
            match self.gunzip(&gz_path, compressed).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    // Corrupt or unreadable sibling: the primary is still a
                    // complete document, fall back to it.
                    tracing::warn!(path = %gz_path.display(), error = %e, "sibling read failed, using primary");
                }
            }
        }

        fs::read(path)
            .await
            .map_err(|e| ShelfError::transient_io(path, &e))
    }
}

#[async_trait]
impl RecordSource for DiskSource {
    async fn load(&self, key: &str, path: &Path) -> ShelfResult<Option<(Record, FileIdentity)>> {
        let meta = match fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ShelfError::transient_io(path, &e)),
        };
        let modified = meta
            .modified()
            .map_err(|e| ShelfError::transient_io(path, &e))?;

        let bytes = self.read_preferred(path, modified).await?;
        let record: Record =
            serde_json::from_slice(&bytes).map_err(|e| ShelfError::Serialization {
                key: key.to_string(),
                reason: format!("parse of {} failed: {e}", path.display()),
            })?;

        Ok(Some((record, FileIdentity::observed(path, modified))))
    }

    async fn identity(&self, path: &Path) -> FileIdentity {
        match fs::metadata(path).await {
            Ok(meta) => match meta.modified() {
                Ok(modified) => FileIdentity::observed(path, modified),
                Err(_) => FileIdentity::absent(path),
            },
            Err(_) => FileIdentity::absent(path),
        }
    }

    async fn store(&self, key: &str, path: &Path, record: &Record) -> ShelfResult<WriteOutcome> {
        let bytes = canonical_bytes(key, record)?;
        if bytes.len() > self.max_payload_bytes {
            return Err(ShelfError::PayloadTooLarge {
                key: key.to_string(),
                size: bytes.len(),
                limit: self.max_payload_bytes,
            });
        }

        let hash = content_hash(&bytes);

        // Fast no-op path: identical content already committed and the
        // destination still exists on disk.
        if self.last_hash(path) == Some(hash) {
            let identity = self.identity(path).await;
            if identity.modified.is_some() {
                tracing::debug!(key, path = %path.display(), "content unchanged, skipping write");
                return Ok(WriteOutcome {
                    identity,
                    wrote: false,
                    bytes: bytes.len(),
                });
            }
            // Destination vanished out-of-band: the hash entry is stale.
            self.forget_hash(path);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ShelfError::transient_io(parent, &e))?;
        }

        let tmp = sibling(path, ".tmp");
        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ShelfError::transient_io(&tmp, &e))?;

        #[cfg(test)]
        {
            let tamper = self.stage_tamper.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(tamper) = tamper.as_ref() {
                tamper(&tmp);
            }
        }

        if bytes.len() > self.verify_threshold {
            let reread = fs::read(&tmp)
                .await
                .map_err(|e| ShelfError::transient_io(&tmp, &e))?;
            let reread_hash = content_hash(&reread);
            if reread_hash != hash {
                // Abort before rename: the destination is untouched.
                let _ = fs::remove_file(&tmp).await;
                return Err(ShelfError::Integrity {
                    path: tmp,
                    expected: hex::encode(hash),
                    actual: hex::encode(reread_hash),
                });
            }
        }

        fs::rename(&tmp, path)
            .await
            .map_err(|e| ShelfError::transient_io(path, &e))?;

        let identity = self.identity(path).await;
        self.record_hash(path, hash);

        if bytes.len() > self.compress_threshold {
            self.write_compressed_sibling(path, &bytes).await;
        }

        Ok(WriteOutcome {
            identity,
            wrote: true,
            bytes: bytes.len(),
        })
    }

    async fn remove(&self, _key: &str, path: &Path) -> ShelfResult<bool> {
        let existed = match fs::remove_file(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(ShelfError::transient_io(path, &e)),
        };

        let gz_path = sibling(path, ".gz");
        match fs::remove_file(&gz_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ShelfError::transient_io(&gz_path, &e)),
        }

        self.forget_hash(path);
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn disk(dir: &TempDir) -> (DiskSource, PathBuf) {
        let config = StoreConfig::new(dir.path());
        (DiskSource::new(&config), dir.path().join("doc.json"))
    }

    #[test]
    fn test_canonical_bytes_sorts_keys() {
        let record = json!({"b": 1, "a": {"z": true, "m": [3, {"y": 2, "x": 1}]}});
        let bytes = canonical_bytes("k", &record).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"m":[3,{"x":1,"y":2}],"z":true},"b":1}"#
        );
    }

    #[tokio::test]
    async fn test_load_absent_returns_none() {
        let dir = TempDir::new().unwrap();
        let (source, path) = disk(&dir);
        assert_eq!(source.load("k", &path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let (source, path) = disk(&dir);
        let record = json!({"v": 5, "name": "optimus"});

        let outcome = source.store("k", &path, &record).await.unwrap();
        assert!(outcome.wrote);
        assert!(outcome.identity.modified.is_some());

        let (loaded, identity) = source.load("k", &path).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(identity.matches(&outcome.identity));
    }

    #[tokio::test]
    async fn test_identical_content_skips_physical_write() {
        let dir = TempDir::new().unwrap();
        let (source, path) = disk(&dir);
        let record = json!({"v": 5, "name": "bee"});

        let first = source.store("k", &path, &record).await.unwrap();
        assert!(first.wrote);

        // Key order differs but canonical content is identical.
        let same = serde_json::from_str(r#"{"name": "bee", "v": 5}"#).unwrap();
        let second = source.store("k", &path, &same).await.unwrap();
        assert!(!second.wrote);
    }

    #[tokio::test]
    async fn test_vanished_destination_invalidates_hash() {
        let dir = TempDir::new().unwrap();
        let (source, path) = disk(&dir);
        let record = json!({"v": 5});

        source.store("k", &path, &record).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let outcome = source.store("k", &path, &record).await.unwrap();
        assert!(outcome.wrote);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_no_tmp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let (source, path) = disk(&dir);
        source.store("k", &path, &json!({"v": 1})).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_verify_by_reread_passes() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path()).with_verify_threshold(0);
        let source = DiskSource::new(&config);
        let path = dir.path().join("doc.json");

        let outcome = source.store("k", &path, &json!({"v": 1})).await.unwrap();
        assert!(outcome.wrote);
    }

    #[tokio::test]
    async fn test_verify_mismatch_aborts_before_rename() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path()).with_verify_threshold(0);
        let source = DiskSource::new(&config);
        let path = dir.path().join("doc.json");

        source.store("k", &path, &json!({"v": 1})).await.unwrap();

        // Corrupt the staged file between write and verification, as a
        // torn or misdirected write would.
        *source.stage_tamper.lock().unwrap() = Some(Box::new(|tmp: &Path| {
            std::fs::write(tmp, br#"{"v":999}"#).unwrap();
        }));

        let err = source
            .store("k", &path, &json!({"v": 2}))
            .await
            .unwrap_err();
        assert!(matches!(err, ShelfError::Integrity { .. }));

        // The staged file is gone and the destination still holds the
        // previously committed document.
        assert!(!sibling(&path, ".tmp").exists());
        let (loaded, _) = source.load("k", &path).await.unwrap().unwrap();
        assert_eq!(loaded, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_compressed_sibling_written_and_preferred() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path()).with_compress_threshold(0);
        let source = DiskSource::new(&config);
        let path = dir.path().join("doc.json");
        let record = json!({"v": 5, "list": [1, 2, 3]});

        source.store("k", &path, &record).await.unwrap();
        let gz_path = sibling(&path, ".gz");
        assert!(gz_path.exists());

        // Make the sibling strictly newer than the primary, then corrupt
        // the primary: a loader preferring the sibling still succeeds.
        let gz_file = std::fs::OpenOptions::new()
            .append(true)
            .open(&gz_path)
            .unwrap();
        gz_file
            .set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(10))
            .unwrap();
        std::fs::write(&path, b"{ corrupt").unwrap();

        let (loaded, _) = source.load("k", &path).await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_corrupt_sibling_falls_back_to_primary() {
        let dir = TempDir::new().unwrap();
        let (source, path) = disk(&dir);
        let record = json!({"v": 5});
        source.store("k", &path, &record).await.unwrap();

        let gz_path = sibling(&path, ".gz");
        std::fs::write(&gz_path, b"not gzip at all").unwrap();
        let gz_file = std::fs::OpenOptions::new()
            .append(true)
            .open(&gz_path)
            .unwrap();
        gz_file
            .set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(10))
            .unwrap();

        let (loaded, _) = source.load("k", &path).await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_payload_over_ceiling_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::new(dir.path());
        config.max_payload_bytes = 8;
        config.verify_threshold = 8;
        let source = DiskSource::new(&config);
        let path = dir.path().join("doc.json");

        let err = source
            .store("k", &path, &json!({"big": "payload body"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ShelfError::PayloadTooLarge { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_remove_deletes_primary_and_sibling() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path()).with_compress_threshold(0);
        let source = DiskSource::new(&config);
        let path = dir.path().join("doc.json");

        source.store("k", &path, &json!({"v": 1})).await.unwrap();
        assert!(source.remove("k", &path).await.unwrap());
        assert!(!path.exists());
        assert!(!sibling(&path, ".gz").exists());

        // Second remove reports nothing existed.
        assert!(!source.remove("k", &path).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_primary_is_serialization_error() {
        let dir = TempDir::new().unwrap();
        let (source, path) = disk(&dir);
        std::fs::write(&path, b"{ nope").unwrap();

        let err = source.load("k", &path).await.unwrap_err();
        assert!(matches!(err, ShelfError::Serialization { .. }));
        assert!(!err.is_transient());
    }

    fn arb_json(depth: u32) -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[a-z]{0,8}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(depth, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(|m| {
                    serde_json::Value::Object(m.into_iter().collect())
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_canonical_bytes_deterministic(value in arb_json(3)) {
            let a = canonical_bytes("k", &value).unwrap();
            // Round-trip through a parse re-orders nothing observable.
            let reparsed: serde_json::Value = serde_json::from_slice(&a).unwrap();
            let b = canonical_bytes("k", &reparsed).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
