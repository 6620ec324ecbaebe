//! The `KeyedStore` façade.
//!
//! Resolves logical keys through the [`KeyRegistry`] and dispatches through
//! the cache, coordinator, resilience, and persistence layers. No error
//! crosses this surface in normal operation: `get` always returns a record
//! (the stored one or the supplied default), `save` and `delete` return a
//! boolean outcome that callers treat as "try again later" when false.
//!
//! One store instance is constructed explicitly and its handle passed to
//! every collaborator; there is no hidden global.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use shelf_core::{
    ConfigError, FileIdentity, HealthReport, Record, ShelfError, StoreConfig, TtlClass,
};

use crate::cache::{CacheEntry, CacheLayer, CacheStatsSnapshot};
use crate::coordinator::{ConcurrencyCoordinator, LoadAttempt};
use crate::expiry::AutoExpiryScheduler;
use crate::janitor::{janitor_task, JanitorMetrics};
use crate::keys::{KeyRegistry, KeySpec};
use crate::persister::DiskSource;
use crate::resilience::Resilience;
use crate::source::RecordSource;

// ============================================================================
// METRICS
// ============================================================================

/// Operation counters for the store.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    physical_loads: AtomicU64,
    physical_writes: AtomicU64,
    skipped_writes: AtomicU64,
}

impl StoreMetrics {
    fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            physical_loads: self.physical_loads.load(Ordering::Relaxed),
            physical_writes: self.physical_writes.load(Ordering::Relaxed),
            skipped_writes: self.skipped_writes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`StoreMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreMetricsSnapshot {
    /// `get` calls.
    pub reads: u64,
    /// `save` calls.
    pub writes: u64,
    /// `delete` calls.
    pub deletes: u64,
    /// Operations that ended in failure (after retries/circuit).
    pub errors: u64,
    /// Loads that reached the disk.
    pub physical_loads: u64,
    /// Writes that reached the disk.
    pub physical_writes: u64,
    /// Writes suppressed by the content-hash no-op path.
    pub skipped_writes: u64,
}

impl StoreMetricsSnapshot {
    /// Errors divided by boundary operations, 0.0 when idle.
    pub fn error_rate(&self) -> f64 {
        let total = self.reads + self.writes + self.deletes;
        if total == 0 {
            0.0
        } else {
            self.errors as f64 / total as f64
        }
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Caching, persistent, concurrency-safe keyed document store.
pub struct KeyedStore {
    config: StoreConfig,
    registry: KeyRegistry,
    cache: Arc<CacheLayer>,
    coordinator: ConcurrencyCoordinator,
    resilience: Resilience,
    source: Arc<dyn RecordSource>,
    scheduler: AutoExpiryScheduler,
    metrics: StoreMetrics,
    janitor_metrics: Arc<JanitorMetrics>,
    shutdown_tx: watch::Sender<bool>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for KeyedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedStore")
            .field("data_dir", &self.config.data_dir)
            .field("cache_len", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl KeyedStore {
    /// Open a disk-backed store.
    ///
    /// Must be called inside a tokio runtime: the janitor task is spawned
    /// here. Directories are created lazily on first write.
    pub fn open(config: StoreConfig, registry: KeyRegistry) -> Result<Arc<Self>, ConfigError> {
        let source = Arc::new(DiskSource::new(&config));
        Self::with_source(config, registry, source)
    }

    /// Open a store over an arbitrary [`RecordSource`].
    pub fn with_source(
        config: StoreConfig,
        registry: KeyRegistry,
        source: Arc<dyn RecordSource>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let cache = Arc::new(CacheLayer::new(config.max_cache_entries));
        let janitor_metrics = Arc::new(JanitorMetrics::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let store = Arc::new(Self {
            resilience: Resilience::new(config.resilience.clone()),
            cache: Arc::clone(&cache),
            coordinator: ConcurrencyCoordinator::new(),
            scheduler: AutoExpiryScheduler::new(),
            metrics: StoreMetrics::default(),
            janitor_metrics: Arc::clone(&janitor_metrics),
            shutdown_tx,
            janitor: Mutex::new(None),
            registry,
            source,
            config,
        });

        let handle = tokio::spawn(janitor_task(
            cache,
            store.config.janitor_interval,
            shutdown_rx,
            janitor_metrics,
        ));
        *store.janitor.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        tracing::info!(data_dir = %store.config.data_dir.display(), "store opened");
        Ok(store)
    }

    // ------------------------------------------------------------------
    // Boundary operations
    // ------------------------------------------------------------------

    /// Get the record for `key`, or persist and return `default` if no
    /// document exists yet.
    ///
    /// Never fails: an unrecoverable read error returns `default` without
    /// populating the cache, so the next call retries the load.
    pub async fn get(self: &Arc<Self>, key: &str, default: Record) -> Record {
        self.metrics.reads.fetch_add(1, Ordering::Relaxed);

        let spec = match self.registry.resolve(key) {
            Ok(spec) => spec,
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key, error = %e, "get on unresolvable key");
                return default;
            }
        };
        let path = spec.path_under(&self.config.data_dir);

        // Fast path: fresh cache entry whose identity still matches disk.
        let identity = self.source.identity(&path).await;
        if let Some(value) = self.cache.get(key, &identity) {
            return value;
        }

        // Slow path: dedupe concurrent loads of the same key.
        let mut rounds = 0;
        loop {
            rounds += 1;
            match self.coordinator.begin_load(key) {
                LoadAttempt::Leader(token) => {
                    let value = self.load_slow(key, &spec, &path, &default).await;
                    drop(token);
                    return value;
                }
                LoadAttempt::Follower(rx) => {
                    let completed = self
                        .coordinator
                        .wait_for_leader(key, rx, self.config.load_wait_timeout)
                        .await;

                    let identity = self.source.identity(&path).await;
                    if let Some(value) = self.cache.get(key, &identity) {
                        return value;
                    }
                    // Leader timed out, or finished without a cacheable
                    // result. One extra leader round covers the common
                    // case; after that load independently.
                    if !completed || rounds >= 2 {
                        return self.load_slow(key, &spec, &path, &default).await;
                    }
                }
            }
        }
    }

    /// Save `record` under `key`.
    ///
    /// Returns `false` on unrecoverable failure: retry exhaustion, open
    /// circuit, validation or integrity failure.
    pub async fn save(self: &Arc<Self>, key: &str, record: Record) -> bool {
        self.metrics.writes.fetch_add(1, Ordering::Relaxed);

        let spec = match self.registry.resolve(key) {
            Ok(spec) => spec,
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key, error = %e, "save on unresolvable key");
                return false;
            }
        };

        if let Some(validator) = &spec.options.validator {
            if let Err(reason) = validator(&record) {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                let e = ShelfError::InvalidShape {
                    key: key.to_string(),
                    reason,
                };
                tracing::error!(key, error = %e, "record shape rejected");
                return false;
            }
        }

        let path = spec.path_under(&self.config.data_dir);
        let lock = self.coordinator.path_lock(&path);
        let _guard = lock.lock().await;

        match self
            .resilience
            .run("store", || self.source.store(key, &path, &record))
            .await
        {
            Ok(outcome) => {
                if outcome.wrote {
                    self.metrics.physical_writes.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.metrics.skipped_writes.fetch_add(1, Ordering::Relaxed);
                }
                // Cache refresh after the rename commits. A no-op write
                // also refreshes freshness: the caller just proved the
                // content is current.
                self.insert_cache(key, &spec, record, outcome.identity);
                self.schedule_auto_expiry(key, &spec);
                true
            }
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(key, path = %path.display(), error = %e, "save failed");
                false
            }
        }
    }

    /// Delete the document for `key`.
    ///
    /// Only allowed for families registered deletable. Returns whether a
    /// document existed and was removed.
    pub async fn delete(&self, key: &str) -> bool {
        self.metrics.deletes.fetch_add(1, Ordering::Relaxed);

        let spec = match self.registry.resolve(key) {
            Ok(spec) => spec,
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key, error = %e, "delete on unresolvable key");
                return false;
            }
        };
        if !spec.options.deletable {
            self.metrics.errors.fetch_add(1, Ordering::Relaxed);
            let e = ShelfError::DeleteNotSupported {
                key: key.to_string(),
            };
            tracing::warn!(key, error = %e, "delete rejected");
            return false;
        }

        let path = spec.path_under(&self.config.data_dir);
        let lock = self.coordinator.path_lock(&path);
        let _guard = lock.lock().await;

        match self
            .resilience
            .run("remove", || self.source.remove(key, &path))
            .await
        {
            Ok(existed) => {
                self.cache.remove(key);
                self.scheduler.cancel(key);
                existed
            }
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(key, path = %path.display(), error = %e, "delete failed");
                false
            }
        }
    }

    /// Point-in-time health report.
    pub fn health_check(&self) -> HealthReport {
        let cache_stats = self.cache.stats();
        let metrics = self.metrics.snapshot();

        let pinned = self.registry.pinned_static_keys();
        let critical_key_availability = if pinned.is_empty() {
            1.0
        } else {
            let resident = pinned
                .iter()
                .filter(|key| self.cache.contains_fresh(key))
                .count();
            resident as f64 / pinned.len() as f64
        };

        HealthReport {
            status: shelf_core::HealthStatus::Healthy,
            cache_hit_rate: cache_stats.hit_rate(),
            error_rate: metrics.error_rate(),
            circuit_open: self.resilience.circuit_open(),
            critical_key_availability,
        }
        .with_derived_status()
    }

    // ------------------------------------------------------------------
    // Supplementary operations
    // ------------------------------------------------------------------

    /// Drop the cache entry for `key` without touching disk.
    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.remove(key)
    }

    /// Preload a set of keys into the cache.
    ///
    /// Each entry takes the TTL class its family registered; critical
    /// reference families register the lazy class, so warming them buys
    /// the long trust window. Missing documents are created from an empty
    /// object, matching the defaulted-get semantics. Returns how many
    /// keys resolved.
    pub async fn warm(self: &Arc<Self>, keys: &[&str]) -> usize {
        let mut warmed = 0;
        for key in keys {
            if self.registry.resolve(key).is_ok() {
                self.get(key, Record::Object(Default::default())).await;
                warmed += 1;
            }
        }
        tracing::info!(warmed, requested = keys.len(), "cache warm complete");
        warmed
    }

    /// Operation counter snapshot.
    pub fn metrics(&self) -> StoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Cache counter snapshot.
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    /// Total retry attempts since the store was opened.
    pub fn retries_total(&self) -> u64 {
        self.resilience.retries_total()
    }

    /// Number of auto-expiry timers currently pending.
    pub fn pending_expiries(&self) -> usize {
        self.scheduler.pending()
    }

    /// Graceful shutdown: cancel every pending auto-expiry timer, stop the
    /// janitor, then clear the cache. No background work survives.
    pub async fn shutdown(&self) {
        self.scheduler.cancel_all();
        let _ = self.shutdown_tx.send(true);
        let handle = self
            .janitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.cache.clear();
        tracing::info!(
            sweeps = self.janitor_metrics.sweeps.load(Ordering::Relaxed),
            "store shut down"
        );
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Physical load under the path lock, defaulting and persisting when
    /// the document does not exist. Read failures return the default and
    /// leave the cache unpopulated so the next call retries.
    async fn load_slow(
        self: &Arc<Self>,
        key: &str,
        spec: &KeySpec,
        path: &std::path::Path,
        default: &Record,
    ) -> Record {
        let lock = self.coordinator.path_lock(path);
        let _guard = lock.lock().await;

        // A writer may have populated the cache while we waited.
        let identity = self.source.identity(path).await;
        if let Some(value) = self.cache.get(key, &identity) {
            return value;
        }

        match self
            .resilience
            .run("load", || self.source.load(key, path))
            .await
        {
            Ok(Some((record, identity))) => {
                self.metrics.physical_loads.fetch_add(1, Ordering::Relaxed);
                self.insert_cache(key, spec, record.clone(), identity);
                record
            }
            Ok(None) => {
                // First access: persist the default so subsequent reads
                // observe a stable document.
                match self
                    .resilience
                    .run("store", || self.source.store(key, path, default))
                    .await
                {
                    Ok(outcome) => {
                        self.metrics.physical_writes.fetch_add(1, Ordering::Relaxed);
                        self.insert_cache(key, spec, default.clone(), outcome.identity);
                        self.schedule_auto_expiry(key, spec);
                    }
                    Err(e) => {
                        self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(key, path = %path.display(), error = %e, "default persist failed");
                    }
                }
                default.clone()
            }
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(key, path = %path.display(), error = %e, "load failed, returning default");
                default.clone()
            }
        }
    }

    fn insert_cache(&self, key: &str, spec: &KeySpec, value: Record, identity: FileIdentity) {
        let ttl = spec.options.ttl_override.unwrap_or(match spec.options.ttl_class {
            TtlClass::Normal => self.config.normal_ttl,
            TtlClass::Lazy => self.config.lazy_ttl,
        });
        self.cache.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Utc::now(),
                ttl,
                ttl_class: spec.options.ttl_class,
                identity,
                pinned: spec.options.pinned,
            },
        );
    }

    fn schedule_auto_expiry(self: &Arc<Self>, key: &str, spec: &KeySpec) {
        let Some(policy) = &spec.options.auto_expiry else {
            return;
        };
        let delay = policy.delay.unwrap_or(self.config.auto_expiry_delay);
        let cleared = policy.cleared.clone();
        let store = Arc::downgrade(self);
        let owned_key = key.to_string();

        self.scheduler.schedule(key, delay, move || async move {
            if let Some(store) = store.upgrade() {
                store.clear_expired_record(&owned_key, cleared).await;
            }
        });
    }

    /// One-shot clear fired by the auto-expiry scheduler: overwrite the
    /// record with the family's cleared structure and evict it from cache.
    async fn clear_expired_record(&self, key: &str, cleared: Record) {
        let Ok(spec) = self.registry.resolve(key) else {
            return;
        };
        let path = spec.path_under(&self.config.data_dir);
        let lock = self.coordinator.path_lock(&path);
        let _guard = lock.lock().await;

        match self
            .resilience
            .run("expire", || self.source.store(key, &path, &cleared))
            .await
        {
            Ok(_) => {
                self.cache.remove(key);
                tracing::info!(key, "auto-expired record cleared");
            }
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key, error = %e, "auto-expiry clear failed");
            }
        }
    }
}
