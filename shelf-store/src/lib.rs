//! SHELF Store - Caching and Persistence Engine
//!
//! A concurrency-safe keyed document store over local disk: bounded LRU
//! caching with dual TTL classes, per-key load deduplication, atomic
//! temp-file+rename writes with content-hash change suppression,
//! retry-with-backoff and circuit-breaker resilience, gzip siblings for
//! large payloads, and background expiry.
//!
//! Construct one [`KeyedStore`] per process and hand its `Arc` to every
//! collaborator:
//!
//! ```ignore
//! let mut registry = KeyRegistry::new();
//! registry.register_static("monsters", "data/monsters.json", FamilyOptions::reference())?;
//! registry.register_family(
//!     "score_",
//!     Arc::new(|id: &str| PathBuf::from("scores").join(format!("{id}.json"))),
//!     FamilyOptions::default().with_deletable(true),
//! )?;
//!
//! let store = KeyedStore::open(StoreConfig::new("data"), registry)?;
//! let scores = store.get("score_123", json!({"v": 0})).await;
//! store.save("score_123", json!({"v": 5})).await;
//! ```

pub mod cache;
pub mod coordinator;
pub mod expiry;
pub mod janitor;
pub mod keys;
pub mod persister;
pub mod resilience;
pub mod source;
pub mod store;

pub use cache::{CacheEntry, CacheLayer, CacheStatsSnapshot};
pub use coordinator::{ConcurrencyCoordinator, LoadAttempt, LoadToken};
pub use expiry::AutoExpiryScheduler;
pub use janitor::JanitorMetrics;
pub use keys::{AutoExpiryPolicy, FamilyOptions, KeyRegistry, KeySpec, PathResolver, ShapeValidator};
pub use persister::DiskSource;
pub use resilience::{CircuitBreaker, Resilience, RetryPolicy};
pub use source::{RecordSource, WriteOutcome};
pub use store::{KeyedStore, StoreMetricsSnapshot};

// Re-export the core surface so callers need a single `use shelf_store::...`.
pub use shelf_core::{
    FileIdentity, HealthReport, HealthStatus, Record, ResilienceConfig, ShelfError, ShelfResult,
    StoreConfig, TtlClass,
};
