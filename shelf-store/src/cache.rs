//! Bounded in-memory cache with dual TTL classes and batch LRU eviction.
//!
//! Entries are keyed by logical key and validated on every read against
//! both their TTL and the current on-disk [`FileIdentity`]: an out-of-band
//! change to the file bumps its modification time and invalidates the
//! entry, forcing a reload. Eviction runs in batches (oldest insertion
//! first) down to a target size rather than one entry at a time; pinned
//! entries are skipped unless capacity pressure is severe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shelf_core::{FileIdentity, Record, TtlClass};

/// How many entries past capacity each eviction batch removes, so the
/// cache does not thrash at exactly `max_entries`.
const EVICTION_HEADROOM: usize = 25;

/// A cached record with its freshness metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached record.
    pub value: Record,
    /// When the entry was inserted (or last refreshed by a save).
    pub inserted_at: DateTime<Utc>,
    /// Effective TTL for this entry.
    pub ttl: Duration,
    /// The freshness class the TTL was derived from.
    pub ttl_class: TtlClass,
    /// On-disk identity at load/write time.
    pub identity: FileIdentity,
    /// Pinned entries survive eviction unless pressure is severe.
    pub pinned: bool,
}

impl CacheEntry {
    fn staleness(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.inserted_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Whether the entry's TTL has lapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.staleness(now) > self.ttl
    }
}

/// Cache hit/miss/eviction counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Point-in-time view of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStatsSnapshot {
    /// Hits divided by total lookups, 0.0 when no lookups yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded map of logical key → [`CacheEntry`].
pub struct CacheLayer {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_entries: usize,
    stats: CacheStats,
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("len", &self.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl CacheLayer {
    /// Create a cache bounded at `max_entries`.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
            stats: CacheStats::default(),
        }
    }

    /// Look up a fresh entry for `key`.
    ///
    /// A hit requires the entry to be within its TTL and its recorded
    /// identity to match `current` (same path, same modification time).
    /// Expired or invalidated entries are removed and count as misses.
    pub fn get(&self, key: &str, current: &FileIdentity) -> Option<Record> {
        let now = Utc::now();
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) && entry.identity.matches(current) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Stale or invalidated: drop the entry under the write lock.
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get(key) {
            if entry.is_expired(now) || !entry.identity.matches(current) {
                entries.remove(key);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            } else {
                // Another task reinserted a fresh entry in between.
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Whether a non-expired entry for `key` is resident, without
    /// re-checking the on-disk identity. Used for health reporting.
    pub fn contains_fresh(&self, key: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .map(|entry| !entry.is_expired(Utc::now()))
            .unwrap_or(false)
    }

    /// Insert or replace the entry for `key`, evicting a batch of the
    /// oldest entries if the cache is over capacity.
    pub fn insert(&self, key: impl Into<String>, entry: CacheEntry) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.into(), entry);

        if entries.len() > self.max_entries {
            let severe = entries.len() > self.max_entries + self.max_entries / 2;
            let evicted = Self::evict_batch(&mut entries, self.max_entries, severe);
            self.stats
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            if evicted > 0 {
                tracing::warn!(evicted, severe, remaining = entries.len(), "cache over capacity, evicted batch");
            }
        }
    }

    /// Evict the oldest entries down to `max - EVICTION_HEADROOM`,
    /// skipping pinned entries unless `severe`.
    ///
    /// The target is floored at half the capacity (and never below one
    /// entry), so a cache smaller than the headroom batch still retains
    /// its newest entries instead of emptying out.
    fn evict_batch(
        entries: &mut HashMap<String, CacheEntry>,
        max_entries: usize,
        severe: bool,
    ) -> usize {
        let target = max_entries
            .saturating_sub(EVICTION_HEADROOM)
            .max(max_entries / 2)
            .max(1);
        let surplus = entries.len().saturating_sub(target);
        if surplus == 0 {
            return 0;
        }

        let mut candidates: Vec<(String, DateTime<Utc>)> = entries
            .iter()
            .filter(|(_, entry)| severe || !entry.pinned)
            .map(|(key, entry)| (key.clone(), entry.inserted_at))
            .collect();
        candidates.sort_by_key(|(_, inserted_at)| *inserted_at);

        let mut evicted = 0;
        for (key, _) in candidates.into_iter().take(surplus) {
            entries.remove(&key);
            evicted += 1;
        }
        evicted
    }

    /// Remove the entry for `key`, returning whether one existed.
    pub fn remove(&self, key: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some()
    }

    /// Remove every expired entry.
    ///
    /// Pinned entries are deferred to a later sweep while the cache is at
    /// or under capacity; under pressure they expire like any other entry.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let under_pressure = entries.len() > self.max_entries;

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now) && (under_pressure || !entry.pinned))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.remove(key);
        }
        self.stats
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::SystemTime;

    fn identity(n: u64) -> FileIdentity {
        FileIdentity::observed(
            "/data/doc.json",
            SystemTime::UNIX_EPOCH + Duration::from_secs(n),
        )
    }

    fn entry(v: i64, identity: FileIdentity, ttl: Duration, pinned: bool) -> CacheEntry {
        CacheEntry {
            value: json!({"v": v}),
            inserted_at: Utc::now(),
            ttl,
            ttl_class: TtlClass::Normal,
            identity,
            pinned,
        }
    }

    #[test]
    fn test_hit_requires_matching_identity() {
        let cache = CacheLayer::new(10);
        cache.insert("k", entry(1, identity(100), Duration::from_secs(60), false));

        assert_eq!(cache.get("k", &identity(100)), Some(json!({"v": 1})));

        // Out-of-band mtime change invalidates the entry.
        assert_eq!(cache.get("k", &identity(101)), None);
        // And the stale entry is gone entirely.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = CacheLayer::new(10);
        let mut stale = entry(1, identity(100), Duration::from_secs(60), false);
        stale.inserted_at = Utc::now() - chrono::Duration::seconds(120);
        cache.insert("k", stale);

        assert_eq!(cache.get("k", &identity(100)), None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn test_batch_eviction_prefers_oldest() {
        let cache = CacheLayer::new(30);
        for i in 0..31 {
            let mut e = entry(i, identity(100), Duration::from_secs(600), false);
            // Strictly increasing age: entry 0 is the oldest.
            e.inserted_at = Utc::now() - chrono::Duration::seconds(1000 - i);
            cache.insert(format!("k{i}"), e);
        }

        // 31 > 30 triggered a batch down to the floored target of 15
        // (half the capacity, above 30 - 25).
        assert_eq!(cache.len(), 15);
        // The newest entries survive.
        assert!(cache.contains_fresh("k30"));
        assert!(!cache.contains_fresh("k0"));
    }

    #[test]
    fn test_small_cache_keeps_newest_entries() {
        let cache = CacheLayer::new(10);
        for i in 0..11 {
            let mut e = entry(i, identity(100), Duration::from_secs(600), false);
            e.inserted_at = Utc::now() - chrono::Duration::seconds(1000 - i);
            cache.insert(format!("k{i}"), e);
        }

        // Capacity below the headroom batch: the target floors at half the
        // capacity instead of emptying the cache.
        assert_eq!(cache.len(), 5);
        // The just-inserted entry is the newest and must survive.
        assert!(cache.contains_fresh("k10"));
        assert!(!cache.contains_fresh("k0"));
    }

    #[test]
    fn test_capacity_of_one_keeps_the_newest_entry() {
        let cache = CacheLayer::new(1);
        let mut old = entry(1, identity(100), Duration::from_secs(600), false);
        old.inserted_at = Utc::now() - chrono::Duration::seconds(60);
        cache.insert("old", old);
        cache.insert("new", entry(2, identity(100), Duration::from_secs(600), false));

        assert_eq!(cache.len(), 1);
        assert!(cache.contains_fresh("new"));
    }

    #[test]
    fn test_pinned_entries_survive_normal_pressure() {
        let cache = CacheLayer::new(30);
        cache.insert(
            "pinned",
            entry(0, identity(100), Duration::from_secs(600), true),
        );
        for i in 0..31 {
            cache.insert(
                format!("k{i}"),
                entry(i, identity(100), Duration::from_secs(600), false),
            );
        }

        assert!(cache.contains_fresh("pinned"));
    }

    #[test]
    fn test_sweep_removes_expired_but_defers_pinned() {
        let cache = CacheLayer::new(10);
        let mut stale = entry(1, identity(100), Duration::from_secs(1), false);
        stale.inserted_at = Utc::now() - chrono::Duration::seconds(30);
        cache.insert("stale", stale);

        let mut stale_pinned = entry(2, identity(100), Duration::from_secs(1), true);
        stale_pinned.inserted_at = Utc::now() - chrono::Duration::seconds(30);
        cache.insert("stale_pinned", stale_pinned);

        cache.insert("fresh", entry(3, identity(100), Duration::from_secs(600), false));

        let swept = cache.sweep_expired();
        assert_eq!(swept, 1);
        assert!(!cache.contains_fresh("stale"));
        assert!(cache.contains_fresh("fresh"));
        // Pinned entry deferred while the cache is under capacity. It still
        // reads as expired, so lookups will not serve it.
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_hit_rate() {
        let cache = CacheLayer::new(10);
        cache.insert("k", entry(1, identity(100), Duration::from_secs(60), false));

        cache.get("k", &identity(100));
        cache.get("k", &identity(100));
        cache.get("absent", &identity(100));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }
}
