//! Per-path locking and in-flight load deduplication.
//!
//! Every read, write, and delete against a path must hold that path's
//! mutex, which linearizes read-modify-write cycles per document. The
//! coordinator also tracks loads in flight per logical key: the first
//! caller becomes the leader and performs the physical load, later callers
//! become followers and wait on the leader's completion signal with a
//! bounded timeout, after which they proceed independently rather than
//! deadlock behind a stuck leader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

type InFlightMap = Arc<Mutex<HashMap<String, watch::Receiver<bool>>>>;

/// Outcome of attempting to start a load for a key.
pub enum LoadAttempt {
    /// This caller performs the physical load; the token signals
    /// completion to followers when dropped.
    Leader(LoadToken),
    /// Another load is in flight; wait on it via
    /// [`ConcurrencyCoordinator::wait_for_leader`].
    Follower(watch::Receiver<bool>),
}

/// In-flight marker held by the leader for the duration of a load.
///
/// Dropping the token removes the in-flight entry and wakes all followers,
/// whether the load succeeded or failed. Followers re-check the cache to
/// learn the outcome.
pub struct LoadToken {
    key: String,
    tx: watch::Sender<bool>,
    registry: InFlightMap,
}

impl Drop for LoadToken {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
        let _ = self.tx.send(true);
    }
}

/// Per-path mutexes plus the in-flight load registry.
pub struct ConcurrencyCoordinator {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    in_flight: InFlightMap,
}

impl std::fmt::Debug for ConcurrencyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyCoordinator")
            .field(
                "locks",
                &self.locks.lock().unwrap_or_else(|e| e.into_inner()).len(),
            )
            .field(
                "in_flight",
                &self
                    .in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .len(),
            )
            .finish()
    }
}

impl Default for ConcurrencyCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrencyCoordinator {
    /// Create an empty coordinator.
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The mutex guarding all operations on `path`.
    pub fn path_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Register a load for `key`, becoming leader or follower.
    pub fn begin_load(&self, key: &str) -> LoadAttempt {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rx) = in_flight.get(key) {
            return LoadAttempt::Follower(rx.clone());
        }

        let (tx, rx) = watch::channel(false);
        in_flight.insert(key.to_string(), rx);
        LoadAttempt::Leader(LoadToken {
            key: key.to_string(),
            tx,
            registry: Arc::clone(&self.in_flight),
        })
    }

    /// Wait for an in-flight load to complete, bounded by `timeout`.
    ///
    /// Returns `true` if the leader signalled completion, `false` on
    /// timeout (the caller should proceed with its own load).
    pub async fn wait_for_leader(
        &self,
        key: &str,
        mut rx: watch::Receiver<bool>,
        timeout: Duration,
    ) -> bool {
        match tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await {
            Ok(Ok(_)) => true,
            // Sender dropped without signalling also means the load ended.
            Ok(Err(_)) => true,
            Err(_) => {
                tracing::warn!(key, timeout_ms = timeout.as_millis() as u64, "in-flight load wait timed out, loading independently");
                false
            }
        }
    }

    /// Number of loads currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_path_returns_same_lock() {
        let coordinator = ConcurrencyCoordinator::new();
        let a = coordinator.path_lock(Path::new("/data/a.json"));
        let b = coordinator.path_lock(Path::new("/data/a.json"));
        assert!(Arc::ptr_eq(&a, &b));

        let c = coordinator.path_lock(Path::new("/data/c.json"));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_second_load_becomes_follower() {
        let coordinator = ConcurrencyCoordinator::new();

        let leader = coordinator.begin_load("scores");
        assert!(matches!(leader, LoadAttempt::Leader(_)));
        assert_eq!(coordinator.in_flight_count(), 1);

        let follower = coordinator.begin_load("scores");
        assert!(matches!(follower, LoadAttempt::Follower(_)));

        // Distinct keys load independently.
        assert!(matches!(
            coordinator.begin_load("monsters"),
            LoadAttempt::Leader(_)
        ));
    }

    #[tokio::test]
    async fn test_token_drop_wakes_followers() {
        let coordinator = Arc::new(ConcurrencyCoordinator::new());

        let token = match coordinator.begin_load("scores") {
            LoadAttempt::Leader(token) => token,
            LoadAttempt::Follower(_) => panic!("expected leader"),
        };
        let rx = match coordinator.begin_load("scores") {
            LoadAttempt::Follower(rx) => rx,
            LoadAttempt::Leader(_) => panic!("expected follower"),
        };

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .wait_for_leader("scores", rx, Duration::from_secs(5))
                    .await
            })
        };

        drop(token);
        assert!(waiter.await.unwrap());
        assert_eq!(coordinator.in_flight_count(), 0);

        // The key is loadable again after the leader finishes.
        assert!(matches!(
            coordinator.begin_load("scores"),
            LoadAttempt::Leader(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_times_out_on_stuck_leader() {
        let coordinator = ConcurrencyCoordinator::new();

        let _token = match coordinator.begin_load("scores") {
            LoadAttempt::Leader(token) => token,
            LoadAttempt::Follower(_) => panic!("expected leader"),
        };
        let rx = match coordinator.begin_load("scores") {
            LoadAttempt::Follower(rx) => rx,
            LoadAttempt::Leader(_) => panic!("expected follower"),
        };

        let completed = coordinator
            .wait_for_leader("scores", rx, Duration::from_millis(100))
            .await;
        assert!(!completed);
    }
}
