//! Debounced one-shot auto-expiry timers.
//!
//! For families registered with an auto-expiry policy, every successful
//! save schedules a delayed task that clears the record. Scheduling the
//! same key again aborts the pending task before installing the new one,
//! so at most one timer exists per key. All pending timers are aborted on
//! shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

type TaskMap = Arc<Mutex<HashMap<String, (u64, JoinHandle<()>)>>>;

/// Registry of pending per-key expiry tasks.
pub struct AutoExpiryScheduler {
    tasks: TaskMap,
    /// Monotonic generation so a finished task only removes its own entry,
    /// never a newer timer scheduled for the same key.
    generation: Mutex<u64>,
}

impl std::fmt::Debug for AutoExpiryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoExpiryScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Default for AutoExpiryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoExpiryScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            generation: Mutex::new(0),
        }
    }

    /// Schedule `clear` to run after `delay`, replacing (debouncing) any
    /// timer already pending for `key`.
    pub fn schedule<F, Fut>(&self, key: &str, delay: Duration, clear: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = {
            let mut g = self.generation.lock().unwrap_or_else(|e| e.into_inner());
            *g += 1;
            *g
        };

        let tasks = Arc::clone(&self.tasks);
        let task_key = key.to_string();
        let handle = tokio::spawn({
            let tasks = Arc::clone(&tasks);
            let task_key = task_key.clone();
            async move {
                tokio::time::sleep(delay).await;
                clear().await;
                let mut map = tasks.lock().unwrap_or_else(|e| e.into_inner());
                // Only remove our own entry; a newer timer may have replaced it.
                if map.get(&task_key).map(|(g, _)| *g) == Some(generation) {
                    map.remove(&task_key);
                }
            }
        });

        let mut map = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, previous)) = map.insert(task_key.clone(), (generation, handle)) {
            previous.abort();
            tracing::debug!(key = %task_key, "rescheduled pending auto-expiry timer");
        }
    }

    /// Cancel the pending timer for `key`, if any.
    pub fn cancel(&self, key: &str) -> bool {
        let mut map = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        match map.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer. Called on shutdown before caches and
    /// locks are torn down.
    pub fn cancel_all(&self) {
        let mut map = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let cancelled = map.len();
        for (_, (_, handle)) in map.drain() {
            handle.abort();
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled pending auto-expiry timers");
        }
    }

    /// Number of timers currently pending.
    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
