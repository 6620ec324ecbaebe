//! Background cache janitor.
//!
//! Periodically sweeps expired cache entries so memory is reclaimed even
//! for keys that are never read again. The task runs until the shutdown
//! signal flips and is always cancelled before caches are torn down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::cache::CacheLayer;

/// Counters for janitor activity.
#[derive(Debug, Default)]
pub struct JanitorMetrics {
    /// Sweep cycles completed.
    pub sweeps: AtomicU64,
    /// Entries expired across all sweeps.
    pub expired: AtomicU64,
}

/// Periodic TTL sweep over the cache.
///
/// Runs until `shutdown_rx` observes `true`. Missed ticks are skipped
/// rather than bursted, so a stalled runtime does not trigger back-to-back
/// sweeps.
pub async fn janitor_task(
    cache: Arc<CacheLayer>,
    sweep_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<JanitorMetrics>,
) {
    let mut ticker = interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = sweep_interval.as_secs(),
        "cache janitor started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("cache janitor shutting down");
                    break;
                }
            }
            _ = ticker.tick() => {
                let swept = cache.sweep_expired();
                metrics.sweeps.fetch_add(1, Ordering::Relaxed);
                metrics.expired.fetch_add(swept as u64, Ordering::Relaxed);
                if swept > 0 {
                    tracing::debug!(swept, resident = cache.len(), "janitor sweep");
                }
            }
        }
    }
}
