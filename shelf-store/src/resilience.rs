//! Retry with exponential backoff and a store-wide circuit breaker.
//!
//! Every physical I/O operation runs through [`Resilience::run`]. Transient
//! failures are retried with exponentially growing, jittered delays; the
//! jitter (10-30% added to each delay) keeps independent callers from
//! retrying in lockstep. Exhausted operations count one consecutive failure
//! toward the breaker; at the threshold the circuit opens and every
//! operation fails fast with [`ShelfError::CircuitOpen`] until the cooldown
//! elapses, after which a single half-open probe is allowed through. One
//! success closes the circuit and resets the counter.
//!
//! Non-transient errors (serialization, validation, integrity) bypass both
//! retry and the breaker entirely: retrying them cannot succeed.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use shelf_core::{ResilienceConfig, ShelfError, ShelfResult};

/// Upper bound on any single backoff delay, whatever the configuration.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponential backoff schedule with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: ResilienceConfig,
}

impl RetryPolicy {
    /// Create a policy from resilience tuning.
    pub fn new(config: ResilienceConfig) -> Self {
        Self { config }
    }

    /// Maximum retry attempts after the initial try.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Delay before retry number `attempt` (zero-based), with 10-30%
    /// random jitter added and capped at [`MAX_BACKOFF`].
    ///
    /// With a backoff factor of at least 2 the jittered delays are still
    /// monotonically non-decreasing up to the cap: the smallest possible
    /// next delay (factor x 1.10) exceeds the largest possible previous
    /// one (1.30). The cap keeps runaway factor/attempt combinations from
    /// producing a delay `Duration` cannot represent.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64()
            * self.config.backoff_factor.powi(attempt as i32);
        let jitter = rand::rng().random_range(0.10..=0.30);
        let secs = (base * (1.0 + jitter)).min(MAX_BACKOFF.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug)]
struct CircuitState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    open: bool,
}

/// Store-wide circuit breaker over consecutive transient I/O failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    /// Create a breaker from resilience tuning.
    pub fn new(config: &ResilienceConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown,
            state: Mutex::new(CircuitState {
                consecutive_failures: 0,
                last_failure: None,
                open: false,
            }),
        }
    }

    /// Check whether an operation may proceed.
    ///
    /// While open and inside the cooldown window this fails fast without
    /// touching I/O. After the cooldown the call is allowed through as a
    /// half-open probe; the circuit only closes when that probe succeeds.
    pub fn check(&self) -> ShelfResult<()> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.open {
            return Ok(());
        }

        let elapsed = state
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);
        if elapsed > self.cooldown {
            // Half-open: let this attempt probe the backend.
            Ok(())
        } else {
            Err(ShelfError::CircuitOpen {
                retry_after: self.cooldown - elapsed,
            })
        }
    }

    /// Record a successful operation: closes the circuit and resets the
    /// consecutive failure count.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.open {
            tracing::info!("circuit closed after successful probe");
        }
        state.consecutive_failures = 0;
        state.last_failure = None;
        state.open = false;
    }

    /// Record a transient failure (after retry exhaustion).
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());
        if state.consecutive_failures >= self.failure_threshold && !state.open {
            state.open = true;
            tracing::warn!(
                consecutive_failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit opened"
            );
        } else if state.open {
            // A failed half-open probe re-arms the cooldown from now.
            tracing::warn!("half-open probe failed, circuit stays open");
        }
    }

    /// Whether the circuit is currently open.
    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .open
    }
}

/// Retry policy and circuit breaker wired together.
#[derive(Debug)]
pub struct Resilience {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    retries: AtomicU64,
}

impl Resilience {
    /// Create from resilience tuning.
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(&config),
            retry: RetryPolicy::new(config),
            retries: AtomicU64::new(0),
        }
    }

    /// Whether the breaker is open.
    pub fn circuit_open(&self) -> bool {
        self.breaker.is_open()
    }

    /// Total retry attempts made since construction.
    pub fn retries_total(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Run `op`, retrying transient failures with backoff and reporting
    /// the final outcome to the breaker.
    ///
    /// An open circuit fails fast before `op` is ever polled and without
    /// consuming retry budget. Non-transient errors return immediately and
    /// leave the breaker untouched.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> ShelfResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ShelfResult<T>>,
    {
        self.breaker.check()?;

        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_retries() => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        self.breaker.record_failure();
                    }
                    return Err(e);
                }
            }
        }
    }
}
