//! Store configuration.
//!
//! Every knob is an explicit field; there are no hidden defaults read at
//! runtime. `Default` provides the baseline values; builders adjust
//! individual fields; [`StoreConfig::validate`] rejects inconsistent
//! combinations once, at construction time.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Retry and circuit-breaker tuning for I/O operations.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    /// Maximum retry attempts after the initial try.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied per attempt: delay = base * factor^attempt.
    pub backoff_factor: f64,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe.
    pub cooldown: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Configuration for the keyed document store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Root directory for resolved document paths.
    pub data_dir: PathBuf,
    /// Maximum number of cache entries before batch eviction.
    pub max_cache_entries: usize,
    /// TTL for the normal class (frequently mutated records).
    pub normal_ttl: Duration,
    /// TTL for the lazy class (rarely-changing reference data).
    pub lazy_ttl: Duration,
    /// Retry and breaker tuning.
    pub resilience: ResilienceConfig,
    /// Serialized payloads above this size get a compressed sibling.
    pub compress_threshold: usize,
    /// Serialized payloads above this size are re-read and hash-checked
    /// before the rename commits.
    pub verify_threshold: usize,
    /// Hard ceiling on serialized payload size.
    pub max_payload_bytes: usize,
    /// How long a follower waits on an in-flight load before giving up
    /// and loading independently.
    pub load_wait_timeout: Duration,
    /// Janitor sweep interval.
    pub janitor_interval: Duration,
    /// Default delay for auto-expiring families (overridable per family).
    pub auto_expiry_delay: Duration,
    /// Concurrent blocking-pool permits for large-payload work.
    pub blocking_permits: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            max_cache_entries: 2_000,
            normal_ttl: Duration::from_secs(600),
            lazy_ttl: Duration::from_secs(1_200),
            resilience: ResilienceConfig::default(),
            compress_threshold: 50_000,
            verify_threshold: 250_000,
            max_payload_bytes: 16 * 1024 * 1024,
            load_wait_timeout: Duration::from_secs(5),
            janitor_interval: Duration::from_secs(60),
            auto_expiry_delay: Duration::from_secs(45 * 60),
            blocking_permits: 4,
        }
    }
}

impl StoreConfig {
    /// Create a config rooted at the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Set the maximum number of cache entries.
    pub fn with_max_cache_entries(mut self, max: usize) -> Self {
        self.max_cache_entries = max;
        self
    }

    /// Set the normal-class TTL.
    pub fn with_normal_ttl(mut self, ttl: Duration) -> Self {
        self.normal_ttl = ttl;
        self
    }

    /// Set the lazy-class TTL.
    pub fn with_lazy_ttl(mut self, ttl: Duration) -> Self {
        self.lazy_ttl = ttl;
        self
    }

    /// Set retry and breaker tuning.
    pub fn with_resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.resilience = resilience;
        self
    }

    /// Set the compression threshold in bytes.
    pub fn with_compress_threshold(mut self, bytes: usize) -> Self {
        self.compress_threshold = bytes;
        self
    }

    /// Set the verify-by-reread threshold in bytes.
    pub fn with_verify_threshold(mut self, bytes: usize) -> Self {
        self.verify_threshold = bytes;
        self
    }

    /// Set the in-flight load wait timeout.
    pub fn with_load_wait_timeout(mut self, timeout: Duration) -> Self {
        self.load_wait_timeout = timeout;
        self
    }

    /// Set the janitor sweep interval.
    pub fn with_janitor_interval(mut self, interval: Duration) -> Self {
        self.janitor_interval = interval;
        self
    }

    /// Set the default auto-expiry delay.
    pub fn with_auto_expiry_delay(mut self, delay: Duration) -> Self {
        self.auto_expiry_delay = delay;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_cache_entries".to_string(),
                value: "0".to_string(),
                reason: "cache must hold at least one entry".to_string(),
            });
        }

        if self.resilience.backoff_factor < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "resilience.backoff_factor".to_string(),
                value: self.resilience.backoff_factor.to_string(),
                reason: "backoff factor must be >= 1.0".to_string(),
            });
        }

        if self.resilience.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "resilience.failure_threshold".to_string(),
                value: "0".to_string(),
                reason: "threshold of zero would keep the circuit permanently open"
                    .to_string(),
            });
        }

        if self.lazy_ttl < self.normal_ttl {
            return Err(ConfigError::InvalidValue {
                field: "lazy_ttl".to_string(),
                value: format!("{:?}", self.lazy_ttl),
                reason: "lazy TTL must be at least the normal TTL".to_string(),
            });
        }

        if self.verify_threshold > self.max_payload_bytes {
            return Err(ConfigError::InvalidValue {
                field: "verify_threshold".to_string(),
                value: self.verify_threshold.to_string(),
                reason: "verify threshold above the payload ceiling never fires"
                    .to_string(),
            });
        }

        if self.blocking_permits == 0 {
            return Err(ConfigError::InvalidValue {
                field: "blocking_permits".to_string(),
                value: "0".to_string(),
                reason: "at least one blocking permit is required".to_string(),
            });
        }

        Ok(())
    }
}
