//! Health reporting types for the store's `health_check` surface.

use serde::{Deserialize, Serialize};

/// Overall health status for the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Store is fully operational.
    Healthy,
    /// Store is operational but degraded (elevated errors or open circuit).
    Degraded,
    /// Store is not operational.
    Unhealthy,
}

/// Point-in-time health report returned by `KeyedStore::health_check`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,
    /// Cache hits divided by total lookups, 0.0 when no lookups yet.
    pub cache_hit_rate: f64,
    /// Errors divided by total operations, 0.0 when no operations yet.
    pub error_rate: f64,
    /// Whether the circuit breaker is currently open.
    pub circuit_open: bool,
    /// Fraction of pinned/critical keys currently resident in cache.
    pub critical_key_availability: f64,
}

impl HealthReport {
    /// Derive the overall status from the component signals.
    ///
    /// An open circuit or an error rate at or above 50% is unhealthy;
    /// any errors at all, or missing critical keys, degrade the report.
    pub fn with_derived_status(mut self) -> Self {
        self.status = if self.circuit_open || self.error_rate >= 0.5 {
            HealthStatus::Unhealthy
        } else if self.error_rate > 0.0 || self.critical_key_availability < 1.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        self
    }
}
