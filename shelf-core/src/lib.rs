//! SHELF Core - data model, errors, and configuration
//!
//! Leaf crate shared by the store engine and its callers. Holds the
//! caller-facing types ([`Record`], [`TtlClass`], [`HealthReport`]), the
//! error taxonomy ([`ShelfError`]), and the explicit configuration surface
//! ([`StoreConfig`]). No I/O happens in this crate.

pub mod config;
pub mod error;
pub mod health;
pub mod record;

pub use config::{ConfigError, ResilienceConfig, StoreConfig};
pub use error::{ShelfError, ShelfResult};
pub use health::{HealthReport, HealthStatus};
pub use record::{FileIdentity, Record, TtlClass};
