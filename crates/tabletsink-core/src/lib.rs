//! tabletsink-core: shared plumbing for the tabletsink output adapter.
//!
//! - `config/` - `JobConf` string-keyed job configuration, YAML loading and
//!   environment variable interpolation
//! - `metrics/` - internal metric events and the `emit!` macro
//! - `error` - configuration errors
//! - `tracing` - subscriber initialisation for binaries and tests

pub mod config;
pub mod error;
pub mod metrics;
pub mod tracing;

pub use config::{InterpolationResult, JobConf, interpolate};
pub use error::ConfigError;
pub use tracing::init_tracing;
