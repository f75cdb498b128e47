//! Output adapter configuration.
//!
//! Settings arrive as string entries in the job configuration and are parsed
//! once into an [`OutputConfig`] when the adapter is configured.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tabletsink_core::JobConf;
use tabletsink_core::error::{ConfigError, InvalidValueSnafu};

use crate::session::{FlushMode, MAX_BUFFER_CAPACITY, SessionOptions};

pub const OUTPUT_TABLE_KEY: &str = "tabletsink.output.table";
pub const MASTER_ADDRESSES_KEY: &str = "tabletsink.output.master.addresses";
pub const OPERATION_TIMEOUT_MS_KEY: &str = "tabletsink.output.operation.timeout.ms";
pub const BUFFER_ROW_COUNT_KEY: &str = "tabletsink.output.buffer.row.count";
pub const FLUSH_INTERVAL_MS_KEY: &str = "tabletsink.output.flush.interval.ms";
pub const UNCLASSIFIED_POLICY_KEY: &str = "tabletsink.output.unclassified.policy";
/// Written by the adapter: the task key its table is registered under.
pub const REGISTRY_KEY: &str = "tabletsink.output.registry.key";

/// What a writer does with failures it cannot attribute to rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnclassifiedPolicy {
    /// Fail the write or close that observes the failure.
    #[default]
    Strict,
    /// Log and count only.
    Lenient,
}

impl UnclassifiedPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnclassifiedPolicy::Strict => "strict",
            UnclassifiedPolicy::Lenient => "lenient",
        }
    }
}

impl fmt::Display for UnclassifiedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnclassifiedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(UnclassifiedPolicy::Strict),
            "lenient" => Ok(UnclassifiedPolicy::Lenient),
            other => Err(format!("expected 'strict' or 'lenient', got '{other}'")),
        }
    }
}

/// Parsed adapter settings. Immutable once the adapter is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Target table name.
    pub table: String,
    /// Comma-separated master addresses.
    pub master_addresses: String,
    /// Deadline for connect, open and each batch write.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// Mutations buffered before writers wait.
    #[serde(default = "default_buffer_row_count")]
    pub buffer_row_count: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub unclassified_policy: UnclassifiedPolicy,
}

fn default_operation_timeout_ms() -> u64 {
    10_000
}

fn default_buffer_row_count() -> usize {
    1000
}

fn default_flush_interval_ms() -> u64 {
    1000
}

impl OutputConfig {
    pub fn new(table: impl Into<String>, master_addresses: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            master_addresses: master_addresses.into(),
            operation_timeout_ms: default_operation_timeout_ms(),
            buffer_row_count: default_buffer_row_count(),
            flush_interval_ms: default_flush_interval_ms(),
            unclassified_policy: UnclassifiedPolicy::default(),
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_buffer_row_count(mut self, rows: usize) -> Self {
        self.buffer_row_count = rows;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_unclassified_policy(mut self, policy: UnclassifiedPolicy) -> Self {
        self.unclassified_policy = policy;
        self
    }

    /// Parse and validate the adapter settings from a job configuration.
    pub fn from_conf(conf: &JobConf) -> Result<Self, ConfigError> {
        let config = Self {
            table: conf.require(OUTPUT_TABLE_KEY)?.to_string(),
            master_addresses: conf.require(MASTER_ADDRESSES_KEY)?.to_string(),
            operation_timeout_ms: conf
                .get_u64_or(OPERATION_TIMEOUT_MS_KEY, default_operation_timeout_ms())?,
            buffer_row_count: conf
                .get_parsed(BUFFER_ROW_COUNT_KEY)?
                .unwrap_or_else(default_buffer_row_count),
            flush_interval_ms: conf
                .get_u64_or(FLUSH_INTERVAL_MS_KEY, default_flush_interval_ms())?,
            unclassified_policy: conf
                .get_parsed(UNCLASSIFIED_POLICY_KEY)?
                .unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value bounds. `from_conf` runs this; configs built in code are
    /// checked when an output is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_row_count == 0 {
            return InvalidValueSnafu {
                key: BUFFER_ROW_COUNT_KEY,
                value: "0",
                reason: "buffer must hold at least one row",
            }
            .fail();
        }
        if self.buffer_row_count > MAX_BUFFER_CAPACITY {
            return InvalidValueSnafu {
                key: BUFFER_ROW_COUNT_KEY,
                value: self.buffer_row_count.to_string(),
                reason: format!("buffer may hold at most {MAX_BUFFER_CAPACITY} rows"),
            }
            .fail();
        }
        if self.operation_timeout_ms == 0 {
            return InvalidValueSnafu {
                key: OPERATION_TIMEOUT_MS_KEY,
                value: "0",
                reason: "timeout must be positive",
            }
            .fail();
        }
        if self.flush_interval_ms == 0 {
            return InvalidValueSnafu {
                key: FLUSH_INTERVAL_MS_KEY,
                value: "0",
                reason: "interval must be positive",
            }
            .fail();
        }
        Ok(())
    }

    /// Write these settings into `conf`, for job drivers building a configuration in code.
    pub fn write_to(&self, conf: &mut JobConf) {
        conf.set(OUTPUT_TABLE_KEY, self.table.as_str());
        conf.set(MASTER_ADDRESSES_KEY, self.master_addresses.as_str());
        conf.set(OPERATION_TIMEOUT_MS_KEY, self.operation_timeout_ms.to_string());
        conf.set(BUFFER_ROW_COUNT_KEY, self.buffer_row_count.to_string());
        conf.set(FLUSH_INTERVAL_MS_KEY, self.flush_interval_ms.to_string());
        conf.set(UNCLASSIFIED_POLICY_KEY, self.unclassified_policy.as_str());
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Options for the session backing every writer of this output.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            timeout: self.operation_timeout(),
            flush_mode: FlushMode::AutoFlushBackground,
            buffer_capacity: self.buffer_row_count,
            flush_interval: self.flush_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_conf() -> JobConf {
        JobConf::from_iter([
            (OUTPUT_TABLE_KEY, "events"),
            (MASTER_ADDRESSES_KEY, "master-1:7051,master-2:7051"),
        ])
    }

    #[test]
    fn test_defaults() {
        let config = OutputConfig::from_conf(&base_conf()).unwrap();
        assert_eq!(config.table, "events");
        assert_eq!(config.operation_timeout(), Duration::from_secs(10));
        assert_eq!(config.buffer_row_count, 1000);
        assert_eq!(config.flush_interval(), Duration::from_secs(1));
        assert_eq!(config.unclassified_policy, UnclassifiedPolicy::Strict);
    }

    #[test]
    fn test_overrides() {
        let mut conf = base_conf();
        conf.set(OPERATION_TIMEOUT_MS_KEY, "250");
        conf.set(BUFFER_ROW_COUNT_KEY, "16");
        conf.set(UNCLASSIFIED_POLICY_KEY, "LENIENT");

        let config = OutputConfig::from_conf(&conf).unwrap();
        assert_eq!(config.operation_timeout(), Duration::from_millis(250));
        assert_eq!(config.unclassified_policy, UnclassifiedPolicy::Lenient);

        let options = config.session_options();
        assert_eq!(options.buffer_capacity, 16);
        assert_eq!(options.flush_mode, FlushMode::AutoFlushBackground);
    }

    #[test]
    fn test_missing_table() {
        let conf = JobConf::from_iter([(MASTER_ADDRESSES_KEY, "master-1:7051")]);
        let err = OutputConfig::from_conf(&conf).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { ref key } if key == OUTPUT_TABLE_KEY));
    }

    #[test]
    fn test_rejects_zero_buffer() {
        let mut conf = base_conf();
        conf.set(BUFFER_ROW_COUNT_KEY, "0");
        let err = OutputConfig::from_conf(&conf).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_rejects_oversized_buffer() {
        let mut conf = base_conf();
        conf.set(BUFFER_ROW_COUNT_KEY, (1u64 << 62).to_string());
        let err = OutputConfig::from_conf(&conf).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == BUFFER_ROW_COUNT_KEY));

        conf.set(BUFFER_ROW_COUNT_KEY, MAX_BUFFER_CAPACITY.to_string());
        assert!(OutputConfig::from_conf(&conf).is_ok());
    }

    #[test]
    fn test_rejects_unknown_policy() {
        let mut conf = base_conf();
        conf.set(UNCLASSIFIED_POLICY_KEY, "sometimes");
        let err = OutputConfig::from_conf(&conf).unwrap_err();
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn test_write_to_round_trips_through_conf() {
        let config = OutputConfig::new("events", "master-1:7051")
            .with_buffer_row_count(8)
            .with_unclassified_policy(UnclassifiedPolicy::Lenient);
        let mut conf = JobConf::new();
        config.write_to(&mut conf);

        assert_eq!(OutputConfig::from_conf(&conf).unwrap(), config);
    }

    #[test]
    fn test_deserialize_with_serde_defaults() {
        let config: OutputConfig =
            serde_json::from_str(r#"{"table": "events", "master_addresses": "m:7051"}"#).unwrap();
        assert_eq!(config, OutputConfig::new("events", "m:7051"));
    }
}
