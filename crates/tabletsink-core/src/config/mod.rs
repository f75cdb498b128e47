//! String-keyed job configuration.
//!
//! Batch frameworks hand every component the same flat `key -> value` mapping.
//! `JobConf` models that mapping: components read typed values from it and may
//! publish new entries (for example a registry key) for collaborators running
//! in the same task.

mod vars;

pub use vars::{InterpolationResult, interpolate};

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use snafu::prelude::*;

use crate::error::{
    ConfigError, EnvInterpolationSnafu, InvalidValueSnafu, MissingKeySnafu, ReadFileSnafu,
    YamlParseSnafu,
};

/// Ordered, string-keyed job configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobConf {
    entries: IndexMap<String, String>,
}

impl JobConf {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a flat YAML mapping after environment interpolation.
    ///
    /// Scalar values (strings, numbers, booleans) are stored in their string
    /// form; `null` entries are skipped; nested values are rejected.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let result = interpolate(contents);
        ensure!(
            result.is_ok(),
            EnvInterpolationSnafu {
                message: result.errors.join("\n"),
            }
        );

        if result.text.trim().is_empty() {
            return Ok(Self::new());
        }

        let raw: IndexMap<String, Value> =
            serde_yaml::from_str(&result.text).context(YamlParseSnafu)?;

        let mut conf = Self::new();
        for (key, value) in raw {
            let value = match value {
                Value::Null => continue,
                Value::String(s) => s,
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                other => {
                    return InvalidValueSnafu {
                        key,
                        value: format!("{other:?}"),
                        reason: "expected a scalar value",
                    }
                    .fail();
                }
            };
            conf.set(key, value);
        }
        Ok(conf)
    }

    /// Load a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        Self::from_yaml_str(&contents)
    }

    /// Set `key` to `value`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Remove `key`, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.shift_remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Get a value that must be present and non-blank.
    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .context(MissingKeySnafu { key })
    }

    /// Parse `key` into `T`, returning `None` when the key is absent.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        raw.trim().parse::<T>().map(Some).map_err(|e| {
            InvalidValueSnafu {
                key,
                value: raw,
                reason: e.to_string(),
            }
            .build()
        })
    }

    /// Parse `key` as an unsigned integer, falling back to `default`.
    pub fn get_u64_or(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    /// Parse `key` as a millisecond duration, falling back to `default_ms`.
    pub fn get_duration_ms_or(&self, key: &str, default_ms: u64) -> Result<Duration, ConfigError> {
        self.get_u64_or(key, default_ms).map(Duration::from_millis)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for JobConf {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut conf = Self::new();
        for (k, v) in iter {
            conf.set(k, v);
        }
        conf
    }
}
