//! Configuration errors shared by every adapter built on this crate.

use std::path::PathBuf;

use snafu::prelude::*;

/// Errors raised while loading or reading a job configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A required key is absent or blank.
    #[snafu(display("Missing required configuration key '{key}'"))]
    MissingKey { key: String },

    /// A key is present but its value cannot be used.
    #[snafu(display("Invalid value '{value}' for configuration key '{key}': {reason}"))]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}: {source}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
}
