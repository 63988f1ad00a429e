//! Error types for config parsing and plan validation.

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A plan or config value that cannot be expressed as a worker target.
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),
}
