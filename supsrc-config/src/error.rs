//! Errors for configuration loading and validation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("invalid rule for repository '{repo_id}': {reason}")]
    InvalidRule { repo_id: String, reason: String },

    #[error("invalid duration literal '{0}': expected a number followed by s/m/h")]
    InvalidDuration(String),

    #[error("repository '{0}' has an empty path")]
    EmptyPath(String),

    #[error("repository id must not be empty")]
    EmptyRepoId,
}

pub type Result<T> = std::result::Result<T, ConfigError>;
