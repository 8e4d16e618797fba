//! Configuration schema, parsing, and defaults for supsrc.
//!
//! The CLI front-end that gathers flags and hands them to this crate is out
//! of scope (see spec Non-goals); this crate only owns the document itself:
//! the `global` / `global.circuit_breaker` / `repositories.<id>` schema of
//! the config file, its defaults, and `--config-path` / `SUPSRC_CONF`
//! resolution.

mod defaults;
mod duration;
mod error;
mod parser;
mod types;

pub use defaults::default_config;
pub use duration::DurationLiteral;
pub use error::{ConfigError, Result};
pub use parser::{load_from_file, load_or_default, resolve_config_path};
pub use types::{
    CircuitBreakerConfig, Config, EngineConfig, GlobalConfig, GroupingMode, LlmConfig,
    RepositoryConfig, Rule,
};

use std::path::PathBuf;

/// Environment variable that names the config file, overridden by `--config-path`.
pub const CONFIG_PATH_ENV_VAR: &str = "SUPSRC_CONF";

/// Default config directory (`~/.supsrc/`).
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
    .expect("cannot find home directory")
    .join(".supsrc")
}

/// Default config file path (`~/.supsrc/config.toml`).
pub fn default_config_file() -> PathBuf {
    config_dir().join("config.toml")
}
