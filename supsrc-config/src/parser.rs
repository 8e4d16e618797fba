//! TOML configuration parsing, validation, and path resolution.

use crate::error::{ConfigError, Result};
use crate::types::Config;
use std::path::{Path, PathBuf};

/// Parse a config document from a TOML string, validating it afterwards.
pub fn parse_toml(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load a config document from a specific file.
pub fn load_from_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
    })?;
    parse_toml(&content)
}

/// Load from the resolved config path, or fall back to defaults if the file
/// does not exist.
pub fn load_or_default(config_path_flag: Option<&Path>) -> Result<Config> {
    let path = resolve_config_path(config_path_flag);
    match path {
        Some(path) if path.exists() => load_from_file(&path),
        _ => Ok(crate::defaults::default_config()),
    }
}

/// Resolve the config file path: an explicit `--config-path` flag wins
/// over the `SUPSRC_CONF` environment variable, which wins over the
/// default `~/.supsrc/config.toml`.
pub fn resolve_config_path(config_path_flag: Option<&Path>) -> Option<PathBuf> {
    if let Some(flag) = config_path_flag {
        return Some(flag.to_path_buf());
    }
    if let Ok(env_path) = std::env::var(crate::CONFIG_PATH_ENV_VAR) {
        if !env_path.is_empty() {
            return Some(PathBuf::from(env_path));
        }
    }
    Some(crate::default_config_file())
}

/// Validate configuration for semantic consistency beyond what serde checks.
fn validate_config(config: &Config) -> Result<()> {
    for (repo_id, repo) in &config.repositories {
        if repo_id.is_empty() {
            return Err(ConfigError::EmptyRepoId);
        }
        if repo.path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath(repo_id.clone()));
        }
        if let crate::types::Rule::SaveCount { count } = &repo.rule {
            if *count == 0 {
                return Err(ConfigError::InvalidRule {
                        repo_id: repo_id.clone(),
                        reason: "save_count rule must have count >= 1".to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let toml = r#"
 [global]
 log_level = "debug"

 [repositories.demo]
 path = "/tmp/demo"

 [repositories.demo.rule]
 type = "save_count"
 count = 3
 "#;
        let config = parse_toml(toml).unwrap();
        assert_eq!(config.global.log_level, "debug");
        let repo = config.repositories.get("demo").unwrap();
        assert!(repo.enabled);
        match &repo.rule {
            crate::types::Rule::SaveCount { count } => assert_eq!(*count, 3),
            other => panic!("unexpected rule: {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_save_count() {
        let toml = r#"
 [repositories.demo]
 path = "/tmp/demo"

 [repositories.demo.rule]
 type = "save_count"
 count = 0
 "#;
        assert!(matches!(
                parse_toml(toml),
                Err(ConfigError::InvalidRule { .. })
        ));
    }

    #[test]
    fn config_path_flag_wins_over_env() {
        std::env::set_var("SUPSRC_CONF", "/from/env.toml");
        let resolved = resolve_config_path(Some(Path::new("/from/flag.toml")));
        assert_eq!(resolved, Some(PathBuf::from("/from/flag.toml")));
        std::env::remove_var("SUPSRC_CONF");
    }

    #[test]
    fn env_var_used_when_no_flag() {
        std::env::set_var("SUPSRC_CONF", "/from/env.toml");
        let resolved = resolve_config_path(None);
        assert_eq!(resolved, Some(PathBuf::from("/from/env.toml")));
        std::env::remove_var("SUPSRC_CONF");
    }
}
