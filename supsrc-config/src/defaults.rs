//! Default configuration, used when no config file is present.

use crate::types::Config;

/// Get the default configuration: empty `repositories`, global defaults.
pub fn default_config() -> Config {
    Config::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_repositories() {
        let config = default_config();
        assert!(config.repositories.is_empty());
        assert_eq!(config.global.log_level, "info");
    }
}
