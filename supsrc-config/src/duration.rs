//! Parsing for duration literals like `"30s"`, `"5m"`, `"1h"`.

use crate::error::ConfigError;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// A duration parsed from a config-file literal such as `"30s"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationLiteral(pub Duration);

impl DurationLiteral {
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn parse(literal: &str) -> Result<Self, ConfigError> {
        let literal = literal.trim();
        let (digits, unit) = literal.split_at(
            literal
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| ConfigError::InvalidDuration(literal.to_string()))?,
        );
        let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(literal.to_string()))?;
        let secs = match unit {
            "s" => value,
            "m" => value * 60,
            "h" => value * 3600,
            _ => return Err(ConfigError::InvalidDuration(literal.to_string())),
        };
        Ok(Self(Duration::from_secs(secs)))
    }
}

impl Serialize for DurationLiteral {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}s", self.0.as_secs()))
    }
}

impl<'de> Deserialize<'de> for DurationLiteral {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DurationLiteral::parse(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds_minutes_hours() {
        assert_eq!(DurationLiteral::parse("30s").unwrap().0, Duration::from_secs(30));
        assert_eq!(DurationLiteral::parse("5m").unwrap().0, Duration::from_secs(300));
        assert_eq!(DurationLiteral::parse("1h").unwrap().0, Duration::from_secs(3600));
    }

    #[test]
    fn rejects_garbage() {
        assert!(DurationLiteral::parse("thirty").is_err());
        assert!(DurationLiteral::parse("30x").is_err());
        assert!(DurationLiteral::parse("").is_err());
    }
}
