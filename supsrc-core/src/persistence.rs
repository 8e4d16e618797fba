//! Per-repo persisted state files under `<repo>/.supsrc/`.
//!
//! Split into a shared document (safe to commit, read by any clone) and a
//! local document (this machine's timers and circuit-breaker state, never
//! committed); `metadata.version` gates forward-compatible schema changes.

use crate::error::PersistenceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const STATE_SCHEMA_VERSION: &str = "2.0.0";

fn state_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(".supsrc")
}

pub fn shared_state_path(repo_root: &Path) -> PathBuf {
    state_dir(repo_root).join("state.json")
}

pub fn local_state_path(repo_root: &Path) -> PathBuf {
    state_dir(repo_root).join("state.local.json")
}

/// Per-repository overrides nested under `state.repositories.<id>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RepoOverride {
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub save_count_disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactivity_seconds: Option<u64>,
    #[serde(default)]
    pub rule_overrides: serde_json::Map<String, Value>,
}

/// The `state` object shared by both the shared and local documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateBody {
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_by: Option<String>,
    #[serde(default)]
    pub repositories: HashMap<String, RepoOverride>,
}

/// The `metadata` object; `local_overrides`/`pid` only appear in the local
/// document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub version: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_overrides: Option<serde_json::Map<String, Value>>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            version: STATE_SCHEMA_VERSION.to_string(),
            updated_at: Utc::now(),
            pid: None,
            local_overrides: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateDocument {
    pub state: StateBody,
    pub metadata: Metadata,
}

impl StateDocument {
    /// Validate the structural invariant: the top-level value is an object
    /// with an object `state` and an object `metadata` containing a
    /// `version` string. `serde`'s strict struct deserialization already
    /// enforces shape, so this re-checks the raw document for callers that
    /// received arbitrary bytes before deciding whether to parse.
    pub fn validate_raw(raw: &Value) -> Result<(), PersistenceError> {
        let obj = raw
        .as_object()
        .ok_or_else(|| PersistenceError::InvalidDocument("top-level value is not an object".into()))?;
        let state = obj
        .get("state")
        .ok_or_else(|| PersistenceError::InvalidDocument("missing `state`".into()))?;
        if !state.is_object() {
            return Err(PersistenceError::InvalidDocument("`state` is not an object".into()));
        }
        let metadata = obj
        .get("metadata")
        .ok_or_else(|| PersistenceError::InvalidDocument("missing `metadata`".into()))?;
        let metadata = metadata
        .as_object()
        .ok_or_else(|| PersistenceError::InvalidDocument("`metadata` is not an object".into()))?;
        match metadata.get("version") {
            Some(Value::String(_)) => Ok(()),
            _ => Err(PersistenceError::InvalidDocument(
                    "`metadata.version` is not a string".into(),
            )),
        }
    }

    pub fn load(path: &Path) -> Result<Self, PersistenceError> {
        let bytes = std::fs::read(path).map_err(|source| PersistenceError::Read {
                path: path.to_path_buf(),
                source,
        })?;
        let raw: Value = serde_json::from_slice(&bytes)?;
        Self::validate_raw(&raw)?;
        Ok(serde_json::from_value(raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
            })?;
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes).map_err(|source| PersistenceError::Write {
                path: path.to_path_buf(),
                source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_through_json_value() {
        let mut doc = StateDocument::default();
        doc.state.paused = true;
        doc.state.pause_reason = Some("manual".into());
        doc.state.repositories.insert(
            "repo-a".into(),
            RepoOverride {
                paused: true,
                save_count_disabled: false,
                inactivity_seconds: Some(30),
                rule_overrides: Default::default(),
            },
        );

        let encoded = serde_json::to_value(&doc).unwrap();
        let decoded: StateDocument = serde_json::from_value(encoded.clone()).unwrap();
        let reencoded = serde_json::to_value(&decoded).unwrap();
        assert_eq!(encoded, reencoded);
    }

    #[test]
    fn rejects_missing_metadata_version() {
        let raw: Value = serde_json::json!({"state": {}, "metadata": {}});
        assert!(StateDocument::validate_raw(&raw).is_err());
    }

    #[test]
    fn rejects_non_object_top_level() {
        let raw: Value = serde_json::json!([1, 2, 3]);
        assert!(StateDocument::validate_raw(&raw).is_err());
    }

    #[test]
    fn save_then_load_round_trips_on_disk() {
        let dir = TempDir::new().unwrap();
        let mut doc = StateDocument::default();
        doc.state.paused = true;
        let path = shared_state_path(dir.path());
        doc.save(&path).unwrap();
        let loaded = StateDocument::load(&path).unwrap();
        assert_eq!(loaded.state.paused, true);
        assert_eq!(loaded.metadata.version, STATE_SCHEMA_VERSION);
    }

    #[test]
    fn local_document_carries_pid_and_overrides() {
        let mut doc = StateDocument::default();
        doc.metadata.pid = Some(1234);
        doc.state.paused_by = Some("cli".into());
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["metadata"]["pid"], 1234);
        assert_eq!(value["state"]["paused_by"], "cli");
    }
}
