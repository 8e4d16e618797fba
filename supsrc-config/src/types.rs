//! Configuration data structures.

use crate::duration::DurationLiteral;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub repositories: HashMap<String, RepositoryConfig>,
}

/// `[global]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_true")]
    pub event_buffering_enabled: bool,

    #[serde(default = "default_buffer_window_ms")]
    pub event_buffer_window_ms: u64,

    #[serde(default)]
    pub event_grouping_mode_tui: GroupingMode,

    #[serde(default)]
    pub event_grouping_mode_headless: GroupingMode,

    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold_bytes: u64,

    #[serde(default = "default_last_change_threshold_hours")]
    pub last_change_threshold_hours: f64,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            event_buffering_enabled: default_true(),
            event_buffer_window_ms: default_buffer_window_ms(),
            event_grouping_mode_tui: GroupingMode::default(),
            event_grouping_mode_headless: GroupingMode::default(),
            large_file_threshold_bytes: default_large_file_threshold(),
            last_change_threshold_hours: default_last_change_threshold_hours(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Event buffer grouping mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupingMode {
    Off,
    Simple,
    #[default]
    Smart,
}

/// `[global.circuit_breaker]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// 0 disables bulk-change detection entirely.
    #[serde(default = "default_bulk_change_threshold")]
    pub bulk_change_threshold: usize,

    #[serde(default = "default_bulk_change_window_ms")]
    pub bulk_change_window_ms: u64,

    #[serde(default = "default_true")]
    pub bulk_change_auto_pause: bool,

    #[serde(default = "default_true")]
    pub branch_change_detection_enabled: bool,

    #[serde(default = "default_true")]
    pub branch_change_warning_enabled: bool,

    #[serde(default)]
    pub branch_with_bulk_change_error: bool,

    #[serde(default = "default_branch_with_bulk_change_threshold")]
    pub branch_with_bulk_change_threshold: usize,

    /// 0 disables auto-resume.
    #[serde(default)]
    pub auto_resume_after_bulk_pause_seconds: u64,

    #[serde(default)]
    pub require_manual_acknowledgment: bool,

    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold_bytes: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            bulk_change_threshold: default_bulk_change_threshold(),
            bulk_change_window_ms: default_bulk_change_window_ms(),
            bulk_change_auto_pause: default_true(),
            branch_change_detection_enabled: default_true(),
            branch_change_warning_enabled: default_true(),
            branch_with_bulk_change_error: false,
            branch_with_bulk_change_threshold: default_branch_with_bulk_change_threshold(),
            auto_resume_after_bulk_pause_seconds: 0,
            require_manual_acknowledgment: false,
            large_file_threshold_bytes: default_large_file_threshold(),
        }
    }
}

/// `[repositories.<id>]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub path: std::path::PathBuf,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub rule: Rule,

    #[serde(default)]
    pub repository: EngineConfig,

    #[serde(default)]
    pub llm: Option<LlmConfig>,
}

/// `[repositories.<id>.rule]` — tagged rule variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Rule {
    Inactivity { period: DurationLiteral },
    SaveCount { count: u32 },
    Manual,
}

impl Default for Rule {
    fn default() -> Self {
        Rule::Manual
    }
}

/// `[repositories.<id>.repository]` — Git engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_type")]
    pub r#type: String,

    #[serde(default)]
    pub auto_push: bool,

    #[serde(default = "default_branch")]
    pub branch: String,

    #[serde(default = "default_commit_message_template")]
    pub commit_message_template: String,

    #[serde(default = "default_remote")]
    pub remote: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            r#type: default_engine_type(),
            auto_push: false,
            branch: default_branch(),
            commit_message_template: default_commit_message_template(),
            remote: default_remote(),
        }
    }
}

/// `[repositories.<id>.llm]` — optional pluggable hook settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub review_changes: bool,

    #[serde(default)]
    pub run_tests: bool,

    #[serde(default = "default_true")]
    pub generate_commit_message: bool,

    #[serde(default)]
    pub test_command: Option<String>,

    #[serde(default = "default_test_hook_timeout_seconds")]
    pub test_hook_timeout_seconds: u64,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_buffer_window_ms() -> u64 {
    100
}
fn default_large_file_threshold() -> u64 {
    1_000_000
}
fn default_last_change_threshold_hours() -> f64 {
    24.0
}
fn default_bulk_change_threshold() -> usize {
    50
}
fn default_bulk_change_window_ms() -> u64 {
    5_000
}
fn default_branch_with_bulk_change_threshold() -> usize {
    10
}
fn default_engine_type() -> String {
    "git".to_string()
}
fn default_branch() -> String {
    "main".to_string()
}
fn default_commit_message_template() -> String {
    "Autosave: {{timestamp}}\n\n{{change_summary}}".to_string()
}
fn default_remote() -> String {
    "origin".to_string()
}
fn default_test_hook_timeout_seconds() -> u64 {
    300
}
