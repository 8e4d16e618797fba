//! Circuit breaker (C5): bulk-change, branch-change, and file-warning
//! detectors sharing one latched flag per repository.
//!
//! Bulk-change tripping is decided on the deduplicated unique-file count,
//! not the raw event count, so one file saved fifty times never trips the
//! breaker on its own; both counters are still kept for observability.
//! `require_manual_acknowledgment` only changes whether a fresh event after
//! the auto-recovery window is treated as resolved — the recovery clock
//! itself always runs, and an operator can acknowledge early regardless.

use crate::state::{RepositoryState, RepositoryStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use supsrc_config::CircuitBreakerConfig;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Advisory typed signal raised when `require_manual_acknowledgment` is set
/// ("Treat the typed error as advisory notification; the recovery).
#[derive(Debug, Error, Clone)]
pub enum CircuitBreakerSignal {
    #[error(
            "repository '{repo_id}': bulk change detected - {file_count} files changed within \
            {window_ms}ms (threshold: {threshold})"
    )]
    BulkChange {
        repo_id: String,
        file_count: usize,
        threshold: usize,
        window_ms: u64,
    },

    #[error(
            "repository '{repo_id}': branch switched from '{old_branch}' to '{new_branch}' with \
            {file_count} file modifications detected"
    )]
    BranchChange {
        repo_id: String,
        old_branch: String,
        new_branch: String,
        file_count: usize,
    },
}

/// Metrics for circuit breaker operations (spec SUPPLEMENT: original's
/// `CircuitBreakerMetrics`).
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerMetrics {
    pub bulk_change_triggers: u64,
    pub branch_change_triggers: u64,
    pub combined_triggers: u64,
    pub auto_recoveries: u64,
    pub manual_acknowledgments: u64,
    pub total_events_blocked: u64,
    pub total_events_processed: u64,
    pub last_trigger_time: Option<DateTime<Utc>>,
    pub last_trigger_reason: Option<String>,
    pub last_trigger_type: Option<&'static str>,
    pub triggers_in_last_hour: u64,
    last_hour_reset: DateTime<Utc>,
}

impl CircuitBreakerMetrics {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_hour_reset: now,
            ..Default::default()
        }
    }

    fn update_hourly(&mut self, now: DateTime<Utc>) {
        if now - self.last_hour_reset > ChronoDuration::hours(1) {
            self.triggers_in_last_hour = 0;
            self.last_hour_reset = now;
        }
    }

    fn record_trigger(&mut self, kind: &'static str, reason: &str, now: DateTime<Utc>) {
        self.update_hourly(now);
        self.last_trigger_time = Some(now);
        self.last_trigger_reason = Some(reason.to_string());
        self.last_trigger_type = Some(kind);
        self.triggers_in_last_hour += 1;
        match kind {
            "bulk_change" => self.bulk_change_triggers += 1,
            "branch_change" => self.branch_change_triggers += 1,
            "combined" => self.combined_triggers += 1,
            _ => {}
        }
    }
}

/// Summary of one repository's breaker state, for `cb status`.
#[derive(Debug, Clone)]
pub struct CircuitBreakerSummary {
    pub triggered: bool,
    pub reason: Option<String>,
    pub status: RepositoryStatus,
    pub bulk_change_count: u64,
    pub unique_files_in_window: usize,
    pub current_branch: Option<String>,
    pub previous_branch: Option<String>,
    pub auto_recovery_scheduled: bool,
    pub auto_recovery_in_seconds: u64,
}

/// The safety gate shared by every repository handled by one event processor.
pub struct CircuitBreakerService {
    pub metrics: CircuitBreakerMetrics,
    auto_recovery: HashMap<String, DateTime<Utc>>,
}

impl CircuitBreakerService {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            metrics: CircuitBreakerMetrics::new(now),
            auto_recovery: HashMap::new(),
        }
    }

    /// Bulk-change detector. Returns `Ok(true)` if the breaker
    /// tripped, `Ok(false)` otherwise, and `Err` only when
    /// `require_manual_acknowledgment` is set on a new trip — the caller may
    /// surface that as an advisory notification; the state mutation and any
    /// scheduled auto-recovery have already happened regardless.
    pub fn check_and_update_bulk_change(
        &mut self,
        config: &CircuitBreakerConfig,
        state: &mut RepositoryState,
        path: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CircuitBreakerSignal> {
        if config.bulk_change_threshold == 0 {
            return Ok(false);
        }

        if state.circuit_breaker.triggered {
            self.metrics.total_events_blocked += 1;
            return Ok(true);
        }

        let window = ChronoDuration::milliseconds(config.bulk_change_window_ms as i64);
        match state.circuit_breaker.bulk_change_window_start {
            Some(start) if now - start > window => {
                debug!(repo_id = %state.repo_id, "bulk change window expired, resetting");
                state.circuit_breaker.reset_window(now);
            }
            None => state.circuit_breaker.reset_window(now),
            _ => {}
        }

        state.circuit_breaker.record_path(path);

        let unique_files = state.circuit_breaker.bulk_change_files.len();
        if unique_files >= config.bulk_change_threshold {
            if !config.bulk_change_auto_pause {
                warn!(
                    repo_id = %state.repo_id,
                    unique_files,
                    threshold = config.bulk_change_threshold,
                    "bulk change threshold exceeded but auto-pause disabled"
                );
                return Ok(false);
            }

            let reason = format!(
                "Bulk change detected: {unique_files} files changed within {}ms window (threshold: {})",
                config.bulk_change_window_ms, config.bulk_change_threshold
            );
            state.circuit_breaker.triggered = true;
            state.circuit_breaker.reason = Some(reason.clone());
            state.status = RepositoryStatus::BulkChangePaused;
            self.metrics.record_trigger("bulk_change", &reason, now);

            if config.auto_resume_after_bulk_pause_seconds > 0 {
                let recovery_at =
                now + ChronoDuration::seconds(config.auto_resume_after_bulk_pause_seconds as i64);
                self.auto_recovery.insert(state.repo_id.clone(), recovery_at);
                state.circuit_breaker.auto_recovery_at = Some(recovery_at);
                info!(repo_id = %state.repo_id, %recovery_at, "auto-recovery scheduled");
            }

            warn!(
                repo_id = %state.repo_id,
                unique_files,
                threshold = config.bulk_change_threshold,
                "CIRCUIT BREAKER TRIGGERED: bulk file changes detected"
            );

            if config.require_manual_acknowledgment {
                return Err(CircuitBreakerSignal::BulkChange {
                        repo_id: state.repo_id.clone(),
                        file_count: unique_files,
                        threshold: config.bulk_change_threshold,
                        window_ms: config.bulk_change_window_ms,
                });
            }
            return Ok(true);
        }

        self.metrics.total_events_processed += 1;
        Ok(false)
    }

    /// Branch-change detector. Returns `(branch_changed, triggered)`.
    pub fn check_branch_change(
        &mut self,
        config: &CircuitBreakerConfig,
        state: &mut RepositoryState,
        current_branch: &str,
        now: DateTime<Utc>,
    ) -> Result<(bool, bool), CircuitBreakerSignal> {
        if !config.branch_change_detection_enabled {
            state.branch.previous_branch = state.branch.current_branch.clone();
            state.branch.current_branch = Some(current_branch.to_string());
            return Ok((false, false));
        }

        if state.circuit_breaker.triggered {
            return Ok((false, true));
        }

        // First observation seeds previous_branch and does not trigger.
        let Some(previous) = state.branch.current_branch.clone() else {
            state.branch.current_branch = Some(current_branch.to_string());
            return Ok((false, false));
        };

        if previous == current_branch {
            return Ok((false, false));
        }

        state.branch.previous_branch = Some(previous.clone());
        state.branch.current_branch = Some(current_branch.to_string());

        let unique_files = state.circuit_breaker.bulk_change_files.len();

        if config.branch_with_bulk_change_error && unique_files >= config.branch_with_bulk_change_threshold
        {
            let reason = format!(
                "Branch change with bulk file modifications: '{previous}' -> '{current_branch}' with \
                {unique_files} files changed (threshold: {})",
                config.branch_with_bulk_change_threshold
            );
            state.circuit_breaker.triggered = true;
            state.circuit_breaker.reason = Some(reason.clone());
            state.status = RepositoryStatus::BranchChangeError;
            self.metrics.record_trigger("combined", &reason, now);

            if config.require_manual_acknowledgment {
                return Err(CircuitBreakerSignal::BranchChange {
                        repo_id: state.repo_id.clone(),
                        old_branch: previous,
                        new_branch: current_branch.to_string(),
                        file_count: unique_files,
                });
            }
            return Ok((true, true));
        }

        if config.branch_change_warning_enabled {
            let reason = format!("Branch changed: '{previous}' -> '{current_branch}'");
            state.circuit_breaker.triggered = true;
            state.circuit_breaker.reason = Some(reason.clone());
            state.status = RepositoryStatus::BranchChangeWarning;
            self.metrics.record_trigger("branch_change", &reason, now);
            return Ok((true, true));
        }

        Ok((true, false))
    }

    /// Conflict/divergence trigger for the push preflight : unlike the bulk-change and branch-change detectors this isn't
    /// tied to a threshold, it fires unconditionally on whatever
    /// `check_upstream_conflicts` reported. Sets `CONFLICT_DETECTED` so the
    /// existing `blocks_new_workflow`/`should_process_event` gates apply
    /// uniformly, and the repo requires the same explicit acknowledgment
    /// as any other breaker trip.
    pub fn trigger_conflict(&mut self, state: &mut RepositoryState, reason: impl Into<String>, now: DateTime<Utc>) {
        let reason = reason.into();
        state.circuit_breaker.triggered = true;
        state.circuit_breaker.reason = Some(reason.clone());
        state.status = RepositoryStatus::ConflictDetected;
        self.metrics.record_trigger("combined", &reason, now);
        warn!(repo_id = %state.repo_id, %reason, "CIRCUIT BREAKER TRIGGERED: push preflight conflict");
    }

    /// File-warning detector, invoked before staging.
    pub fn apply_file_warnings(
        &mut self,
        state: &mut RepositoryState,
        warnings: Vec<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if warnings.is_empty() {
            return false;
        }
        let reason = format!("Files flagged before staging: {}", warnings.join("; "));
        state.circuit_breaker.file_warnings = warnings;
        state.circuit_breaker.triggered = true;
        state.circuit_breaker.reason = Some(reason.clone());
        state.status = RepositoryStatus::BulkChangePaused;
        self.metrics.record_trigger("bulk_change", &reason, now);
        true
    }

    /// Checked first on every `should_process_event` call: clears an
    /// expired auto-recovery deadline before the gating check runs.
    pub fn check_auto_recovery(&mut self, state: &mut RepositoryState, now: DateTime<Utc>) -> bool {
        let Some(recovery_at) = self.auto_recovery.get(&state.repo_id).copied() else {
            return false;
        };
        if now >= recovery_at {
            info!(repo_id = %state.repo_id, "auto-recovery triggered");
            self.acknowledge_circuit_breaker(state, true, now);
            return true;
        }
        false
    }

    /// Gating contract : `should_process_event`.
    pub fn should_process_event(&mut self, state: &mut RepositoryState, now: DateTime<Utc>) -> bool {
        self.check_auto_recovery(state, now);

        if !state.circuit_breaker.triggered {
            return true;
        }

        if matches!(
            state.status,
            RepositoryStatus::BulkChangePaused
            | RepositoryStatus::BranchChangeError
            | RepositoryStatus::ConflictDetected
        ) {
            self.metrics.total_events_blocked += 1;
            state.stats.total_events_blocked += 1;
            return false;
        }

        // BRANCH_CHANGE_WARNING: non-blocking, the warning persists.
        self.metrics.total_events_processed += 1;
        true
    }

    /// Acknowledge and reset a triggered circuit breaker.
    pub fn acknowledge_circuit_breaker(
        &mut self,
        state: &mut RepositoryState,
        auto_recovery: bool,
        now: DateTime<Utc>,
    ) {
        if !state.circuit_breaker.triggered {
            return;
        }

        if auto_recovery {
            self.metrics.auto_recoveries += 1;
        } else {
            self.metrics.manual_acknowledgments += 1;
        }
        let _ = now;

        state.acknowledge_circuit_breaker();
        self.auto_recovery.remove(&state.repo_id);
    }

    pub fn summary(&self, state: &RepositoryState, now: DateTime<Utc>) -> CircuitBreakerSummary {
        let (scheduled, remaining) = match self.auto_recovery.get(&state.repo_id) {
            Some(at) => (true, (*at - now).num_seconds().max(0) as u64),
            None => (false, 0),
        };
        CircuitBreakerSummary {
            triggered: state.circuit_breaker.triggered,
            reason: state.circuit_breaker.reason.clone(),
            status: state.status,
            bulk_change_count: state.circuit_breaker.bulk_change_count,
            unique_files_in_window: state.circuit_breaker.bulk_change_files.len(),
            current_branch: state.branch.current_branch.clone(),
            previous_branch: state.branch.previous_branch.clone(),
            auto_recovery_scheduled: scheduled,
            auto_recovery_in_seconds: remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: usize, window_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            bulk_change_threshold: threshold,
            bulk_change_window_ms: window_ms,
            bulk_change_auto_pause: true,
            branch_change_detection_enabled: true,
            branch_change_warning_enabled: true,
            branch_with_bulk_change_error: true,
            branch_with_bulk_change_threshold: 5,
            auto_resume_after_bulk_pause_seconds: 0,
            require_manual_acknowledgment: false,
            large_file_threshold_bytes: 1_000_000,
        }
    }

    #[test]
    fn threshold_zero_disables_detection() {
        let cfg = config(0, 5_000);
        let mut svc = CircuitBreakerService::new(Utc::now());
        let mut state = RepositoryState::new("r1".into());
        let now = Utc::now();
        for i in 0..100 {
            let triggered = svc
            .check_and_update_bulk_change(&cfg, &mut state, &format!("f{i}.txt"), now)
            .unwrap();
            assert!(!triggered);
        }
        assert!(!state.circuit_breaker.triggered);
    }

    #[test]
    fn trips_at_threshold_and_dedupes_files() {
        let cfg = config(3, 5_000);
        let mut svc = CircuitBreakerService::new(Utc::now());
        let mut state = RepositoryState::new("r1".into());
        let now = Utc::now();

        assert!(!svc.check_and_update_bulk_change(&cfg, &mut state, "a.txt", now).unwrap());
        assert!(!svc.check_and_update_bulk_change(&cfg, &mut state, "a.txt", now).unwrap());
        assert!(!svc.check_and_update_bulk_change(&cfg, &mut state, "b.txt", now).unwrap());
        assert!(svc.check_and_update_bulk_change(&cfg, &mut state, "c.txt", now).unwrap());

        assert!(state.circuit_breaker.triggered);
        assert_eq!(state.status, RepositoryStatus::BulkChangePaused);
        // raw count is 4 events, unique files is 3.
        assert_eq!(state.circuit_breaker.bulk_change_count, 4);
        assert_eq!(state.circuit_breaker.bulk_change_files.len(), 3);
    }

    #[test]
    fn window_expiry_resets_atomically() {
        let cfg = config(2, 100);
        let mut svc = CircuitBreakerService::new(Utc::now());
        let mut state = RepositoryState::new("r1".into());
        let t0 = Utc::now();
        svc.check_and_update_bulk_change(&cfg, &mut state, "a.txt", t0).unwrap();
        assert_eq!(state.circuit_breaker.bulk_change_files.len(), 1);

        let t1 = t0 + ChronoDuration::milliseconds(500);
        svc.check_and_update_bulk_change(&cfg, &mut state, "b.txt", t1).unwrap();
        // window expired, so only b.txt counted, not tripped yet.
        assert_eq!(state.circuit_breaker.bulk_change_files, vec!["b.txt"]);
        assert!(!state.circuit_breaker.triggered);
    }

    #[test]
    fn first_branch_observation_seeds_without_triggering() {
        let cfg = config(50, 5_000);
        let mut svc = CircuitBreakerService::new(Utc::now());
        let mut state = RepositoryState::new("r1".into());
        let now = Utc::now();
        let (changed, triggered) = svc.check_branch_change(&cfg, &mut state, "main", now).unwrap();
        assert!(!changed);
        assert!(!triggered);
        assert_eq!(state.branch.current_branch.as_deref(), Some("main"));
        assert_eq!(state.branch.previous_branch, None);
    }

    #[test]
    fn branch_change_with_bulk_triggers_error() {
        let cfg = config(50, 5_000);
        let mut svc = CircuitBreakerService::new(Utc::now());
        let mut state = RepositoryState::new("r1".into());
        let now = Utc::now();

        svc.check_branch_change(&cfg, &mut state, "main", now).unwrap();
        for i in 0..6 {
            svc.check_and_update_bulk_change(&cfg, &mut state, &format!("f{i}.txt"), now)
            .unwrap();
        }
        let (changed, triggered) = svc.check_branch_change(&cfg, &mut state, "feature", now).unwrap();
        assert!(changed);
        assert!(triggered);
        assert_eq!(state.status, RepositoryStatus::BranchChangeError);
    }

    #[test]
    fn acknowledge_is_idempotent_and_clears_files() {
        let cfg = config(1, 5_000);
        let mut svc = CircuitBreakerService::new(Utc::now());
        let mut state = RepositoryState::new("r1".into());
        let now = Utc::now();
        svc.check_and_update_bulk_change(&cfg, &mut state, "a.txt", now).unwrap();
        assert!(state.circuit_breaker.triggered);

        svc.acknowledge_circuit_breaker(&mut state, false, now);
        assert!(!state.circuit_breaker.triggered);
        assert!(state.circuit_breaker.bulk_change_files.is_empty());
        assert_eq!(state.status, RepositoryStatus::Idle);

        svc.acknowledge_circuit_breaker(&mut state, false, now);
        assert_eq!(svc.metrics.manual_acknowledgments, 1);
    }

    #[test]
    fn require_manual_acknowledgment_still_schedules_auto_recovery() {
        let mut cfg = config(1, 5_000);
        cfg.require_manual_acknowledgment = true;
        cfg.auto_resume_after_bulk_pause_seconds = 30;
        let mut svc = CircuitBreakerService::new(Utc::now());
        let mut state = RepositoryState::new("r1".into());
        let now = Utc::now();

        let result = svc.check_and_update_bulk_change(&cfg, &mut state, "a.txt", now);
        assert!(result.is_err());
        assert!(state.circuit_breaker.triggered);
        assert!(svc.auto_recovery.contains_key("r1"));
    }

    #[test]
    fn trigger_conflict_sets_status_and_requires_acknowledgment() {
        let cfg = config(50, 5_000);
        let mut svc = CircuitBreakerService::new(Utc::now());
        let mut state = RepositoryState::new("r1".into());
        let now = Utc::now();

        svc.trigger_conflict(&mut state, "diverged: 2 ahead, 3 behind", now);
        assert!(state.circuit_breaker.triggered);
        assert_eq!(state.status, RepositoryStatus::ConflictDetected);
        assert!(!svc.should_process_event(&mut state, now));

        svc.acknowledge_circuit_breaker(&mut state, false, now);
        assert_eq!(state.status, RepositoryStatus::Idle);
    }

    #[test]
    fn should_process_event_blocks_on_bulk_pause_but_allows_warning() {
        let cfg = config(1, 5_000);
        let mut svc = CircuitBreakerService::new(Utc::now());
        let mut state = RepositoryState::new("r1".into());
        let now = Utc::now();
        svc.check_and_update_bulk_change(&cfg, &mut state, "a.txt", now).unwrap();
        assert!(!svc.should_process_event(&mut state, now));

        svc.acknowledge_circuit_breaker(&mut state, false, now);
        state.circuit_breaker.triggered = true;
        state.status = RepositoryStatus::BranchChangeWarning;
        assert!(svc.should_process_event(&mut state, now));
    }
}
