//! Per-repository state and state machine.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Instant;

/// Opaque, process-unique repository identifier.
pub type RepoId = String;

/// The twelve exhaustive repository states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryStatus {
    Idle,
    Changed,
    Processing,
    Staging,
    GeneratingCommit,
    Committing,
    Pushing,
    Error,
    ConflictDetected,
    ExternalCommitDetected,
    BulkChangePaused,
    BranchChangeWarning,
    BranchChangeError,
}

impl RepositoryStatus {
    /// Derived display string. Never persisted.
    pub fn display(&self) -> &'static str {
        match self {
            RepositoryStatus::Idle => "idle",
            RepositoryStatus::Changed => "changed",
            RepositoryStatus::Processing => "processing",
            RepositoryStatus::Staging => "staging",
            RepositoryStatus::GeneratingCommit => "generating commit message",
            RepositoryStatus::Committing => "committing",
            RepositoryStatus::Pushing => "pushing",
            RepositoryStatus::Error => "error",
            RepositoryStatus::ConflictDetected => "conflict detected",
            RepositoryStatus::ExternalCommitDetected => "external commit detected",
            RepositoryStatus::BulkChangePaused => "bulk change paused",
            RepositoryStatus::BranchChangeWarning => "branch change warning",
            RepositoryStatus::BranchChangeError => "branch change error",
        }
    }

    /// Derived status emoji, purely cosmetic ("never persisted as state").
    pub fn emoji(&self) -> &'static str {
        match self {
            RepositoryStatus::Idle => "\u{1F7E2}",
            RepositoryStatus::Changed => "\u{1F7E1}",
            RepositoryStatus::Processing
            | RepositoryStatus::Staging
            | RepositoryStatus::GeneratingCommit
            | RepositoryStatus::Committing
            | RepositoryStatus::Pushing => "\u{1F504}",
            RepositoryStatus::Error => "\u{1F534}",
            RepositoryStatus::ConflictDetected => "\u{26D4}",
            RepositoryStatus::ExternalCommitDetected => "\u{2139}\u{FE0F}",
            RepositoryStatus::BulkChangePaused
            | RepositoryStatus::BranchChangeWarning
            | RepositoryStatus::BranchChangeError => "\u{23F8}\u{FE0F}",
        }
    }

    /// Whether this status blocks new action workflows from starting (I3).
    pub fn blocks_workflow(&self) -> bool {
        matches!(
            self,
            RepositoryStatus::BulkChangePaused
            | RepositoryStatus::BranchChangeError
            | RepositoryStatus::ConflictDetected
        )
    }
}

/// A cancellable timer handle, opaque to everything but the owner that
/// scheduled it ("store them as opaque handles owned by the state").
#[derive(Debug)]
pub struct TimerHandle {
    pub(crate) cancel: tokio::sync::watch::Sender<bool>,
}

impl TimerHandle {
    pub fn new() -> (Self, tokio::sync::watch::Receiver<bool>) {
        let (tx, rx) = tokio::sync::watch::channel(false);
        (Self { cancel: tx }, rx)
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Per-file change counters, reset by a successful commit cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCounters {
    pub total_files: u32,
    pub changed_files: u32,
    pub added_files: u32,
    pub deleted_files: u32,
    pub modified_files: u32,
}

/// Branch tracking fields.
#[derive(Debug, Clone, Default)]
pub struct BranchTracking {
    pub current_branch: Option<String>,
    pub previous_branch: Option<String>,
    pub upstream_branch: Option<String>,
    pub commits_ahead: u32,
    pub commits_behind: u32,
    pub has_upstream: bool,
}

/// Last-commit summary fields.
#[derive(Debug, Clone, Default)]
pub struct LastCommit {
    pub short_hash: Option<String>,
    pub message_summary: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Circuit-breaker fields owned by the repository state.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerFields {
    pub triggered: bool,
    pub reason: Option<String>,
    pub bulk_change_window_start: Option<DateTime<Utc>>,
    /// Raw event count, incremented on every event including duplicates.
    pub bulk_change_count: u64,
    /// Order-preserving, duplicate-free set of changed paths in the current window (I5).
    pub bulk_change_files: Vec<String>,
    bulk_change_files_set: HashSet<String>,
    pub file_warnings: Vec<String>,
    pub auto_recovery_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerFields {
    pub fn record_path(&mut self, path: &str) {
        self.bulk_change_count += 1;
        if self.bulk_change_files_set.insert(path.to_string()) {
            self.bulk_change_files.push(path.to_string());
        }
    }

    pub fn reset_window(&mut self, now: DateTime<Utc>) {
        self.bulk_change_window_start = Some(now);
        self.bulk_change_count = 0;
        self.bulk_change_files.clear();
        self.bulk_change_files_set.clear();
    }

    pub fn clear(&mut self) {
        self.triggered = false;
        self.reason = None;
        self.bulk_change_window_start = None;
        self.bulk_change_count = 0;
        self.bulk_change_files.clear();
        self.bulk_change_files_set.clear();
        self.file_warnings.clear();
        self.auto_recovery_at = None;
    }
}

/// Session-level statistics, for observability only.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub started_at: DateTime<Utc>,
    pub commits: u64,
    pub pushes: u64,
    pub files_committed: u64,
    pub events_processed: u64,
    pub total_events_blocked: u64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            commits: 0,
            pushes: 0,
            files_committed: 0,
            events_processed: 0,
            total_events_blocked: 0,
        }
    }
}

/// The full mutable record for one repository, owned exclusively by the
/// event processor.
pub struct RepositoryState {
    pub repo_id: RepoId,
    pub status: RepositoryStatus,

    pub save_count: u32,
    pub counters: ChangeCounters,
    pub has_uncommitted_changes: bool,

    pub last_committed: ChangeCounters,

    pub last_commit: LastCommit,
    pub branch: BranchTracking,

    pub inactivity_timer: Option<TimerHandle>,
    pub timer_total_seconds: Option<u64>,
    pub timer_start_time: Option<Instant>,

    pub is_paused: bool,
    pub is_stopped: bool,
    pub is_frozen: bool,
    pub freeze_reason: Option<String>,
    pub is_refreshing: bool,

    pub circuit_breaker: CircuitBreakerFields,

    pub stats: SessionStats,

    /// Whether an action workflow is currently running for this repo (I2).
    pub workflow_in_flight: bool,

    external_commit_reset_at: Option<DateTime<Utc>>,
}

impl RepositoryState {
    pub fn new(repo_id: RepoId) -> Self {
        Self {
            repo_id,
            status: RepositoryStatus::Idle,
            save_count: 0,
            counters: ChangeCounters::default(),
            has_uncommitted_changes: false,
            last_committed: ChangeCounters::default(),
            last_commit: LastCommit::default(),
            branch: BranchTracking::default(),
            inactivity_timer: None,
            timer_total_seconds: None,
            timer_start_time: None,
            is_paused: false,
            is_stopped: false,
            is_frozen: false,
            freeze_reason: None,
            is_refreshing: false,
            circuit_breaker: CircuitBreakerFields::default(),
            stats: SessionStats::default(),
            workflow_in_flight: false,
            external_commit_reset_at: None,
        }
    }

    /// Cancel and drop any scheduled inactivity timer. Called on every
    /// subsequent event, action start, pause, or shutdown.
    pub fn cancel_inactivity_timer(&mut self) {
        if let Some(handle) = self.inactivity_timer.take() {
            handle.cancel();
        }
        self.timer_total_seconds = None;
        self.timer_start_time = None;
    }

    /// Seconds remaining on the inactivity timer, for status queries.
    pub fn timer_remaining_seconds(&self) -> Option<u64> {
        let total = self.timer_total_seconds?;
        let start = self.timer_start_time?;
        let elapsed = start.elapsed().as_secs();
        Some(total.saturating_sub(elapsed))
    }

    /// IDLE/CHANGED -> CHANGED: record a buffered event.
    pub fn record_event(&mut self) {
        self.save_count += 1;
        self.has_uncommitted_changes = true;
        if matches!(self.status, RepositoryStatus::Idle | RepositoryStatus::Changed) {
            self.status = RepositoryStatus::Changed;
        }
    }

    /// Refresh the per-file counters from one buffered event's change type
    /// ("refresh per-file counters"). This is a cheap
    /// approximation updated on every event; `execute_action_sequence`'s
    /// status step replaces it with the authoritative `git status` count
    /// before staging.
    pub fn apply_buffered_change(&mut self, change_type: crate::buffer::ChangeType) {
        use crate::buffer::ChangeType;
        self.counters.changed_files += 1;
        self.counters.total_files += 1;
        match change_type {
            ChangeType::Created => self.counters.added_files += 1,
            ChangeType::Deleted => self.counters.deleted_files += 1,
            ChangeType::Modified => self.counters.modified_files += 1,
        }
    }

    /// Reset per-cycle counters to zero, preserving them into
    /// `last_committed_*` for display (spec invariant P4).
    pub fn finalize_successful_cycle(&mut self) {
        self.last_committed = self.counters;
        self.counters = ChangeCounters::default();
        self.save_count = 0;
        self.has_uncommitted_changes = false;
    }

    pub fn set_status(&mut self, status: RepositoryStatus) {
        self.status = status;
    }

    pub fn enter_conflict(&mut self, reason: impl Into<String>) {
        self.status = RepositoryStatus::ConflictDetected;
        self.is_frozen = true;
        self.freeze_reason = Some(reason.into());
    }

    pub fn enter_external_commit_detected(&mut self, now: DateTime<Utc>, delay: chrono::Duration) {
        self.status = RepositoryStatus::ExternalCommitDetected;
        self.external_commit_reset_at = Some(now + delay);
    }

    /// Whether the delayed auto-reset from EXTERNAL_COMMIT_DETECTED back to
    /// IDLE is due.
    pub fn external_commit_reset_due(&self, now: DateTime<Utc>) -> bool {
        matches!(
            (self.status, self.external_commit_reset_at),
            (RepositoryStatus::ExternalCommitDetected, Some(at)) if now >= at
        )
    }

    pub fn clear_external_commit_reset(&mut self) {
        self.external_commit_reset_at = None;
        self.status = RepositoryStatus::Idle;
    }

    /// I3/I4 guard used by the action workflow's step 1.
    pub fn blocks_new_workflow(&self) -> bool {
        self.is_frozen
        || self.is_stopped
        || self.circuit_breaker.triggered
        || self.workflow_in_flight
        || !matches!(
            self.status,
            RepositoryStatus::Idle | RepositoryStatus::Changed
        )
    }

    /// Acknowledge a circuit breaker: clears all breaker fields and returns
    /// to IDLE.
    pub fn acknowledge_circuit_breaker(&mut self) {
        if !self.circuit_breaker.triggered {
            return;
        }
        self.circuit_breaker.clear();
        self.status = RepositoryStatus::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_event_transitions_idle_to_changed() {
        let mut state = RepositoryState::new("r1".into());
        assert_eq!(state.status, RepositoryStatus::Idle);
        state.record_event();
        assert_eq!(state.status, RepositoryStatus::Changed);
        assert_eq!(state.save_count, 1);
        state.record_event();
        assert_eq!(state.status, RepositoryStatus::Changed);
        assert_eq!(state.save_count, 2);
    }

    #[test]
    fn finalize_cycle_zeroes_counters_and_preserves_last_committed() {
        let mut state = RepositoryState::new("r1".into());
        state.counters.added_files = 3;
        state.counters.modified_files = 2;
        state.save_count = 5;
        state.finalize_successful_cycle();
        assert_eq!(state.counters, ChangeCounters::default());
        assert_eq!(state.save_count, 0);
        assert_eq!(state.last_committed.added_files, 3);
        assert_eq!(state.last_committed.modified_files, 2);
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let mut state = RepositoryState::new("r1".into());
        state.circuit_breaker.triggered = true;
        state.circuit_breaker.reason = Some("bulk change".into());
        state.status = RepositoryStatus::BulkChangePaused;

        state.acknowledge_circuit_breaker();
        assert!(!state.circuit_breaker.triggered);
        assert_eq!(state.status, RepositoryStatus::Idle);

        // Second call is a no-op, not an error (P7).
        state.acknowledge_circuit_breaker();
        assert_eq!(state.status, RepositoryStatus::Idle);
    }

    #[test]
    fn apply_buffered_change_updates_counters_by_kind() {
        use crate::buffer::ChangeType;
        let mut state = RepositoryState::new("r1".into());
        state.apply_buffered_change(ChangeType::Created);
        state.apply_buffered_change(ChangeType::Modified);
        state.apply_buffered_change(ChangeType::Deleted);
        assert_eq!(state.counters.added_files, 1);
        assert_eq!(state.counters.modified_files, 1);
        assert_eq!(state.counters.deleted_files, 1);
        assert_eq!(state.counters.changed_files, 3);
    }

    #[test]
    fn bulk_change_files_stays_duplicate_free() {
        let mut fields = CircuitBreakerFields::default();
        fields.record_path("a.txt");
        fields.record_path("a.txt");
        fields.record_path("b.txt");
        assert_eq!(fields.bulk_change_files, vec!["a.txt", "b.txt"]);
        assert_eq!(fields.bulk_change_count, 3);
    }

    #[test]
    fn blocks_new_workflow_when_circuit_breaker_triggered() {
        let mut state = RepositoryState::new("r1".into());
        state.status = RepositoryStatus::Changed;
        assert!(!state.blocks_new_workflow());
        state.circuit_breaker.triggered = true;
        assert!(state.blocks_new_workflow());
    }
}
