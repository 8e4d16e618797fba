//! Action workflow (C7): the single, strictly ordered entry point that
//! turns accumulated changes into a commit and optional push.
//!
//! Guard, status, file-warning preflight, stage, optional review hook,
//! commit, push preflight, push, finalize — nine steps run in that fixed
//! order every time, each wrapped in its own `spawn_blocking` + timeout so
//! one slow remote never stalls another repository's cycle.

use crate::circuit_breaker::CircuitBreakerService;
use crate::error::{GitError, WorkflowError};
use crate::events::EventBroadcaster;
use crate::git::GitEngine;
use crate::hooks::{LlmHooks, Notification, NotificationSink, ReviewOutcome, Urgency};
use crate::state::{RepositoryState, RepositoryStatus};
use chrono::Utc;
use git2::Repository;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use supsrc_config::{CircuitBreakerConfig, EngineConfig, LlmConfig};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// `CircuitBreakerService` is shared across every repository handled by one
/// event processor (see its own doc comment); the workflow only ever holds
/// this lock for the duration of a single synchronous detector call, never
/// across an `.await`, so one repo's multi-second commit/push cycle doesn't
/// stall another repo's bulk-change accounting.
pub type SharedBreaker = Arc<Mutex<CircuitBreakerService>>;

/// Per-operation timeouts.
const STATUS_TIMEOUT: Duration = Duration::from_secs(30);
const STAGE_TIMEOUT: Duration = Duration::from_secs(60);
const COMMIT_TIMEOUT: Duration = Duration::from_secs(30);
const PUSH_TIMEOUT: Duration = Duration::from_secs(120);
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(15);

/// Delay before `EXTERNAL_COMMIT_DETECTED` auto-resets to IDLE.
pub const EXTERNAL_COMMIT_RESET_DELAY_SECS: i64 = 2;

/// The terminal outcome of one `execute_action_sequence` call, for the
/// event processor's logging/notification decisions.
#[derive(Debug)]
pub enum ActionOutcome {
    /// Guard at step 1 refused to start (frozen, blocked, already running).
    Guarded,
    /// Status probe failed outright.
    Error(String),
    /// Merge/rebase/cherry-pick/revert conflict detected at the status step.
    ConflictDetected,
    /// File-warning preflight tripped the breaker before staging.
    CircuitBreakerTripped,
    /// `get_status` reported a clean tree: someone committed outside us.
    ExternalCommitDetected,
    /// Index had no diff against HEAD; cycle was a no-op.
    NoOp,
    /// Commit written; `pushed` reflects whether the push preflight+push
    /// both ran and succeeded (false covers skip, divergence-block, and
    /// push failure alike — none of those fail the cycle itself).
    Committed { short_hash: String, pushed: bool },
    /// Commit written, but the push preflight found divergence/conflicts
    /// and the breaker was tripped to block further auto-cycles.
    CommittedPushBlocked { short_hash: String, reason: String },
}

/// Everything the workflow needs for one cycle, borrowed from the
/// processor's per-repo runtime and the orchestrator's config snapshot.
pub struct ActionWorkflow {
    pub notifications: Arc<dyn NotificationSink>,
    pub hooks: Option<Arc<dyn LlmHooks>>,
}

impl ActionWorkflow {
    pub fn new(notifications: Arc<dyn NotificationSink>, hooks: Option<Arc<dyn LlmHooks>>) -> Self {
        Self { notifications, hooks }
    }

    /// Run one action cycle for `state`: guard, status, file-warning
    /// preflight, stage, optional review hook, commit, push preflight,
    /// push, finalize — in that fixed order, every time.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_action_sequence(
        &self,
        state: &mut RepositoryState,
        breaker: &SharedBreaker,
        events: &EventBroadcaster,
        working_dir: PathBuf,
        engine: &EngineConfig,
        cb_config: &CircuitBreakerConfig,
        llm: Option<&LlmConfig>,
    ) -> ActionOutcome {
        // Step 1: guard.
        if state.blocks_new_workflow() {
            return ActionOutcome::Guarded;
        }
        state.workflow_in_flight = true;
        state.cancel_inactivity_timer();
        let outcome = self
        .run_steps(state, breaker, events, working_dir, engine, cb_config, llm)
        .await;
        state.workflow_in_flight = false;
        outcome
    }

    /// Lightweight status refresh for use outside a full action cycle:
    /// startup (§4.9 "refresh initial status/summary") and any other point
    /// status is refreshed per §4.5 ("the branch detector is called with
    /// the current branch name whenever status is refreshed"). Reads only
    /// the current branch and feeds it through the branch-change detector,
    /// so `previous_branch` is seeded on the first call and a branch
    /// switched between two refreshes (with no action cycle in between)
    /// still trips the breaker. Never touches the working tree.
    pub async fn refresh_status(
        &self,
        state: &mut RepositoryState,
        breaker: &SharedBreaker,
        events: &EventBroadcaster,
        working_dir: PathBuf,
        cb_config: &CircuitBreakerConfig,
    ) {
        if state.workflow_in_flight {
            return;
        }
        let Ok(branch) = run_git(working_dir, STATUS_TIMEOUT, |repo| GitEngine::current_branch(repo)).await else {
            return;
        };
        let now = Utc::now();
        let branch_result = breaker.lock().await.check_branch_change(cb_config, state, &branch, now);
        let triggered = match &branch_result {
            Ok((_changed, triggered)) => *triggered,
            Err(signal) => {
                warn!(repo_id = %state.repo_id, %signal, "circuit breaker tripped (branch change) during status refresh");
                self.notify_conflict(&signal.to_string()).await;
                true
            }
        };
        if triggered {
            events.emit_circuit_breaker_triggered(
                state.repo_id.clone(),
                state.circuit_breaker.reason.clone().unwrap_or_default(),
            );
        }
    }

    async fn run_steps(
        &self,
        state: &mut RepositoryState,
        breaker: &SharedBreaker,
        events: &EventBroadcaster,
        working_dir: PathBuf,
        engine: &EngineConfig,
        cb_config: &CircuitBreakerConfig,
        llm: Option<&LlmConfig>,
    ) -> ActionOutcome {
        let now = Utc::now();

        // Step 2: status.
        state.set_status(RepositoryStatus::Processing);
        events.emit_status_changed(state.repo_id.clone(), RepositoryStatus::Processing.display());

        let path = working_dir.clone();
        let status = match run_git(path, STATUS_TIMEOUT, |repo| {
                let (counters, has_changes) = GitEngine::get_status(repo)?;
                let branch = GitEngine::current_branch(repo).ok();
                let conflicted = GitEngine::is_index_conflicted(repo)?;
                let in_progress = GitEngine::in_progress_operation(repo);
                Ok((counters, has_changes, branch, conflicted, in_progress))
        })
        .await
        {
            Ok(v) => v,
            Err(err) => {
                state.set_status(RepositoryStatus::Error);
                events.emit_error(state.repo_id.clone(), err.to_string());
                return ActionOutcome::Error(err.to_string());
            }
        };
        let (counters, has_changes, branch, conflicted, in_progress) = status;
        state.counters = counters;

        if conflicted || in_progress == Some("merge") {
            let reason = in_progress
            .map(|op| format!("{op} conflict detected"))
            .unwrap_or_else(|| "Merge conflicts detected".to_string());
            state.enter_conflict(reason.clone());
            events.emit_error(state.repo_id.clone(), reason.clone());
            self.notify_conflict(&reason).await;
            return ActionOutcome::ConflictDetected;
        }

        if let Some(branch) = &branch {
            let branch_result = breaker.lock().await.check_branch_change(cb_config, state, branch, now);
            let triggered = match &branch_result {
                Ok((_changed, triggered)) => *triggered,
                Err(signal) => {
                    warn!(repo_id = %state.repo_id, %signal, "circuit breaker tripped (branch change)");
                    self.notify_conflict(&signal.to_string()).await;
                    true
                }
            };
            if triggered {
                events.emit_circuit_breaker_triggered(
                    state.repo_id.clone(),
                    state.circuit_breaker.reason.clone().unwrap_or_default(),
                );
                return ActionOutcome::CircuitBreakerTripped;
            }
        }

        if !has_changes {
            state.enter_external_commit_detected(now, chrono::Duration::seconds(EXTERNAL_COMMIT_RESET_DELAY_SECS));
            events.emit_status_changed(state.repo_id.clone(), RepositoryStatus::ExternalCommitDetected.display());
            return ActionOutcome::ExternalCommitDetected;
        }

        // Step 3: file-warning preflight.
        let path = working_dir.clone();
        let threshold = cb_config.large_file_threshold_bytes;
        let warnings = match run_git(path, STATUS_TIMEOUT, move |repo| {
                GitEngine::analyze_files_for_warnings(repo, repo.workdir().unwrap_or(Path::new(".")), threshold)
        })
        .await
        {
            Ok(w) => w,
            Err(err) => {
                state.set_status(RepositoryStatus::Error);
                return ActionOutcome::Error(err.to_string());
            }
        };
        if !warnings.is_empty() {
            breaker.lock().await.apply_file_warnings(state, warnings, now);
            events.emit_circuit_breaker_triggered(
                state.repo_id.clone(),
                state.circuit_breaker.reason.clone().unwrap_or_default(),
            );
            return ActionOutcome::CircuitBreakerTripped;
        }

        // Step 4: stage.
        state.set_status(RepositoryStatus::Staging);
        events.emit_status_changed(state.repo_id.clone(), RepositoryStatus::Staging.display());
        let path = working_dir.clone();
        if let Err(err) = run_git(path, STAGE_TIMEOUT, |repo| GitEngine::stage_all(repo)).await {
            state.set_status(RepositoryStatus::Error);
            events.emit_error(state.repo_id.clone(), err.to_string());
            return ActionOutcome::Error(err.to_string());
        }

        // Step 5: optional LLM hook.
        let mut template = engine.commit_message_template.clone();
        if let (Some(llm_cfg), Some(hooks)) = (llm, self.hooks.as_ref()) {
            if llm_cfg.enabled {
                if llm_cfg.review_changes {
                    let path = working_dir.clone();
                    let diff = run_git(path, STATUS_TIMEOUT, |repo| GitEngine::get_working_diff(repo, 2_000))
                    .await
                    .unwrap_or_default();
                    match hooks.review_changes(&diff).await {
                        ReviewOutcome::Approved => {}
                        ReviewOutcome::Vetoed { reason } => {
                            state.set_status(RepositoryStatus::Error);
                            events.emit_error(state.repo_id.clone(), format!("review vetoed: {reason}"));
                            return ActionOutcome::Error(
                                WorkflowError::ReviewVetoed(reason).to_string(),
                            );
                        }
                    }
                }
                if llm_cfg.run_tests {
                    let command = llm_cfg
                    .test_command
                    .clone()
                    .unwrap_or_else(|| "cargo test".to_string());
                    let timeout = Duration::from_secs(llm_cfg.test_hook_timeout_seconds);
                    let outcome = hooks.run_tests(&working_dir, &command, timeout).await;
                    if !outcome.passed {
                        state.set_status(RepositoryStatus::Error);
                        let err = WorkflowError::TestFailed {
                            code: outcome.exit_code,
                            message: outcome.output_tail,
                        };
                        events.emit_error(state.repo_id.clone(), err.to_string());
                        return ActionOutcome::Error(err.to_string());
                    }
                }
                if llm_cfg.generate_commit_message {
                    state.set_status(RepositoryStatus::GeneratingCommit);
                    let path = working_dir.clone();
                    let summary = run_git(path, STATUS_TIMEOUT, |repo| GitEngine::generate_change_summary(repo))
                    .await
                    .unwrap_or_default();
                    template = hooks.generate_commit_message(&summary).await;
                }
            }
        }

        // Step 6: commit.
        state.set_status(RepositoryStatus::Committing);
        events.emit_status_changed(state.repo_id.clone(), RepositoryStatus::Committing.display());
        let path = working_dir.clone();
        let commit_hash = match run_git(path, COMMIT_TIMEOUT, move |repo| {
                GitEngine::perform_commit(repo, &template, now)
        })
        .await
        {
            Ok(hash) => hash,
            Err(err) => {
                state.set_status(RepositoryStatus::Error);
                events.emit_error(state.repo_id.clone(), err.to_string());
                return ActionOutcome::Error(err.to_string());
            }
        };
        let Some(commit_hash) = commit_hash else {
            state.finalize_successful_cycle();
            state.set_status(RepositoryStatus::Idle);
            events.emit_status_changed(state.repo_id.clone(), RepositoryStatus::Idle.display());
            return ActionOutcome::NoOp;
        };
        let short_hash = commit_hash.chars().take(7).collect::<String>();
        state.stats.commits += 1;
        state.last_commit.short_hash = Some(short_hash.clone());
        state.last_commit.timestamp = Some(now);
        events.emit_commit_created(state.repo_id.clone(), short_hash.clone());
        info!(repo_id = %state.repo_id, hash = %short_hash, "committed");

        // Step 7: push preflight.
        let path = working_dir.clone();
        let branch_name = engine.branch.clone();
        let preflight = run_git(path, PREFLIGHT_TIMEOUT, move |repo| {
                GitEngine::check_upstream_conflicts(repo, &branch_name)
        })
        .await;
        let preflight = match preflight {
            Ok(p) => p,
            Err(err) => {
                state.set_status(RepositoryStatus::Error);
                events.emit_error(state.repo_id.clone(), err.to_string());
                return ActionOutcome::Error(err.to_string());
            }
        };
        state.branch.has_upstream = preflight.has_upstream;
        state.branch.upstream_branch = preflight.upstream_branch.clone();
        state.branch.commits_ahead = preflight.ahead;
        state.branch.commits_behind = preflight.behind;

        if preflight.has_conflicts || preflight.diverged {
            breaker.lock().await.trigger_conflict(state, preflight.message.clone(), now);
            events.emit_circuit_breaker_triggered(state.repo_id.clone(), preflight.message.clone());
            self.notify_conflict(&preflight.message).await;
            return ActionOutcome::CommittedPushBlocked {
                short_hash,
                reason: preflight.message,
            };
        }

        // Step 8: push (I6: never attempted without an upstream).
        if !engine.auto_push || !preflight.has_upstream {
            state.finalize_successful_cycle();
            state.set_status(RepositoryStatus::Idle);
            events.emit_status_changed(state.repo_id.clone(), RepositoryStatus::Idle.display());
            return ActionOutcome::Committed { short_hash, pushed: false };
        }

        state.set_status(RepositoryStatus::Pushing);
        events.emit_status_changed(state.repo_id.clone(), RepositoryStatus::Pushing.display());
        let path = working_dir.clone();
        let remote = engine.remote.clone();
        let branch = engine.branch.clone();
        let push_result = run_git(path, PUSH_TIMEOUT, move |repo| GitEngine::perform_push(repo, &remote, &branch)).await;

        // Step 9: finalize. Push failure is non-fatal.
        state.finalize_successful_cycle();
        state.set_status(RepositoryStatus::Idle);
        events.emit_status_changed(state.repo_id.clone(), RepositoryStatus::Idle.display());

        match push_result {
            Ok(()) => {
                state.stats.pushes += 1;
                events.emit_push_completed(state.repo_id.clone());
                ActionOutcome::Committed { short_hash, pushed: true }
            }
            Err(err) => {
                warn!(repo_id = %state.repo_id, %err, "push failed, commit retained");
                events.emit_error(state.repo_id.clone(), format!("push failed: {err}"));
                ActionOutcome::Committed { short_hash, pushed: false }
            }
        }
    }

    async fn notify_conflict(&self, reason: &str) {
        self.notifications
        .notify(Notification {
                title: "Autosave halted".to_string(),
                body: reason.to_string(),
                urgency: Urgency::Critical,
        })
        .await;
    }
}

/// Run one blocking Git call against a fresh `Repository` handle, bounded
/// by `timeout` (all Git work runs off the cooperative scheduler).
async fn run_git<F, T>(path: PathBuf, timeout: Duration, f: F) -> Result<T, WorkflowError>
where
F: FnOnce(&Repository) -> Result<T, GitError> + Send + 'static,
T: Send + 'static,
{
    let join = tokio::task::spawn_blocking(move || -> Result<T, GitError> {
            let repo = GitEngine::open(&path)?;
            f(&repo)
    });
    match tokio::time::timeout(timeout, join).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(git_err))) => Err(WorkflowError::Status(git_err.to_string())),
        Ok(Err(join_err)) => Err(WorkflowError::Status(join_err.to_string())),
        Err(_) => Err(WorkflowError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NullNotificationSink;
    use std::fs;
    use supsrc_config::EngineConfig;
    use tempfile::TempDir;

    fn init_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        {
            let mut cfg = repo.config().unwrap();
            cfg.set_str("user.name", "Test User").unwrap();
            cfg.set_str("user.email", "test@example.com").unwrap();
        }
        (dir, repo.path().parent().unwrap_or(repo.path()).to_path_buf())
    }

    fn engine_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.auto_push = false;
        cfg
    }

    #[tokio::test]
    async fn guard_blocks_when_frozen() {
        let (_dir, path) = init_repo();
        let workflow = ActionWorkflow::new(Arc::new(NullNotificationSink), None);
        let breaker: SharedBreaker = Arc::new(Mutex::new(CircuitBreakerService::new(Utc::now())));
        let events = EventBroadcaster::new();
        let mut state = RepositoryState::new("r1".into());
        state.is_frozen = true;

        let engine = engine_config();
        let cb_cfg = supsrc_config::CircuitBreakerConfig::default();
        let outcome = workflow
        .execute_action_sequence(&mut state, &breaker, &events, path, &engine, &cb_cfg, None)
        .await;
        assert!(matches!(outcome, ActionOutcome::Guarded));
    }

    #[tokio::test]
    async fn full_cycle_commits_new_file_without_push() {
        let (dir, path) = init_repo();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();

        let workflow = ActionWorkflow::new(Arc::new(NullNotificationSink), None);
        let breaker: SharedBreaker = Arc::new(Mutex::new(CircuitBreakerService::new(Utc::now())));
        let events = EventBroadcaster::new();
        let mut state = RepositoryState::new("r1".into());
        state.record_event();

        let engine = engine_config();
        let cb_cfg = supsrc_config::CircuitBreakerConfig::default();
        let outcome = workflow
        .execute_action_sequence(&mut state, &breaker, &events, path, &engine, &cb_cfg, None)
        .await;

        match outcome {
            ActionOutcome::Committed { pushed,.. } => assert!(!pushed),
            other => panic!("expected Committed, got {other:?}"),
        }
        assert_eq!(state.status, RepositoryStatus::Idle);
        assert_eq!(state.save_count, 0);
        assert_eq!(state.counters, Default::default());
    }

    #[tokio::test]
    async fn clean_tree_reports_external_commit_detected() {
        let (dir, path) = init_repo();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        {
            let repo = Repository::open(&path).unwrap();
            GitEngine::stage_all(&repo).unwrap();
            GitEngine::perform_commit(&repo, "init", Utc::now()).unwrap();
        }

        let workflow = ActionWorkflow::new(Arc::new(NullNotificationSink), None);
        let breaker: SharedBreaker = Arc::new(Mutex::new(CircuitBreakerService::new(Utc::now())));
        let events = EventBroadcaster::new();
        let mut state = RepositoryState::new("r1".into());
        state.record_event();

        let engine = engine_config();
        let cb_cfg = supsrc_config::CircuitBreakerConfig::default();
        let outcome = workflow
        .execute_action_sequence(&mut state, &breaker, &events, path, &engine, &cb_cfg, None)
        .await;
        assert!(matches!(outcome, ActionOutcome::ExternalCommitDetected));
        assert_eq!(state.status, RepositoryStatus::ExternalCommitDetected);
    }

    #[tokio::test]
    async fn refresh_status_seeds_branch_without_starting_a_cycle() {
        let (dir, path) = init_repo();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let branch_name = {
            let repo = Repository::open(&path).unwrap();
            GitEngine::stage_all(&repo).unwrap();
            GitEngine::perform_commit(&repo, "init", Utc::now()).unwrap();
            GitEngine::current_branch(&repo).unwrap()
        };

        let workflow = ActionWorkflow::new(Arc::new(NullNotificationSink), None);
        let breaker: SharedBreaker = Arc::new(Mutex::new(CircuitBreakerService::new(Utc::now())));
        let events = EventBroadcaster::new();
        let mut state = RepositoryState::new("r1".into());
        let cb_cfg = supsrc_config::CircuitBreakerConfig::default();

        workflow.refresh_status(&mut state, &breaker, &events, path, &cb_cfg).await;

        assert_eq!(state.branch.current_branch.as_deref(), Some(branch_name.as_str()));
        assert_eq!(state.branch.previous_branch, None);
        assert!(!state.circuit_breaker.triggered);
        assert_eq!(state.status, RepositoryStatus::Idle);
    }
}
