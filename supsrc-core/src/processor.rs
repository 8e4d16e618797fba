//! Event processor (C8): the task that owns per-repo mutable state, drains
//! buffered filesystem events, arms/cancels inactivity timers, evaluates the
//! rule engine, and launches action-workflow cycles.
//!
//! State is split per repository (`Arc<Mutex<RepositoryState>>` per entry
//! rather than one lock over the whole map) so one repository's
//! multi-second commit/push cycle never stalls another's event processing.
//! Readers outside this task (the gRPC service) reach live state through
//! the same shared map rather than routing every status query through a
//! command channel.

use crate::buffer::{BufferedEvent, EventBuffer, RawEvent};
use crate::circuit_breaker::CircuitBreakerService;
use crate::events::EventBroadcaster;
use crate::hooks::{LlmHooks, NotificationSink};
use crate::persistence::{self, StateDocument};
use crate::rules;
use crate::state::RepositoryState;
use crate::watcher::WatcherLost;
use crate::workflow::{ActionOutcome, ActionWorkflow, SharedBreaker};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use supsrc_config::{CircuitBreakerConfig, GroupingMode, RepositoryConfig, Rule};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Applies `<repo>/.supsrc/state.json`'s `paused`/per-repo override onto a
/// freshly constructed `RepositoryState`, if such a file exists and parses.
/// A missing or invalid file leaves the default (unpaused) state untouched —
/// this is advisory recovery, not a fatal startup condition.
fn restore_persisted_pause(state: &mut RepositoryState, repo_root: &Path) {
    let path = persistence::shared_state_path(repo_root);
    if !path.exists() {
        return;
    }
    match StateDocument::load(&path) {
        Ok(doc) => {
            let repo_paused = doc
            .state
            .repositories
            .get(&state.repo_id)
            .map(|r| r.paused)
            .unwrap_or(false);
            state.is_paused = doc.state.paused || repo_paused;
        }
        Err(err) => {
            warn!(repo_id = %state.repo_id, %err, "failed to parse persisted state file, starting unpaused");
        }
    }
}

/// Processor tick cadence: drives `EventBuffer::tick` and the delayed
/// `EXTERNAL_COMMIT_DETECTED` -> IDLE auto-reset.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Post-operation quiescence delay after the coalescing window elapses
///.
const EVENT_QUIESCENCE: Duration = Duration::from_millis(150);

/// Debounce window for inactivity-timer rearm requests (§4.8 step 6, P2):
/// a burst of buffered events arriving within this window of each other
/// collapses into exactly one actual rearm instead of one per event.
const REARM_DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// The effective buffering settings for every repo this processor owns,
/// derived from `[global]`. The daemon has no TUI front end (out
/// of scope per Non-goals), so `event_grouping_mode_headless` is always the
/// one that applies.
#[derive(Debug, Clone, Copy)]
pub struct BufferSettings {
    pub mode: GroupingMode,
    pub window: Duration,
}

impl BufferSettings {
    pub fn from_global(global: &supsrc_config::GlobalConfig) -> Self {
        let mode = if global.event_buffering_enabled {
            global.event_grouping_mode_headless
        } else {
            GroupingMode::Off
        };
        Self {
            mode,
            window: Duration::from_millis(global.event_buffer_window_ms),
        }
    }
}

/// The live, externally-readable repository map shared with the gRPC
/// service: outer lock only contends on hot reload, inner lock only on one
/// repository's own mutation.
pub type SharedRepoMap = Arc<RwLock<HashMap<String, Arc<Mutex<RepositoryState>>>>>;

struct RepoRuntime {
    config: RepositoryConfig,
    state: Arc<Mutex<RepositoryState>>,
    buffer: EventBuffer,
    hooks: Option<Arc<dyn LlmHooks>>,
    timer_epoch: u64,
    /// When the inactivity timer was last actually rearmed, for the P2
    /// debounce gate in `rearm_inactivity_timer`.
    last_rearm_at: Option<Instant>,
}

/// Fired when a repo's inactivity timer reaches zero, tagged with the
/// epoch it was armed under so a stale timer (superseded by a rearm or
/// cancelled by a workflow start) is a cheap no-op instead of a bug.
struct TimerFired {
    repo_id: String,
    epoch: u64,
}

pub struct EventProcessor {
    repos: HashMap<String, RepoRuntime>,
    shared: SharedRepoMap,
    breaker: SharedBreaker,
    events: EventBroadcaster,
    notifications: Arc<dyn NotificationSink>,
    cb_config: CircuitBreakerConfig,
    buffer_settings: BufferSettings,

    raw_rx: mpsc::UnboundedReceiver<RawEvent>,
    raw_tx: mpsc::UnboundedSender<RawEvent>,
    lost_rx: mpsc::UnboundedReceiver<WatcherLost>,
    lost_tx: mpsc::UnboundedSender<WatcherLost>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    commands: mpsc::UnboundedReceiver<ProcessorCommand>,
}

/// Hot-reload and lifecycle operations routed through the processor's own
/// task, since it alone mutates `self.repos`.
pub enum ProcessorCommand {
    AddRepo {
        repo_id: String,
        config: RepositoryConfig,
        hooks: Option<Arc<dyn LlmHooks>>,
    },
    RemoveRepo {
        repo_id: String,
    },
    /// Apply an in-place settings change for a repo already being watched
    ///. A path change is
    /// not representable here; the orchestrator treats that as remove+add.
    UpdateRepoConfig {
        repo_id: String,
        config: RepositoryConfig,
    },
    /// Apply a new `[global.circuit_breaker]` snapshot to every repo handled
    /// by this processor.
    UpdateCircuitBreakerConfig {
        cb_config: CircuitBreakerConfig,
    },
    /// Apply new `[global]` event-buffering settings to every repo handled
    /// by this processor.
    UpdateBufferSettings {
        settings: BufferSettings,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl EventProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: EventBroadcaster,
        notifications: Arc<dyn NotificationSink>,
        cb_config: CircuitBreakerConfig,
        buffer_settings: BufferSettings,
        commands: mpsc::UnboundedReceiver<ProcessorCommand>,
        now: chrono::DateTime<Utc>,
    ) -> (
        Self,
        SharedRepoMap,
        SharedBreaker,
        mpsc::UnboundedSender<RawEvent>,
        mpsc::UnboundedSender<WatcherLost>,
    ) {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let shared: SharedRepoMap = Arc::new(RwLock::new(HashMap::new()));
        let breaker: SharedBreaker = Arc::new(Mutex::new(CircuitBreakerService::new(now)));

        let processor = Self {
            repos: HashMap::new(),
            shared: shared.clone(),
            breaker: breaker.clone(),
            events,
            notifications,
            cb_config,
            buffer_settings,
            raw_rx,
            raw_tx: raw_tx.clone(),
            lost_rx,
            lost_tx: lost_tx.clone(),
            timer_rx,
            timer_tx,
            commands,
        };
        (processor, shared, breaker, raw_tx, lost_tx)
    }

    /// A sender clone for `RepoWatcher::start`'s `raw_tx` argument, shared
    /// by every repository (events carry their own `repo_id`).
    pub fn raw_sender(&self) -> mpsc::UnboundedSender<RawEvent> {
        self.raw_tx.clone()
    }

    pub fn lost_sender(&self) -> mpsc::UnboundedSender<WatcherLost> {
        self.lost_tx.clone()
    }

    /// The main loop. Runs until a `Shutdown` command is received or every
    /// command sender is dropped.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => self.on_tick().await,
                Some(raw) = self.raw_rx.recv() => self.on_raw_event(raw).await,
                Some(lost) = self.lost_rx.recv() => self.on_watcher_lost(lost).await,
                Some(fired) = self.timer_rx.recv() => self.on_timer_fired(fired).await,
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ProcessorCommand::Shutdown { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(other) => self.handle_command(other).await,
                        None => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: ProcessorCommand) {
        match cmd {
            ProcessorCommand::AddRepo { repo_id, config, hooks } => self.add_repo(repo_id, config, hooks).await,
            ProcessorCommand::RemoveRepo { repo_id } => self.remove_repo(&repo_id).await,
            ProcessorCommand::UpdateRepoConfig { repo_id, config } => {
                if let Some(runtime) = self.repos.get_mut(&repo_id) {
                    runtime.config = config;
                }
            }
            ProcessorCommand::UpdateCircuitBreakerConfig { cb_config } => {
                self.cb_config = cb_config;
            }
            ProcessorCommand::UpdateBufferSettings { settings } => {
                self.buffer_settings = settings;
                for runtime in self.repos.values_mut() {
                    runtime.buffer.set_mode_and_window(settings.mode, settings.window);
                }
            }
            ProcessorCommand::Shutdown { .. } => unreachable!("handled in run()"),
        }
    }

    async fn add_repo(&mut self, repo_id: String, config: RepositoryConfig, hooks: Option<Arc<dyn LlmHooks>>) {
        let mut repo_state = RepositoryState::new(repo_id.clone());
        restore_persisted_pause(&mut repo_state, &config.path);
        let state = Arc::new(Mutex::new(repo_state));
        let buffer = EventBuffer::new(
            repo_id.clone(),
            self.buffer_settings.mode,
            self.buffer_settings.window,
            EVENT_QUIESCENCE,
        );
        let working_dir = config.path.clone();
        self.shared.write().await.insert(repo_id.clone(), state.clone());
        self.repos.insert(
            repo_id,
            RepoRuntime {
                config,
                state: state.clone(),
                buffer,
                hooks,
                timer_epoch: 0,
                last_rearm_at: None,
            },
        );

        // §4.9 startup "refresh initial status/summary": seeds
        // `previous_branch` so the branch-change detector has a baseline
        // before the first action cycle ever runs.
        let workflow = ActionWorkflow::new(self.notifications.clone(), None);
        let mut state = state.lock().await;
        workflow
        .refresh_status(&mut state, &self.breaker, &self.events, working_dir, &self.cb_config)
        .await;
    }

    async fn remove_repo(&mut self, repo_id: &str) {
        if let Some(runtime) = self.repos.remove(repo_id) {
            let mut state = runtime.state.lock().await;
            state.cancel_inactivity_timer();
        }
        self.shared.write().await.remove(repo_id);
    }

    async fn on_watcher_lost(&mut self, lost: WatcherLost) {
        warn!(repo_id = %lost.repo_id, "watcher lost, repository dropped from active processing");
        self.events.emit_watcher_lost(lost.repo_id.clone());
        self.remove_repo(&lost.repo_id).await;
    }

    async fn on_raw_event(&mut self, raw: RawEvent) {
        let repo_id = raw.repo_id.clone();
        let Some(runtime) = self.repos.get_mut(&repo_id) else {
            return;
        };
        if let Some(buffered) = runtime.buffer.push(raw) {
            self.handle_buffered_event(&repo_id, buffered).await;
        }
    }

    /// Drains every repo's buffer on the tick cadence (catches `simple`/
    /// `smart`-mode events whose coalescing window merely expired, with no
    /// new raw event to trigger an immediate flush) and checks the delayed
    /// `EXTERNAL_COMMIT_DETECTED` reset.
    async fn on_tick(&mut self) {
        let now_instant = Instant::now();
        let now = Utc::now();
        let repo_ids: Vec<String> = self.repos.keys().cloned().collect();
        for repo_id in repo_ids {
            let flushed = {
                let Some(runtime) = self.repos.get_mut(&repo_id) else { continue };
                runtime.buffer.tick(now_instant)
            };
            for buffered in flushed {
                self.handle_buffered_event(&repo_id, buffered).await;
            }

            let Some(runtime) = self.repos.get(&repo_id) else { continue };
            let due = {
                let mut state = runtime.state.lock().await;
                if state.external_commit_reset_due(now) {
                    state.clear_external_commit_reset();
                    true
                } else {
                    false
                }
            };
            if due {
                self.events.emit_status_changed(repo_id.clone(), "idle");
            }
        }
    }

    async fn handle_buffered_event(&mut self, repo_id: &str, buffered: BufferedEvent) {
        let Some(runtime) = self.repos.get_mut(repo_id) else { return };
        let now = Utc::now();

        let should_process = {
            let mut breaker = self.breaker.lock().await;
            let mut state = runtime.state.lock().await;
            breaker.should_process_event(&mut state, now)
        };
        if !should_process {
            debug!(repo_id, "event dropped, circuit breaker blocks processing");
            return;
        }

        let bulk_result = {
            let mut breaker = self.breaker.lock().await;
            let mut state = runtime.state.lock().await;
            breaker.check_and_update_bulk_change(&self.cb_config, &mut state, &buffered.path, now)
        };
        if let Err(signal) = &bulk_result {
            warn!(repo_id, %signal, "circuit breaker tripped (advisory, recovery already scheduled)");
            self.notifications_fire_and_forget(signal.to_string()).await;
        }

        {
            let mut state = runtime.state.lock().await;
            state.record_event();
            state.apply_buffered_change(buffered.primary_change_type);
            state.stats.events_processed += 1;
        }

        let (blocks, triggers_now) = {
            let state = runtime.state.lock().await;
            (state.blocks_new_workflow(), rules::should_trigger(&runtime.config.rule, &state))
        };
        if blocks {
            return;
        }

        if triggers_now {
            self.launch_workflow(repo_id).await;
            return;
        }

        if let Rule::Inactivity { period } = &runtime.config.rule {
            self.rearm_inactivity_timer(repo_id, period.0).await;
        }
    }

    async fn rearm_inactivity_timer(&mut self, repo_id: &str, period: Duration) {
        let Some(runtime) = self.repos.get_mut(repo_id) else { return };

        let now = Instant::now();
        if let Some(last) = runtime.last_rearm_at {
            if now.duration_since(last) < REARM_DEBOUNCE_WINDOW {
                // Still within the debounce window of the previous rearm;
                // the timer it armed is still live, so this request collapses
                // into it rather than cancelling and respawning again.
                return;
            }
        }
        runtime.last_rearm_at = Some(now);

        runtime.timer_epoch += 1;
        let epoch = runtime.timer_epoch;

        let (handle, mut cancel_rx) = crate::state::TimerHandle::new();
        {
            let mut state = runtime.state.lock().await;
            state.cancel_inactivity_timer();
            state.inactivity_timer = Some(handle);
            state.timer_total_seconds = Some(period.as_secs());
            state.timer_start_time = Some(Instant::now());
        }

        let timer_tx = self.timer_tx.clone();
        let repo_id = repo_id.to_string();
        tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        let _ = timer_tx.send(TimerFired { repo_id, epoch });
                    }
                    _ = cancel_rx.changed() => {}
                }
        });
    }

    async fn on_timer_fired(&mut self, fired: TimerFired) {
        let Some(runtime) = self.repos.get(&fired.repo_id) else { return };
        if runtime.timer_epoch != fired.epoch {
            return; // superseded by a rearm or a workflow that cancelled it.
        }
        let blocks = {
            let state = runtime.state.lock().await;
            state.blocks_new_workflow()
        };
        if blocks {
            return;
        }
        info!(repo_id = %fired.repo_id, "inactivity timer elapsed, launching action workflow");
        self.launch_workflow(&fired.repo_id).await;
    }

    /// Spawns the action workflow for one repository as its own task so a
    /// slow commit/push cycle on one repo never delays another's event
    /// processing. The per-repo `Mutex` is held for
    /// the whole cycle, which is safe because nothing else ever takes it
    /// except this processor and the gRPC read path (whose read is brief).
    async fn launch_workflow(&self, repo_id: &str) {
        let Some(runtime) = self.repos.get(repo_id) else { return };
        let state_handle = runtime.state.clone();
        let breaker = self.breaker.clone();
        let events = self.events.clone();
        let working_dir = runtime.config.path.clone();
        let engine = runtime.config.repository.clone();
        let llm = runtime.config.llm.clone();
        let workflow = ActionWorkflow::new(self.notifications.clone(), runtime.hooks.clone());
        let repo_id = repo_id.to_string();
        let cb_config = self.cb_config.clone();

        tokio::spawn(async move {
                let mut state = state_handle.lock().await;
                let outcome = workflow
                .execute_action_sequence(&mut state, &breaker, &events, working_dir, &engine, &cb_config, llm.as_ref())
                .await;
                match &outcome {
                    ActionOutcome::Error(message) => warn!(repo_id, %message, "action workflow cycle errored"),
                    ActionOutcome::Committed { short_hash, pushed } => {
                        info!(repo_id, hash = %short_hash, pushed, "action workflow cycle committed")
                    }
                    other => debug!(repo_id, ?other, "action workflow cycle finished"),
                }
        });
    }

    async fn notifications_fire_and_forget(&self, body: String) {
        self.notifications
        .notify(crate::hooks::Notification {
                title: "Circuit breaker".to_string(),
                body,
                urgency: crate::hooks::Urgency::Normal,
        })
        .await;
    }

    async fn shutdown(&mut self) {
        info!("event processor shutting down, cancelling timers");
        for runtime in self.repos.values() {
            let mut state = runtime.state.lock().await;
            state.cancel_inactivity_timer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NullNotificationSink;
    use crate::buffer::{RawEvent, RawEventKind};
    use supsrc_config::{EngineConfig, Rule};
    use std::path::PathBuf;

    fn repo_config(rule: Rule) -> RepositoryConfig {
        RepositoryConfig {
            path: PathBuf::from("/tmp/does-not-need-to-exist-for-this-test"),
            enabled: true,
            rule,
            repository: EngineConfig::default(),
            llm: None,
        }
    }

    #[test]
    fn restore_persisted_pause_applies_repo_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut doc = StateDocument::default();
        doc.state.repositories.insert(
            "r1".into(),
            persistence::RepoOverride {
                paused: true,
                ..Default::default()
            },
        );
        doc.save(&persistence::shared_state_path(dir.path())).unwrap();

        let mut state = RepositoryState::new("r1".into());
        restore_persisted_pause(&mut state, dir.path());
        assert!(state.is_paused);
    }

    #[test]
    fn restore_persisted_pause_leaves_default_when_file_absent() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut state = RepositoryState::new("r1".into());
        restore_persisted_pause(&mut state, dir.path());
        assert!(!state.is_paused);
    }

    #[test]
    fn buffer_settings_from_global_honors_disabled_flag() {
        let mut global = supsrc_config::GlobalConfig::default();
        global.event_buffer_window_ms = 250;
        global.event_grouping_mode_headless = supsrc_config::GroupingMode::Simple;

        let enabled = BufferSettings::from_global(&global);
        assert_eq!(enabled.mode, supsrc_config::GroupingMode::Simple);
        assert_eq!(enabled.window, Duration::from_millis(250));

        global.event_buffering_enabled = false;
        let disabled = BufferSettings::from_global(&global);
        assert_eq!(disabled.mode, supsrc_config::GroupingMode::Off);
    }

    #[tokio::test]
    async fn rearm_debounces_a_burst_into_a_single_timer() {
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (mut processor, _shared, _breaker, _raw_tx, _lost_tx) = EventProcessor::new(
            EventBroadcaster::new(),
            Arc::new(NullNotificationSink),
            supsrc_config::CircuitBreakerConfig::default(),
            BufferSettings { mode: supsrc_config::GroupingMode::Smart, window: Duration::from_millis(100) },
            cmd_rx,
            Utc::now(),
        );

        processor
        .add_repo(
            "r1".into(),
            repo_config(Rule::Inactivity {
                period: supsrc_config::DurationLiteral(Duration::from_secs(30)),
            }),
            None,
        )
        .await;

        processor.rearm_inactivity_timer("r1", Duration::from_secs(30)).await;
        processor.rearm_inactivity_timer("r1", Duration::from_secs(30)).await;
        processor.rearm_inactivity_timer("r1", Duration::from_secs(30)).await;

        assert_eq!(processor.repos.get("r1").unwrap().timer_epoch, 1);
    }

    #[tokio::test]
    async fn save_count_rule_triggers_workflow_spawn_without_panicking() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (processor, shared, _breaker, raw_tx, _lost_tx) =
        EventProcessor::new(
            EventBroadcaster::new(),
            Arc::new(NullNotificationSink),
            supsrc_config::CircuitBreakerConfig::default(),
            BufferSettings { mode: supsrc_config::GroupingMode::Smart, window: Duration::from_millis(100) },
            cmd_rx,
            Utc::now(),
        );

        cmd_tx
        .send(ProcessorCommand::AddRepo {
                repo_id: "r1".into(),
                config: repo_config(Rule::SaveCount { count: 1 }),
                hooks: None,
        })
        .unwrap();

        let handle = tokio::spawn(processor.run());

        // give the processor a turn to register the repo.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(shared.read().await.contains_key("r1"));

        raw_tx
        .send(RawEvent {
                repo_id: "r1".into(),
                kind: RawEventKind::Modified,
                path: "a.txt".into(),
                is_directory: false,
                at: Instant::now(),
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx.send(ProcessorCommand::Shutdown { reply: reply_tx }).unwrap();
        reply_rx.await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn remove_repo_drops_it_from_the_shared_map() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (processor, shared, _breaker, _raw_tx, _lost_tx) =
        EventProcessor::new(
            EventBroadcaster::new(),
            Arc::new(NullNotificationSink),
            supsrc_config::CircuitBreakerConfig::default(),
            BufferSettings { mode: supsrc_config::GroupingMode::Smart, window: Duration::from_millis(100) },
            cmd_rx,
            Utc::now(),
        );
        let handle = tokio::spawn(processor.run());

        cmd_tx
        .send(ProcessorCommand::AddRepo {
                repo_id: "r1".into(),
                config: repo_config(Rule::Manual),
                hooks: None,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(shared.read().await.contains_key("r1"));

        cmd_tx.send(ProcessorCommand::RemoveRepo { repo_id: "r1".into() }).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!shared.read().await.contains_key("r1"));

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx.send(ProcessorCommand::Shutdown { reply: reply_tx }).unwrap();
        reply_rx.await.unwrap();
        handle.await.unwrap();
    }
}
