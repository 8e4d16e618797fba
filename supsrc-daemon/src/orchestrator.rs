//! Orchestrator (C9): process-level lifecycle. Owns the config snapshot, the
//! `repo_id -> watcher` map, the event queue, and the shutdown signal.
//!
//! Startup ensures the data directory, spawns the event processor, and
//! starts a watcher per enabled repository in one function; hot reload
//! diffs the old and new config by repository so added/removed/moved/
//! changed repos are each handled distinctly.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use supsrc_config::{Config, RepositoryConfig};
use supsrc_core::events::EventBroadcaster;
use supsrc_core::hooks::TracingNotificationSink;
use supsrc_core::processor::{BufferSettings, EventProcessor, ProcessorCommand, SharedRepoMap};
use supsrc_core::watcher::RepoWatcher;
use supsrc_core::workflow::SharedBreaker;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};

/// Live handles the orchestrator needs to read status and hot-reload, all
/// cheap to clone ("no strong cycles", downstream components hold).
#[derive(Clone)]
pub struct DaemonHandles {
    pub shared: SharedRepoMap,
    pub breaker: SharedBreaker,
    pub events: EventBroadcaster,
    pub cmd_tx: mpsc::UnboundedSender<ProcessorCommand>,
    pub config: Arc<RwLock<Config>>,
}

pub struct Orchestrator {
    handles: DaemonHandles,
    watchers: HashMap<String, RepoWatcher>,
    raw_tx: mpsc::UnboundedSender<supsrc_core::buffer::RawEvent>,
    lost_tx: mpsc::UnboundedSender<supsrc_core::watcher::WatcherLost>,
    processor_task: Option<tokio::task::JoinHandle<()>>,
}

impl Orchestrator {
    /// Startup : load config, spawn the event processor, start a
    /// watcher per enabled repository, refresh nothing synchronously (the
    /// processor's own status step does that on the first action cycle).
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let events = EventBroadcaster::new();
        let (processor, shared, breaker, raw_tx, lost_tx) = EventProcessor::new(
            events.clone(),
            Arc::new(TracingNotificationSink),
            config.global.circuit_breaker.clone(),
            BufferSettings::from_global(&config.global),
            cmd_rx,
            Utc::now(),
        );
        let processor_task = tokio::spawn(processor.run());

        let handles = DaemonHandles {
            shared,
            breaker,
            events,
            cmd_tx,
            config: Arc::new(RwLock::new(config.clone())),
        };

        let mut orchestrator = Self {
            handles,
            watchers: HashMap::new(),
            raw_tx,
            lost_tx,
            processor_task: Some(processor_task),
        };

        for (repo_id, repo_config) in &config.repositories {
            if repo_config.enabled {
                orchestrator.add_repo(repo_id.clone(), repo_config.clone()).await;
            }
        }

        Ok(orchestrator)
    }

    pub fn handles(&self) -> DaemonHandles {
        self.handles.clone()
    }

    async fn add_repo(&mut self, repo_id: String, config: RepositoryConfig) {
        match RepoWatcher::start(repo_id.clone(), config.path.clone(), self.raw_tx.clone(), self.lost_tx.clone()) {
            Ok(watcher) => {
                self.watchers.insert(repo_id.clone(), watcher);
                let _ = self.handles.cmd_tx.send(ProcessorCommand::AddRepo {
                        repo_id: repo_id.clone(),
                        config,
                        hooks: None,
                });
                info!(repo_id, "repository now watched");
            }
            Err(err) => {
                warn!(repo_id, %err, "failed to start watcher, repository not added");
            }
        }
    }

    async fn remove_repo(&mut self, repo_id: &str) {
        self.watchers.remove(repo_id);
        let _ = self.handles.cmd_tx.send(ProcessorCommand::RemoveRepo {
                repo_id: repo_id.to_string(),
        });
        info!(repo_id, "repository removed from watching");
    }

    /// Hot reload : added repos start watching, removed repos
    /// stop, changed settings apply in place unless the path changed (then
    /// treated as remove + add).
    pub async fn reload(&mut self, new_config: Config) {
        let old_config = self.handles.config.read().await.clone();

        for (repo_id, old_repo) in &old_config.repositories {
            match new_config.repositories.get(repo_id) {
                None => self.remove_repo(repo_id).await,
                Some(new_repo) if !new_repo.enabled && old_repo.enabled => self.remove_repo(repo_id).await,
                Some(new_repo) if new_repo.path != old_repo.path => {
                    self.remove_repo(repo_id).await;
                    if new_repo.enabled {
                        self.add_repo(repo_id.clone(), new_repo.clone()).await;
                    }
                }
                Some(new_repo) if new_repo.enabled && !old_repo.enabled => {
                    self.add_repo(repo_id.clone(), new_repo.clone()).await;
                }
                Some(new_repo) => {
                    let _ = self.handles.cmd_tx.send(ProcessorCommand::UpdateRepoConfig {
                            repo_id: repo_id.clone(),
                            config: new_repo.clone(),
                    });
                }
            }
        }

        for (repo_id, new_repo) in &new_config.repositories {
            if !old_config.repositories.contains_key(repo_id) && new_repo.enabled {
                self.add_repo(repo_id.clone(), new_repo.clone()).await;
            }
        }

        if new_config.global.circuit_breaker != old_config.global.circuit_breaker {
            let _ = self.handles.cmd_tx.send(ProcessorCommand::UpdateCircuitBreakerConfig {
                    cb_config: new_config.global.circuit_breaker.clone(),
            });
        }

        if new_config.global.event_buffering_enabled != old_config.global.event_buffering_enabled
        || new_config.global.event_grouping_mode_headless != old_config.global.event_grouping_mode_headless
        || new_config.global.event_buffer_window_ms != old_config.global.event_buffer_window_ms
        {
            let _ = self.handles.cmd_tx.send(ProcessorCommand::UpdateBufferSettings {
                    settings: BufferSettings::from_global(&new_config.global),
            });
        }

        *self.handles.config.write().await = new_config;
        info!("configuration hot-reloaded");
    }

    /// Shutdown : stop watchers, cancel timers and pending
    /// actions via the processor's own `Shutdown` command, drain to
    /// completion or a 5s timeout.
    pub async fn shutdown(mut self) {
        self.watchers.clear();

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.handles.cmd_tx.send(ProcessorCommand::Shutdown { reply: reply_tx }).is_ok() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), reply_rx).await;
        }

        if let Some(task) = self.processor_task.take() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), task).await;
        }
        info!("orchestrator shut down");
    }
}
