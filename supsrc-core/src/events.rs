//! Internal event broadcaster feeding `SubscribeEvents`.
//!
//! A thin wrapper over `tokio::sync::broadcast` carrying the
//! `DaemonEvent{repo_id, kind, detail}` wire message defined in
//! `supsrc-proto`; late subscribers simply miss events published before
//! they subscribed.

use std::sync::Arc;
use supsrc_proto::daemon::DaemonEvent;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fan-out broadcaster shared by every repo's event processor and the
/// gRPC `SubscribeEvents` handler.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<Arc<DaemonEvent>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DaemonEvent>> {
        self.sender.subscribe()
    }

    fn emit(&self, repo_id: impl Into<String>, kind: &str, detail: impl Into<String>) {
        let _ = self.sender.send(Arc::new(DaemonEvent {
                    repo_id: repo_id.into(),
                    kind: kind.to_string(),
                    detail: detail.into(),
        }));
    }

    pub fn emit_status_changed(&self, repo_id: impl Into<String>, status: &str) {
        self.emit(repo_id, "status_changed", status.to_string());
    }

    pub fn emit_circuit_breaker_triggered(&self, repo_id: impl Into<String>, reason: impl Into<String>) {
        self.emit(repo_id, "circuit_breaker_triggered", reason);
    }

    pub fn emit_circuit_breaker_acknowledged(&self, repo_id: impl Into<String>) {
        self.emit(repo_id, "circuit_breaker_acknowledged", "");
    }

    pub fn emit_commit_created(&self, repo_id: impl Into<String>, short_hash: impl Into<String>) {
        self.emit(repo_id, "commit_created", short_hash);
    }

    pub fn emit_push_completed(&self, repo_id: impl Into<String>) {
        self.emit(repo_id, "push_completed", "");
    }

    pub fn emit_error(&self, repo_id: impl Into<String>, message: impl Into<String>) {
        self.emit(repo_id, "error", message);
    }

    pub fn emit_watcher_lost(&self, repo_id: impl Into<String>) {
        self.emit(repo_id, "watcher_lost", "");
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_without_subscribers_does_not_error() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.emit_status_changed("repo-a", "idle");
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let broadcaster = EventBroadcaster::new();
        let mut rx = broadcaster.subscribe();
        broadcaster.emit_commit_created("repo-a", "abc1234");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.repo_id, "repo-a");
        assert_eq!(event.kind, "commit_created");
        assert_eq!(event.detail, "abc1234");
    }
}
