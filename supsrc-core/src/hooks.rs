//! Pluggable LLM and notification hooks.
//!
//! The concrete hook implementations (which model to call, which
//! notification backend to shell out to) are a collaborator out of scope
//! for this crate; what lives here is the contract the action workflow
//! drives. Notifications are one-way and best-effort: a failing or slow
//! sink must never block or fail a commit/push cycle.

use async_trait::async_trait;
use std::time::Duration;

/// Outcome of `review_changes`: either the hook is satisfied, or it vetoes
/// the cycle with a human-readable reason.
#[derive(Debug, Clone)]
pub enum ReviewOutcome {
    Approved,
    Vetoed { reason: String },
}

/// Outcome of `run_tests`.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub exit_code: Option<i32>,
    pub passed: bool,
    pub output_tail: String,
}

/// The hook surface an engine consults before committing, when
/// `llm.enabled` is set.
#[async_trait]
pub trait LlmHooks: Send + Sync {
    /// Review the working diff; veto halts the cycle with ERROR.
    async fn review_changes(&self, diff: &str) -> ReviewOutcome;

    /// Run the configured (or inferred) test command in `working_dir`.
    async fn run_tests(&self, working_dir: &std::path::Path, command: &str, timeout: Duration) -> TestOutcome;

    /// Produce a commit message template; the caller still substitutes
    /// `{{change_summary}}` into the result.
    async fn generate_commit_message(&self, change_summary: &str) -> String;
}

/// Notification urgency levels (desktop notification hook).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Normal,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub urgency: Urgency,
}

/// One-way, best-effort, never-blocking notification sink.
/// Implementations must not propagate delivery failures back to the
/// workflow; they log and swallow them.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// A sink that drops every notification, used in tests and wherever no
/// delivery of any kind is wanted.
pub struct NullNotificationSink;

#[async_trait]
impl NotificationSink for NullNotificationSink {
    async fn notify(&self, _notification: Notification) {}
}

/// Default sink: logs every notification via `tracing` instead of spawning a
/// desktop backend (out of scope per spec Non-goals — "desktop notification
/// spawning" implementation is a collaborator, this crate only owns the
/// contract). Never blocks, never fails.
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, notification: Notification) {
        match notification.urgency {
            Urgency::Critical => {
                tracing::error!(title = %notification.title, body = %notification.body, "notification")
            }
            Urgency::Normal => {
                tracing::info!(title = %notification.title, body = %notification.body, "notification")
            }
            Urgency::Low => {
                tracing::debug!(title = %notification.title, body = %notification.body, "notification")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_sink_never_panics() {
        let sink = NullNotificationSink;
        sink.notify(Notification {
                title: "t".into(),
                body: "b".into(),
                urgency: Urgency::Normal,
        })
        .await;
    }

    #[tokio::test]
    async fn tracing_sink_never_panics_at_any_urgency() {
        let sink = TracingNotificationSink;
        for urgency in [Urgency::Low, Urgency::Normal, Urgency::Critical] {
            sink.notify(Notification {
                    title: "t".into(),
                    body: "b".into(),
                    urgency,
            })
            .await;
        }
    }
}
