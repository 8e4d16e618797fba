//! Event buffer (C2): coalesces a burst of raw filesystem notifications into
//! one logical `BufferedEvent` per window.
//!
//! One buffer instance is owned per repository, mirroring the one-watcher-
//! per-repo rule of `watcher.rs`. `tick()` is driven by the event processor's
//! own timer, not a background task, so the whole buffer is a pure state
//! machine: no I/O, no async, fully unit-testable.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use supsrc_config::GroupingMode;

/// A single filesystem notification, already filtered by `watcher.rs`.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub repo_id: String,
    pub kind: RawEventKind,
    pub path: String,
    pub is_directory: bool,
    pub at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEventKind {
    Created,
    Modified,
    Deleted,
    Moved { src: String },
}

/// What kind of logical operation a `BufferedEvent` represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Single,
    Grouped,
    AtomicRewrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

/// The coalesced event the rule engine and action workflow actually see.
#[derive(Debug, Clone)]
pub struct BufferedEvent {
    pub repo_id: String,
    pub path: String,
    pub operation_type: OperationType,
    pub event_count: u32,
    pub primary_change_type: ChangeType,
}

struct PendingEntry {
    event_count: u32,
    primary_change_type: ChangeType,
    operation_type: OperationType,
    last_activity: Instant,
    /// Set while this entry represents an unfinished temp file (smart mode
    /// only); such entries are never flushed as atomic rewrites, only as
    /// themselves once the window expires ("temp-file events are).
    is_pending_temp: bool,
}

/// Per-repository coalescing buffer.
pub struct EventBuffer {
    repo_id: String,
    mode: GroupingMode,
    window: Duration,
    quiescence: Duration,
    pending: HashMap<String, PendingEntry>,
}

impl EventBuffer {
    pub fn new(repo_id: impl Into<String>, mode: GroupingMode, window: Duration, quiescence: Duration) -> Self {
        Self {
            repo_id: repo_id.into(),
            mode,
            window,
            quiescence,
            pending: HashMap::new(),
        }
    }

    /// Feed one raw event. In `off` mode this returns the event immediately;
    /// in `simple`/`smart` mode it's absorbed into `pending` and surfaced
    /// later via `tick()`.
    pub fn push(&mut self, event: RawEvent) -> Option<BufferedEvent> {
        if event.is_directory {
            return None;
        }

        if self.mode == GroupingMode::Off {
            return Some(BufferedEvent {
                    repo_id: event.repo_id,
                    path: event.path,
                    operation_type: OperationType::Single,
                    event_count: 1,
                    primary_change_type: change_type_of(&event.kind),
            });
        }

        if self.mode == GroupingMode::Smart {
            if is_swap_pattern(&event.path) {
                return None;
            }
            if let RawEventKind::Moved { src } = &event.kind {
                if is_swap_pattern(src) {
                    return None;
                }
                if is_temp_pattern(src) {
                    // Finalizing move of an atomic-save sequence: discard
                    // any shadow entry for the temp source, and overwrite
                    // whatever was pending for the destination (covers both
                    // `created(T)->modified(T)*->moved(T->F)` and
                    // `created(T)->deleted(F)->moved(T->F)`).
                    self.pending.remove(src);
                    self.pending.insert(
                        event.path.clone(),
                        PendingEntry {
                            event_count: 1,
                            primary_change_type: ChangeType::Modified,
                            operation_type: OperationType::AtomicRewrite,
                            last_activity: event.at,
                            is_pending_temp: false,
                        },
                    );
                    return None;
                }
            }
            if matches!(event.kind, RawEventKind::Created) && is_temp_pattern(&event.path) {
                let entry = self.pending.entry(event.path.clone()).or_insert(PendingEntry {
                        event_count: 0,
                        primary_change_type: ChangeType::Created,
                        operation_type: OperationType::Single,
                        last_activity: event.at,
                        is_pending_temp: true,
                });
                entry.event_count += 1;
                entry.last_activity = event.at;
                return None;
            }
        }

        let entry = self.pending.entry(event.path.clone()).or_insert(PendingEntry {
                event_count: 0,
                primary_change_type: ChangeType::Modified,
                operation_type: OperationType::Grouped,
                last_activity: event.at,
                is_pending_temp: false,
        });
        entry.event_count += 1;
        entry.primary_change_type = change_type_of(&event.kind);
        entry.last_activity = event.at;
        if entry.is_pending_temp && matches!(event.kind, RawEventKind::Modified) {
            // Temp file still being written to; stays held.
            entry.is_pending_temp = true;
        } else {
            entry.is_pending_temp = false;
        }
        None
    }

    /// Flush every entry whose window plus quiescence delay has elapsed.
    /// Called on the processor's own periodic tick, never by a background
    /// timer owned by the buffer itself.
    pub fn tick(&mut self, now: Instant) -> Vec<BufferedEvent> {
        let deadline = self.window + self.quiescence;
        let expired: Vec<String> = self
        .pending
        .iter()
        .filter(|(_, entry)| now.duration_since(entry.last_activity) >= deadline)
        .map(|(path, _)| path.clone())
        .collect();

        let mut out = Vec::with_capacity(expired.len());
        for path in expired {
            let entry = self.pending.remove(&path).expect("key from iteration above");
            out.push(BufferedEvent {
                    repo_id: self.repo_id.clone(),
                    path,
                    operation_type: entry.operation_type,
                    event_count: entry.event_count,
                    primary_change_type: entry.primary_change_type,
            });
        }
        out
    }

    /// Force-emit every pending entry regardless of window, for use at
    /// shutdown.
    pub fn flush_all(&mut self) -> Vec<BufferedEvent> {
        self.pending
        .drain()
        .map(|(path, entry)| BufferedEvent {
                repo_id: self.repo_id.clone(),
                path,
                operation_type: entry.operation_type,
                event_count: entry.event_count,
                primary_change_type: entry.primary_change_type,
        })
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply a hot-reloaded `[global]` buffering setting. Only
    /// affects events received from now on; entries already pending keep
    /// flushing on the old window.
    pub fn set_mode_and_window(&mut self, mode: GroupingMode, window: Duration) {
        self.mode = mode;
        self.window = window;
    }
}

fn change_type_of(kind: &RawEventKind) -> ChangeType {
    match kind {
        RawEventKind::Created => ChangeType::Created,
        RawEventKind::Modified => ChangeType::Modified,
        RawEventKind::Deleted => ChangeType::Deleted,
        RawEventKind::Moved { .. } => ChangeType::Modified,
    }
}

/// `*.tmp`, `*.tmp.<suffix>`, `.<name>.tmp.<suffix>`, `<name>~`.
fn is_temp_pattern(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    if name.ends_with('~') {
        return true;
    }
    if name.contains(".tmp.") || name.ends_with(".tmp") {
        return true;
    }
    false
}

/// `.*.swp`, `.*.swx` editor swap files.
fn is_swap_pattern(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.starts_with('.') && (name.ends_with(".swp") || name.ends_with(".swx"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(kind: RawEventKind, path: &str, at: Instant) -> RawEvent {
        RawEvent {
            repo_id: "r1".into(),
            kind,
            path: path.into(),
            is_directory: false,
            at,
        }
    }

    #[test]
    fn off_mode_passes_every_event_through() {
        let mut buf = EventBuffer::new("r1", GroupingMode::Off, Duration::from_millis(100), Duration::from_millis(150));
        let now = Instant::now();
        let out = buf.push(raw(RawEventKind::Modified, "a.txt", now));
        assert!(out.is_some());
        assert_eq!(out.unwrap().operation_type, OperationType::Single);
    }

    #[test]
    fn simple_mode_groups_by_path_until_window_elapses() {
        let mut buf = EventBuffer::new("r1", GroupingMode::Simple, Duration::from_millis(100), Duration::from_millis(50));
        let t0 = Instant::now();
        assert!(buf.push(raw(RawEventKind::Modified, "a.txt", t0)).is_none());
        assert!(buf
            .push(raw(RawEventKind::Modified, "a.txt", t0 + Duration::from_millis(10)))
            .is_none());

        let too_soon = buf.tick(t0 + Duration::from_millis(120));
        assert!(too_soon.is_empty());

        let flushed = buf.tick(t0 + Duration::from_millis(10) + Duration::from_millis(151));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].event_count, 2);
        assert_eq!(flushed[0].path, "a.txt");
    }

    #[test]
    fn smart_mode_collapses_atomic_rewrite_and_hides_temp_path() {
        let mut buf = EventBuffer::new("r1", GroupingMode::Smart, Duration::from_millis(100), Duration::from_millis(50));
        let t0 = Instant::now();

        buf.push(raw(RawEventKind::Created, "config.py.tmp.abc", t0));
        buf.push(raw(
                RawEventKind::Modified,
                "config.py.tmp.abc",
                t0 + Duration::from_millis(5),
        ));
        let moved = buf.push(raw(
                RawEventKind::Moved {
                    src: "config.py.tmp.abc".into(),
                },
                "config.py",
                t0 + Duration::from_millis(10),
        ));
        assert!(moved.is_none());

        let flushed = buf.tick(t0 + Duration::from_millis(10) + Duration::from_millis(151));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].path, "config.py");
        assert_eq!(flushed[0].operation_type, OperationType::AtomicRewrite);
        assert!(!flushed.iter().any(|e| e.path == "config.py.tmp.abc"));
    }

    #[test]
    fn swap_files_are_swallowed_entirely() {
        let mut buf = EventBuffer::new("r1", GroupingMode::Smart, Duration::from_millis(100), Duration::from_millis(50));
        let t0 = Instant::now();
        buf.push(raw(RawEventKind::Created, ".config.py.swp", t0));
        buf.push(raw(RawEventKind::Modified, ".config.py.swp", t0 + Duration::from_millis(5)));
        buf.push(raw(RawEventKind::Deleted, ".config.py.swp", t0 + Duration::from_millis(10)));
        assert!(buf.is_empty());
        let flushed = buf.tick(t0 + Duration::from_secs(1));
        assert!(flushed.is_empty());
    }

    #[test]
    fn incomplete_temp_sequence_emits_as_individual_event_on_expiry() {
        let mut buf = EventBuffer::new("r1", GroupingMode::Smart, Duration::from_millis(100), Duration::from_millis(50));
        let t0 = Instant::now();
        buf.push(raw(RawEventKind::Created, "draft.tmp", t0));

        let flushed = buf.tick(t0 + Duration::from_millis(151));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].path, "draft.tmp");
        assert_eq!(flushed[0].operation_type, OperationType::Single);
    }

    #[test]
    fn flush_all_drains_pending_regardless_of_window() {
        let mut buf = EventBuffer::new("r1", GroupingMode::Simple, Duration::from_secs(30), Duration::from_secs(30));
        buf.push(raw(RawEventKind::Modified, "a.txt", Instant::now()));
        assert!(!buf.is_empty());
        let flushed = buf.flush_all();
        assert_eq!(flushed.len(), 1);
        assert!(buf.is_empty());
    }
}
